use std::fmt;

use serde::Serialize;

/// Bytes inspected for markup and delimiters.
pub const SAMPLE_BYTES: usize = 2048;
/// Payloads longer than this must show CSV structure to be accepted.
pub const SHORT_PAYLOAD_BYTES: usize = 100;

const HTML_CONTENT_TYPES: [&str; 2] = ["text/html", "application/xhtml"];
const HTML_MARKERS: [&str; 8] = [
    "<!doctype",
    "<html",
    "<head",
    "<body",
    "<meta",
    "<title",
    "<script",
    "<div",
];
const TRUSTED_CONTENT_TYPES: [&str; 4] = [
    "text/csv",
    "application/csv",
    "application/octet-stream",
    "application/x-csv",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Csv,
    NotCsv,
}

/// Why a payload was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    HtmlContentType,
    HtmlMarkup,
    NoDelimiters,
    TrustedContentType,
    Delimited,
    MultiLine,
    ShortPayload,
    Unstructured,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Csv => "csv",
            Verdict::NotCsv => "not-csv",
        }
    }
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::HtmlContentType => "html-content-type",
            Reason::HtmlMarkup => "html-markup",
            Reason::NoDelimiters => "no-delimiters",
            Reason::TrustedContentType => "trusted-content-type",
            Reason::Delimited => "delimited",
            Reason::MultiLine => "multi-line",
            Reason::ShortPayload => "short-payload",
            Reason::Unstructured => "unstructured",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub verdict: Verdict,
    pub reason: Reason,
}

impl Classification {
    fn csv(reason: Reason) -> Self {
        Self {
            verdict: Verdict::Csv,
            reason,
        }
    }

    fn rejected(reason: Reason) -> Self {
        Self {
            verdict: Verdict::NotCsv,
            reason,
        }
    }

    pub fn is_csv(&self) -> bool {
        self.verdict == Verdict::Csv
    }
}

/// Decides whether an export response is a real CSV or a login/error page.
///
/// Portals commonly answer an export request from an expired session with a
/// `200` HTML page, so the status code alone is not enough.
pub fn classify(bytes: &[u8], content_type: &str) -> Classification {
    let content_type = content_type.to_ascii_lowercase();
    if HTML_CONTENT_TYPES
        .iter()
        .any(|html| content_type.contains(html))
    {
        return Classification::rejected(Reason::HtmlContentType);
    }

    let sample_len = bytes.len().min(SAMPLE_BYTES);
    let sample = String::from_utf8_lossy(&bytes[..sample_len]);
    let sample = sample.trim().to_lowercase();

    if HTML_MARKERS.iter().any(|marker| sample.contains(marker)) {
        return Classification::rejected(Reason::HtmlMarkup);
    }

    let has_delimiters = sample.contains([',', ';', '\t', '|']);
    let has_newlines = sample.contains(['\n', '\r']);

    if !has_delimiters && bytes.len() > SHORT_PAYLOAD_BYTES {
        return Classification::rejected(Reason::NoDelimiters);
    }

    if TRUSTED_CONTENT_TYPES
        .iter()
        .any(|trusted| content_type.contains(trusted))
    {
        return Classification::csv(Reason::TrustedContentType);
    }

    if has_delimiters {
        Classification::csv(Reason::Delimited)
    } else if has_newlines {
        Classification::csv(Reason::MultiLine)
    } else if bytes.len() < SHORT_PAYLOAD_BYTES {
        Classification::csv(Reason::ShortPayload)
    } else {
        Classification::rejected(Reason::Unstructured)
    }
}

pub fn ensure_csv(bytes: &[u8], content_type: &str) -> bool {
    classify(bytes, content_type).is_csv()
}
