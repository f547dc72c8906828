use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// A way of finding one element on the page, parsed from a selector string.
///
/// Accepted forms:
/// - plain CSS: `input[name="email"]`
/// - XPath: `xpath=//button[@type="submit"]`, or anything starting with `//` or `(//`
/// - text: `text=Accept cookies` (quotes around the text are optional)
/// - CSS filtered by text: `button:has-text("Sign in")`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    raw: String,
    kind: LocatorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorKind {
    Css(String),
    XPath(String),
    Text(String),
    CssWithText { css: String, text: String },
}

fn has_text_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^(?P<css>.*?):has-text\((?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')\)$"#)
            .expect("has-text pattern is valid")
    })
}

impl Locator {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let kind = if let Some(rest) = trimmed.strip_prefix("xpath=") {
            LocatorKind::XPath(rest.trim().to_string())
        } else if trimmed.starts_with("//") || trimmed.starts_with("(//") {
            LocatorKind::XPath(trimmed.to_string())
        } else if let Some(rest) = trimmed.strip_prefix("text=") {
            LocatorKind::Text(strip_quotes(rest.trim()).to_string())
        } else if let Some(captures) = has_text_pattern().captures(trimmed) {
            let text = captures
                .name("dq")
                .or_else(|| captures.name("sq"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let css = captures
                .name("css")
                .map(|m| m.as_str().trim())
                .filter(|css| !css.is_empty())
                .unwrap_or("*");
            LocatorKind::CssWithText {
                css: css.to_string(),
                text: text.to_string(),
            }
        } else {
            LocatorKind::Css(trimmed.to_string())
        };
        Self {
            raw: trimmed.to_string(),
            kind,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &LocatorKind {
        &self.kind
    }

    /// Serializable description consumed by the in-page resolver script.
    pub(crate) fn spec(&self, token: &str) -> LocatorSpec {
        let (kind, css, xpath, text) = match &self.kind {
            LocatorKind::Css(css) => ("css", Some(css.clone()), None, None),
            LocatorKind::XPath(xpath) => ("xpath", None, Some(xpath.clone()), None),
            LocatorKind::Text(text) => ("text", None, None, Some(text.clone())),
            LocatorKind::CssWithText { css, text } => {
                ("text", Some(css.clone()), None, Some(text.clone()))
            }
        };
        LocatorSpec {
            kind,
            css,
            xpath,
            text,
            token: token.to_string(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Locator::parse(value)
    }
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LocatorSpec {
    pub kind: &'static str,
    pub css: Option<String>,
    pub xpath: Option<String>,
    pub text: Option<String>,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_css() {
        let locator = Locator::parse(" input[type=\"email\"] ");
        assert_eq!(locator.as_str(), "input[type=\"email\"]");
        assert_eq!(
            locator.kind(),
            &LocatorKind::Css("input[type=\"email\"]".into())
        );
    }

    #[test]
    fn parses_xpath_forms() {
        assert_eq!(
            Locator::parse("xpath=//button[@type='submit']").kind(),
            &LocatorKind::XPath("//button[@type='submit']".into())
        );
        assert_eq!(
            Locator::parse("(//form//button)[1]").kind(),
            &LocatorKind::XPath("(//form//button)[1]".into())
        );
    }

    #[test]
    fn parses_text_and_has_text() {
        assert_eq!(
            Locator::parse("text=\"Accept all\"").kind(),
            &LocatorKind::Text("Accept all".into())
        );
        assert_eq!(
            Locator::parse("button:has-text(\"Sign in\")").kind(),
            &LocatorKind::CssWithText {
                css: "button".into(),
                text: "Sign in".into()
            }
        );
        assert_eq!(
            Locator::parse(":has-text('Log out')").kind(),
            &LocatorKind::CssWithText {
                css: "*".into(),
                text: "Log out".into()
            }
        );
    }

    #[test]
    fn spec_carries_token_and_kind() {
        let spec = Locator::parse("a:has-text(\"My account\")").spec("t-1");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["css"], "a");
        assert_eq!(json["text"], "My account");
        assert_eq!(json["token"], "t-1");
    }
}
