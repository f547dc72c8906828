use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use catalog_core::browser::{Reason, Verdict};
use catalog_core::classify;

use crate::{DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct ClassifyArgs {
    /// File to inspect
    pub path: PathBuf,
    /// Content-Type header to classify with
    #[arg(long, default_value = "")]
    pub content_type: String,
}

#[derive(Debug, Serialize)]
pub struct ClassifyReport {
    pub path: String,
    pub bytes: usize,
    pub content_type: String,
    pub verdict: Verdict,
    pub reason: Reason,
}

pub(crate) async fn execute(args: &ClassifyArgs) -> Result<ClassifyReport> {
    let bytes = tokio::fs::read(&args.path).await?;
    let classification = classify(&bytes, &args.content_type);
    Ok(ClassifyReport {
        path: args.path.display().to_string(),
        bytes: bytes.len(),
        content_type: args.content_type.clone(),
        verdict: classification.verdict,
        reason: classification.reason,
    })
}

impl DisplayFallback for ClassifyReport {
    fn display(&self) -> String {
        let content_type = if self.content_type.is_empty() {
            "-"
        } else {
            self.content_type.as_str()
        };
        format!(
            "{verdict} ({reason}) {path}: {bytes} bytes, content-type {content_type}",
            verdict = self.verdict,
            reason = self.reason,
            path = self.path,
            bytes = self.bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn classify_file(body: &[u8], content_type: &str) -> ClassifyReport {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("export.bin");
        std::fs::write(&path, body).unwrap();
        execute(&ClassifyArgs {
            path,
            content_type: content_type.to_string(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn login_page_is_reported_as_not_csv() {
        let report = classify_file(b"<html><body>Sign in</body></html>", "text/html").await;
        assert_eq!(report.verdict, Verdict::NotCsv);
        assert_eq!(report.reason, Reason::HtmlContentType);
        assert!(report.display().starts_with("not-csv (html-content-type)"));
    }

    #[tokio::test]
    async fn semicolon_export_without_header_is_csv() {
        let report = classify_file(b"sku;name;price\n1;Widget;9.99\n", "").await;
        assert_eq!(report.verdict, Verdict::Csv);
        assert!(report.display().contains("content-type -"));
    }
}
