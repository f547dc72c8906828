use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use super::classifier::classify;
use super::diagnostics::DiagnosticsRecorder;
use super::error::{BrowserError, BrowserResult};
use super::login::LoginFlow;
use super::metrics::SessionMetrics;
use super::page::{FetchResponse, PortalPage};

/// A fetched export that passed classification. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    bytes: Vec<u8>,
    content_type: String,
}

impl ExportArtifact {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Fetches the export through the logged-in page, re-authenticating once when
/// the portal answers with something that is not a CSV.
#[derive(Debug, Clone)]
pub struct ExportDownloader<'a> {
    export_url: &'a str,
    fetch_timeout: Duration,
    login: &'a LoginFlow<'a>,
    diagnostics: &'a DiagnosticsRecorder,
    metrics: Option<Arc<Mutex<SessionMetrics>>>,
}

impl<'a> ExportDownloader<'a> {
    pub fn new(
        export_url: &'a str,
        fetch_timeout: Duration,
        login: &'a LoginFlow<'a>,
        diagnostics: &'a DiagnosticsRecorder,
    ) -> Self {
        Self {
            export_url,
            fetch_timeout,
            login,
            diagnostics,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Mutex<SessionMetrics>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One logical download attempt.
    ///
    /// A session-expired rejection triggers exactly one re-login followed by
    /// exactly one more fetch. Any other failure returns immediately.
    pub async fn download<P>(&self, page: &mut P) -> BrowserResult<ExportArtifact>
    where
        P: PortalPage + ?Sized,
    {
        let result = match self.fetch_verified(page).await {
            Err(err) if err.is_session_expired() => {
                warn!(error = %err, "export rejected, re-authenticating once");
                self.record(|metrics| metrics.record_reauthentication());
                // The login flow captures its own diagnostics on failure.
                self.login.run(page).await?;
                self.fetch_verified(page).await
            }
            other => other,
        };
        match result {
            Ok(artifact) => {
                info!(
                    bytes = artifact.size(),
                    content_type = %artifact.content_type(),
                    "export downloaded"
                );
                Ok(artifact)
            }
            Err(err) => {
                self.diagnostics.capture(page, &err).await;
                Err(err)
            }
        }
    }

    async fn fetch_verified<P>(&self, page: &mut P) -> BrowserResult<ExportArtifact>
    where
        P: PortalPage + ?Sized,
    {
        let FetchResponse {
            status,
            content_type,
            body,
        } = page.fetch(self.export_url, self.fetch_timeout).await?;
        if status != 200 {
            self.record(|metrics| metrics.record_export_fetch(false));
            return Err(BrowserError::ExportStatus { status });
        }
        let classification = classify(&body, &content_type);
        self.record(|metrics| metrics.record_export_fetch(classification.is_csv()));
        if !classification.is_csv() {
            warn!(
                reason = ?classification.reason,
                content_type = %content_type,
                bytes = body.len(),
                "export body is not csv"
            );
            return Err(BrowserError::SessionExpired {
                content_type,
                size: body.len(),
            });
        }
        Ok(ExportArtifact {
            bytes: body,
            content_type,
        })
    }

    fn record<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionMetrics),
    {
        if let Some(metrics) = &self.metrics {
            if let Ok(mut guard) = metrics.lock() {
                f(&mut guard);
            }
        }
    }
}
