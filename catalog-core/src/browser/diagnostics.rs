use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::DiagnosticsSection;

use super::error::BrowserError;
use super::page::PortalPage;

/// Captures a screenshot of the current page when a flow fails fatally.
///
/// Capture is best-effort: every failure here is logged and swallowed so the
/// original error keeps propagating.
#[derive(Debug, Clone)]
pub struct DiagnosticsRecorder {
    enabled: bool,
    dir: PathBuf,
}

impl DiagnosticsRecorder {
    pub fn new(enabled: bool, dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            dir: dir.into(),
        }
    }

    pub fn from_config(config: &DiagnosticsSection) -> Self {
        Self::new(config.verbose, config.screenshot_dir.clone())
    }

    pub fn disabled() -> Self {
        Self::new(false, PathBuf::new())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn capture<P>(&self, page: &mut P, error: &BrowserError) -> Option<PathBuf>
    where
        P: PortalPage + ?Sized,
    {
        if !self.enabled {
            return None;
        }
        let bytes = match page.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, failure = error.kind(), "diagnostic screenshot failed");
                return None;
            }
        };
        let path = self.dir.join(artifact_name(error.kind()));
        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(error = %err, dir = %self.dir.display(), "cannot create diagnostics dir");
            return None;
        }
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    failure = error.kind(),
                    "saved diagnostic screenshot"
                );
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "cannot write diagnostic screenshot");
                None
            }
        }
    }
}

fn artifact_name(kind: &str) -> String {
    format!("{kind}-{}.png", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_starts_with_error_kind() {
        let name = artifact_name("login-failed");
        assert!(name.starts_with("login-failed-"));
        assert!(name.ends_with("Z.png"));
    }

    #[test]
    fn disabled_recorder_reports_state() {
        let recorder = DiagnosticsRecorder::disabled();
        assert!(!recorder.enabled());
        let enabled = DiagnosticsRecorder::from_config(&DiagnosticsSection {
            verbose: true,
            ..DiagnosticsSection::default()
        });
        assert!(enabled.enabled());
        assert_eq!(enabled.dir(), Path::new("data/diagnostics"));
    }
}
