use thiserror::Error;

use super::selectors::SelectorRole;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("required {0} field not found on login page")]
    MissingField(SelectorRole),
    #[error("login could not be verified (url: {url})")]
    LoginFailed { url: String },
    #[error("export request returned status {status}")]
    ExportStatus { status: u16 },
    #[error("session expired: export returned {content_type:?} ({size} bytes) instead of csv")]
    SessionExpired { content_type: String, size: usize },
    #[error("export fetch failed: {0}")]
    Fetch(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    /// Short stable label used to name diagnostics artifacts and ledger rows.
    pub fn kind(&self) -> &'static str {
        match self {
            BrowserError::Launch(_) => "launch",
            BrowserError::Cdp(_) => "cdp",
            BrowserError::Io(_) => "io",
            BrowserError::Timeout(_) => "timeout",
            BrowserError::Configuration(_) => "configuration",
            BrowserError::Navigation { .. } => "navigation",
            BrowserError::MissingField(_) => "missing-field",
            BrowserError::LoginFailed { .. } => "login-failed",
            BrowserError::ExportStatus { .. } => "export-status",
            BrowserError::SessionExpired { .. } => "session-expired",
            BrowserError::Fetch(_) => "fetch",
            BrowserError::Unexpected(_) => "unexpected",
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, BrowserError::SessionExpired { .. })
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
