mod actions;
mod automation;
mod classifier;
mod diagnostics;
mod download;
mod error;
mod locator;
mod login;
mod metrics;
mod page;
mod retry;
mod selectors;

pub use actions::{click_first, fill_first, ActionOutcome};
pub use automation::{BrowserAutomation, BrowserContext, BrowserLauncher};
pub use classifier::{
    classify, ensure_csv, Classification, Reason, Verdict, SAMPLE_BYTES, SHORT_PAYLOAD_BYTES,
};
pub use diagnostics::DiagnosticsRecorder;
pub use download::{ExportArtifact, ExportDownloader};
pub use error::{BrowserError, BrowserResult};
pub use locator::{Locator, LocatorKind};
pub use login::{url_signals_login, LoginFlow, LoginReport, LoginState, VerificationSignals};
pub use metrics::SessionMetrics;
pub use page::{FetchResponse, PortalPage};
pub use retry::{with_retry, AttemptFailure, RemediationAction, RetryOutcome, RetryPolicy};
pub use selectors::{SelectorCatalog, SelectorRole};
