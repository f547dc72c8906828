pub mod agent;
pub mod browser;
pub mod config;
pub mod distribution;
pub mod error;
pub mod telemetry;

pub use agent::{acquire_export, AcquiredExport, AgentError, CatalogAgent, FetchReport};
pub use browser::{
    classify, click_first, ensure_csv, fill_first, with_retry, ActionOutcome, BrowserError,
    BrowserResult, Classification, DiagnosticsRecorder, ExportArtifact, Locator, LoginFlow,
    LoginState, PortalPage, RetryPolicy, SelectorCatalog, SelectorRole, SessionMetrics,
};
pub use config::{
    load_agent_config, AgentConfig, ChromiumSection, CredentialsSection, DeliverySection,
    DeliveryTarget, DiagnosticsSection, RetrySection, SelectorSection, SiteSection,
    TimeoutsSection,
};
pub use distribution::{build_delivery, history_id, Delivery, DeliveryError, DeliveryReceipt};
pub use error::{ConfigError, Result};
pub use telemetry::{LedgerError, RunLedger, RunSummary};
