use std::cell::RefCell;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::browser::{
    AttemptFailure, BrowserAutomation, BrowserError, BrowserLauncher, BrowserResult,
    DiagnosticsRecorder, ExportArtifact, ExportDownloader, LoginFlow, PortalPage, RetryPolicy,
    SelectorCatalog, SessionMetrics,
};
use crate::config::AgentConfig;
use crate::distribution::{history_id, Delivery, DeliveryError, DeliveryReceipt};
use crate::error::ConfigError;
use crate::telemetry::{FailureRecord, LedgerError, RunLedger, RunRecord};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "configuration",
            AgentError::Browser(err) => err.kind(),
            AgentError::Delivery(_) => "delivery",
            AgentError::Ledger(_) => "ledger",
        }
    }
}

/// A verified export plus how many attempts each stage took.
#[derive(Debug, Clone)]
pub struct AcquiredExport {
    pub artifact: ExportArtifact,
    pub login_attempts: u32,
    pub download_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub run_id: String,
    pub history_id: String,
    pub bytes: usize,
    pub content_type: String,
    pub sha256: String,
    pub login_attempts: u32,
    pub download_attempts: u32,
    pub metrics: SessionMetrics,
    pub delivery: Option<DeliveryReceipt>,
    pub pruned: Vec<String>,
    pub saved_to: Option<String>,
    pub duration_ms: u64,
}

/// Logs in and downloads the export on an already open page.
///
/// Login runs under the login retry policy; only after it is verified does the
/// download run, under the download retry policy. Each download attempt may
/// re-login once on its own when the export comes back as a login page.
pub async fn acquire_export<P, O>(
    page: &mut P,
    config: &AgentConfig,
    selectors: &SelectorCatalog,
    diagnostics: &DiagnosticsRecorder,
    metrics: Arc<Mutex<SessionMetrics>>,
    mut observer: O,
) -> BrowserResult<AcquiredExport>
where
    P: PortalPage + ?Sized,
    O: FnMut(AttemptFailure<'_, BrowserError>),
{
    let login = LoginFlow::new(config, selectors, diagnostics).with_metrics(Arc::clone(&metrics));
    let downloader = ExportDownloader::new(
        &config.site.export_url,
        config.timeouts.export_fetch(),
        &login,
        diagnostics,
    )
    .with_metrics(metrics);

    let page = RefCell::new(page);
    let page_ref = &page;
    let login_ref = &login;
    let downloader_ref = &downloader;

    let login_policy = RetryPolicy::new("login", &config.retry.login);
    let logged_in = login_policy
        .run_observed(
            move |_| async move {
                let mut page = page_ref.borrow_mut();
                login_ref.run(&mut **page).await
            },
            |failure| observer(failure),
        )
        .await?;

    let download_policy = RetryPolicy::new("download", &config.retry.download);
    let downloaded = download_policy
        .run_observed(
            move |_| async move {
                let mut page = page_ref.borrow_mut();
                downloader_ref.download(&mut **page).await
            },
            |failure| observer(failure),
        )
        .await?;

    Ok(AcquiredExport {
        artifact: downloaded.result,
        login_attempts: logged_in.attempts,
        download_attempts: downloaded.attempts,
    })
}

pub struct CatalogAgent {
    config: AgentConfig,
    selectors: SelectorCatalog,
    diagnostics: DiagnosticsRecorder,
    launcher: BrowserLauncher,
    ledger: Option<Arc<RunLedger>>,
}

impl CatalogAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        config.require_credentials()?;
        let selectors = SelectorCatalog::from_config(&config.selectors);
        let diagnostics = DiagnosticsRecorder::from_config(&config.diagnostics);
        let launcher = BrowserLauncher::new(config.chromium.clone(), config.timeouts.navigation());
        Ok(Self {
            config,
            selectors,
            diagnostics,
            launcher,
            ledger: None,
        })
    }

    pub fn with_ledger(mut self, ledger: Arc<RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Launches a browser, acquires the export and always tears the browser down.
    ///
    /// The session metrics are returned on both paths so failed runs keep their counts.
    pub async fn fetch(&self, run_id: &str) -> (BrowserResult<AcquiredExport>, SessionMetrics) {
        let automation = match self.launcher.launch().await {
            Ok(automation) => automation,
            Err(err) => return (Err(err), SessionMetrics::default()),
        };
        let metrics = automation.metrics_handle();
        let result = self.fetch_in(&automation, run_id).await;
        if let Err(err) = automation.shutdown().await {
            warn!(error = %err, "browser shutdown failed");
        }
        let snapshot = metrics
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        (result, snapshot)
    }

    async fn fetch_in(
        &self,
        automation: &BrowserAutomation,
        run_id: &str,
    ) -> BrowserResult<AcquiredExport> {
        let mut context = automation.new_context().await?;
        let result = acquire_export(
            &mut context,
            &self.config,
            &self.selectors,
            &self.diagnostics,
            automation.metrics_handle(),
            |failure| self.record_failure(run_id, &failure),
        )
        .await;
        if let Err(err) = context.close().await {
            warn!(error = %err, "page close failed");
        }
        result
    }

    /// Full run: fetch, optionally save a local copy, deliver, prune, record.
    pub async fn run(
        &self,
        delivery: Option<&dyn Delivery>,
        save_to: Option<&Path>,
    ) -> Result<FetchReport, AgentError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let history = history_id(started_at);
        info!(%run_id, %history, "catalog fetch started");

        let mut metrics = SessionMetrics::default();
        let result = self
            .run_inner(&run_id, &history, delivery, save_to, clock, &mut metrics)
            .await;
        if let Err(err) = &result {
            error!(%run_id, error = %err, kind = err.kind(), "catalog fetch failed");
        }

        let target = delivery.map(|delivery| delivery.target().to_string());
        let record = run_record(
            &run_id,
            started_at,
            &history,
            target.as_deref(),
            &result,
            &metrics,
            clock.elapsed().as_millis() as i64,
        );
        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.record_run(&record) {
                warn!(error = %err, "failed to record run in ledger");
            }
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: &str,
        history: &str,
        delivery: Option<&dyn Delivery>,
        save_to: Option<&Path>,
        clock: Instant,
        metrics: &mut SessionMetrics,
    ) -> Result<FetchReport, AgentError> {
        let (acquired, snapshot) = self.fetch(run_id).await;
        *metrics = snapshot;
        let acquired = acquired?;
        let artifact = &acquired.artifact;
        let sha256 = hex::encode(Sha256::digest(artifact.bytes()));

        let saved_to = match save_to {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(DeliveryError::from)?;
                }
                tokio::fs::write(path, artifact.bytes())
                    .await
                    .map_err(DeliveryError::from)?;
                Some(path.to_string_lossy().into_owned())
            }
            None => None,
        };

        let mut receipt = None;
        let mut pruned = Vec::new();
        if let Some(delivery) = delivery {
            receipt = Some(delivery.deliver(artifact.bytes(), history).await?);
            match delivery.prune_history(self.config.delivery.keep_history).await {
                Ok(removed) => pruned = removed,
                Err(err) => warn!(error = %err, "history pruning failed"),
            }
        } else {
            info!("delivery skipped");
        }

        let report = FetchReport {
            run_id: run_id.to_string(),
            history_id: history.to_string(),
            bytes: artifact.size(),
            content_type: artifact.content_type().to_string(),
            sha256,
            login_attempts: acquired.login_attempts,
            download_attempts: acquired.download_attempts,
            metrics: metrics.clone(),
            delivery: receipt,
            pruned,
            saved_to,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        info!(
            run_id = %report.run_id,
            bytes = report.bytes,
            sha256 = %report.sha256,
            "catalog fetch finished"
        );
        Ok(report)
    }

    fn record_failure(&self, run_id: &str, failure: &AttemptFailure<'_, BrowserError>) {
        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.record_failure(&FailureRecord::from_attempt(run_id, failure)) {
                warn!(error = %err, "failed to record attempt failure");
            }
        }
    }
}

/// Ledger row for a finished run; failed runs keep the session counters they reached.
fn run_record(
    run_id: &str,
    started_at: DateTime<Utc>,
    history: &str,
    target: Option<&str>,
    result: &Result<FetchReport, AgentError>,
    metrics: &SessionMetrics,
    duration_ms: i64,
) -> RunRecord {
    match result {
        Ok(report) => RunRecord {
            run_id: run_id.to_string(),
            started_at,
            success: true,
            history_id: Some(history.to_string()),
            target: report.delivery.as_ref().map(|receipt| receipt.target.clone()),
            bytes: Some(report.bytes as u64),
            sha256: Some(report.sha256.clone()),
            login_attempts: report.metrics.login_attempts,
            duration_ms,
            error_kind: None,
            error_message: None,
        },
        Err(err) => RunRecord {
            run_id: run_id.to_string(),
            started_at,
            success: false,
            history_id: None,
            target: target.map(str::to_string),
            bytes: None,
            sha256: None,
            login_attempts: metrics.login_attempts,
            duration_ms,
            error_kind: Some(err.kind().to_string()),
            error_message: Some(err.to_string()),
        },
    }
}
