use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::info;

use catalog_core::{build_delivery, CatalogAgent, FetchReport};

use crate::{AppContext, AppError, DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Download and verify the export without delivering it
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Also write the CSV to this local path
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Abort the whole run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,
    /// Show the browser window
    #[arg(long, default_value_t = false)]
    pub headful: bool,
}

pub(crate) async fn execute(context: &AppContext, args: &FetchArgs) -> Result<FetchReport> {
    let mut config = context.config().clone();
    if args.headful {
        config.chromium.headless = false;
    }
    let ledger = Arc::new(context.open_ledger()?);
    let agent = CatalogAgent::new(config)?.with_ledger(ledger);
    let delivery = if args.dry_run {
        info!("dry run, delivery disabled");
        None
    } else {
        Some(build_delivery(&agent.config().delivery)?)
    };

    let run = agent.run(delivery.as_deref(), args.output.as_deref());
    let report = match args.timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
            .await
            .map_err(|_| AppError::Timeout(secs))??,
        None => run.await?,
    };
    Ok(report)
}

impl DisplayFallback for FetchReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Run: {}", self.run_id),
            format!("History id: {}", self.history_id),
            format!(
                "Export: {} bytes ({}) sha256={}",
                self.bytes, self.content_type, self.sha256
            ),
            format!(
                "Attempts: login={} download={} reauth={}",
                self.login_attempts, self.download_attempts, self.metrics.reauthentications
            ),
        ];
        match &self.delivery {
            Some(receipt) => {
                lines.push(format!("Delivered [{}]: {}", receipt.target, receipt.canonical));
                if let Some(history) = &receipt.history {
                    lines.push(format!("History copy: {history}"));
                }
            }
            None => lines.push("Delivery: skipped".to_string()),
        }
        if !self.pruned.is_empty() {
            lines.push(format!("Pruned: {}", self.pruned.join(", ")));
        }
        if let Some(path) = &self.saved_to {
            lines.push(format!("Saved to: {path}"));
        }
        lines.push(format!("Duration: {} ms", self.duration_ms));
        lines.join("\n")
    }
}
