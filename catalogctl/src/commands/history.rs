use clap::Args;
use serde::Serialize;

use catalog_core::RunSummary;

use crate::{AppContext, DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    /// Number of runs to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryList {
    pub rows: Vec<RunSummary>,
}

pub(crate) fn execute(context: &AppContext, args: &HistoryArgs) -> Result<HistoryList> {
    let ledger = context.open_ledger()?;
    Ok(HistoryList {
        rows: ledger.recent_runs(args.limit)?,
    })
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No runs recorded".to_string();
        }
        let mut lines = Vec::new();
        lines.push(format!(
            "{:<24} {:<6} {:<18} {:>10} {:>9}  {}",
            "Started", "Status", "History id", "Bytes", "Duration", "Detail"
        ));
        for run in &self.rows {
            let status = if run.success { "ok" } else { "FAIL" };
            let detail = if run.success {
                run.target.clone().unwrap_or_else(|| "dry-run".to_string())
            } else {
                run.error_kind.clone().unwrap_or_default()
            };
            lines.push(format!(
                "{:<24} {:<6} {:<18} {:>10} {:>7}ms  {}",
                run.started_at,
                status,
                run.history_id.as_deref().unwrap_or("-"),
                run.bytes.map(|b| b.to_string()).unwrap_or_else(|| "-".into()),
                run.duration_ms,
                detail
            ));
        }
        lines.join("\n")
    }
}
