use clap::Args;
use serde::Serialize;

use catalog_core::build_delivery;

use crate::{AppContext, DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    /// History copies to keep (defaults to delivery.keep_history)
    #[arg(long)]
    pub keep: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PruneReport {
    pub target: String,
    pub keep: usize,
    pub removed: Vec<String>,
}

pub(crate) async fn execute(context: &AppContext, args: &PruneArgs) -> Result<PruneReport> {
    let section = &context.config().delivery;
    let keep = args.keep.unwrap_or(section.keep_history);
    let delivery = build_delivery(section)?;
    let removed = delivery.prune_history(keep).await?;
    Ok(PruneReport {
        target: delivery.target().to_string(),
        keep,
        removed,
    })
}

impl DisplayFallback for PruneReport {
    fn display(&self) -> String {
        if self.removed.is_empty() {
            format!("[{}] nothing to prune (keep {})", self.target, self.keep)
        } else {
            format!(
                "[{}] removed {} history copies (keep {}): {}",
                self.target,
                self.removed.len(),
                self.keep,
                self.removed.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn prunes_local_history_down_to_keep() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let history = out.join("history");
        fs::create_dir_all(&history).unwrap();
        for id in ["20261001T060000Z", "20261002T060000Z", "20261003T060000Z"] {
            fs::write(history.join(format!("{id}.csv")), "a,b\n").unwrap();
        }
        let config_path = temp.path().join("catalog.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[site]
base_url = "https://portal.example.com/"
login_url = "https://portal.example.com/login"
export_url = "https://portal.example.com/export/products.csv"

[delivery]
target = "local"
keep_history = 5

[delivery.local]
dir = "{}"
"#,
                out.display()
            ),
        )
        .unwrap();
        let context = AppContext::with_env(&config_path, |_| None).unwrap();

        let report = execute(&context, &PruneArgs { keep: Some(1) }).await.unwrap();

        assert_eq!(report.target, "local");
        assert_eq!(report.removed, vec!["20261001T060000Z", "20261002T060000Z"]);
        assert!(history.join("20261003T060000Z.csv").exists());
        assert!(!history.join("20261001T060000Z.csv").exists());
    }
}
