use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use catalog_core::{
    load_agent_config, AgentConfig, AgentError, DeliveryError, LedgerError, RunLedger,
};

mod commands;

pub use commands::check::{CheckStatus, HealthEntry};
pub use commands::classify::{ClassifyArgs, ClassifyReport};
pub use commands::fetch::FetchArgs;
pub use commands::history::{HistoryArgs, HistoryList};
pub use commands::prune::{PruneArgs, PruneReport};

pub const USERNAME_ENV: &str = "CATALOG_USERNAME";
pub const PASSWORD_ENV: &str = "CATALOG_PASSWORD";

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] catalog_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("fetch did not finish within {0}s")]
    Timeout(u64),
    #[error("{0}")]
    ChecksFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Vendor catalog export agent", long_about = None)]
pub struct Cli {
    /// Path to catalog.toml
    #[arg(long, global = true, default_value = "configs/catalog.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug-level logging
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in, download the export and deliver it
    Fetch(FetchArgs),
    /// Run the CSV classifier on a local file
    Classify(ClassifyArgs),
    /// Apply history retention on the configured target
    Prune(PruneArgs),
    /// List recent runs from the ledger
    History(HistoryArgs),
    /// Check configuration, credentials and local resources
    Check,
}

pub async fn run(cli: Cli) -> Result<()> {
    // Classification works on a local file and needs no configuration.
    if let Commands::Classify(args) = &cli.command {
        let report = commands::classify::execute(args).await?;
        return render(&report, cli.format);
    }

    let context = AppContext::new(&cli.config)?;
    match &cli.command {
        Commands::Fetch(args) => {
            let report = commands::fetch::execute(&context, args).await?;
            render(&report, cli.format)?;
        }
        Commands::Prune(args) => {
            let report = commands::prune::execute(&context, args).await?;
            render(&report, cli.format)?;
        }
        Commands::History(args) => {
            let list = commands::history::execute(&context, args)?;
            render(&list, cli.format)?;
        }
        Commands::Check => {
            let report = commands::check::execute(&context);
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::ChecksFailed(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Classify(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// Loaded configuration with environment overrides already applied.
#[derive(Debug)]
pub struct AppContext {
    config: AgentConfig,
    config_path: PathBuf,
}

impl AppContext {
    pub fn new(config_path: &Path) -> Result<Self> {
        Self::with_env(config_path, |name| std::env::var(name).ok())
    }

    pub fn with_env<F>(config_path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = load_agent_config(config_path)?;
        apply_env_overrides(&mut config, lookup);
        config.validate()?;
        Ok(Self {
            config,
            config_path: config_path.to_path_buf(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn open_ledger(&self) -> Result<RunLedger> {
        let diagnostics = &self.config.diagnostics;
        Ok(RunLedger::new(
            &diagnostics.failure_log,
            &diagnostics.ledger_db,
        )?)
    }
}

/// Credentials and the upload token never live in the file; they are read
/// from the environment once, here.
fn apply_env_overrides<F>(config: &mut AgentConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    config.credentials = config
        .credentials
        .clone()
        .with_overrides(lookup(USERNAME_ENV), lookup(PASSWORD_ENV));

    if let Some(http) = config.delivery.http.as_mut() {
        if http.token.as_deref().map_or(true, str::is_empty) {
            if let Some(name) = http.token_env.as_deref() {
                http.token = lookup(name);
                debug!(env = name, found = http.token.is_some(), "resolved upload token");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[site]
base_url = "https://portal.example.com/"
login_url = "https://portal.example.com/login"
export_url = "https://portal.example.com/export/products.csv"

[credentials]
username = "file-user@example.com"

[delivery]
target = "http"

[delivery.http]
upload_url = "https://cms.example.com/api/catalog"
token_env = "CMS_TOKEN"
"#;

    fn write_config(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("catalog.toml");
        fs::write(&path, CONFIG).unwrap();
        path
    }

    #[test]
    fn environment_overrides_credentials_and_token() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp);
        let env: HashMap<&str, &str> = [
            (PASSWORD_ENV, "s3cret"),
            ("CMS_TOKEN", "token-123"),
        ]
        .into_iter()
        .collect();

        let context =
            AppContext::with_env(&path, |name| env.get(name).map(|v| v.to_string())).unwrap();
        let config = context.config();
        assert_eq!(config.credentials.username, "file-user@example.com");
        assert_eq!(config.credentials.password, "s3cret");
        assert_eq!(
            config.delivery.http.as_ref().unwrap().token.as_deref(),
            Some("token-123")
        );
        config.require_credentials().unwrap();
    }

    #[test]
    fn missing_environment_leaves_config_untouched() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp);
        let context = AppContext::with_env(&path, |_| None).unwrap();
        assert!(context.config().require_credentials().is_err());
        assert!(context.config().delivery.http.as_ref().unwrap().token.is_none());
    }

    #[test]
    fn unreadable_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = AppContext::with_env(&temp.path().join("absent.toml"), |_| None).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "catalogctl",
            "fetch",
            "--dry-run",
            "--timeout-secs",
            "90",
            "--format",
            "json",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Fetch(args) => {
                assert!(args.dry_run);
                assert_eq!(args.timeout_secs, Some(90));
                assert!(args.output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
