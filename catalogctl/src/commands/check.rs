use std::fmt;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

use catalog_core::{build_delivery, DeliveryTarget};

use crate::{AppContext, DisplayFallback};

pub(crate) fn execute(context: &AppContext) -> Vec<HealthEntry> {
    let config = context.config();
    let mut entries = vec![HealthEntry::ok(
        "config",
        context.config_path().display().to_string(),
    )];

    entries.push(match config.require_credentials() {
        Ok(()) => HealthEntry::ok("credentials", config.credentials.username.clone()),
        Err(err) => HealthEntry::error("credentials", err.to_string()),
    });

    entries.push(match &config.chromium.executable_path {
        Some(path) => check_path("chromium", Path::new(path)),
        None => HealthEntry::ok("chromium", "auto-detected at launch"),
    });

    let diagnostics = &config.diagnostics;
    entries.push(check_directory("screenshots", &diagnostics.screenshot_dir));
    entries.push(check_database("ledger", &diagnostics.ledger_db));

    entries.push(match build_delivery(&config.delivery) {
        Ok(_) => check_delivery(context),
        Err(err) => HealthEntry::error("delivery", err.to_string()),
    });

    entries
}

fn check_delivery(context: &AppContext) -> HealthEntry {
    let delivery = &context.config().delivery;
    match delivery.target {
        DeliveryTarget::Local => match &delivery.local {
            Some(local) if local.dir.is_dir() => {
                HealthEntry::ok("delivery", format!("local {}", local.dir.display()))
            }
            Some(local) => HealthEntry::warn(
                "delivery",
                format!("{} will be created on first delivery", local.dir.display()),
            ),
            None => HealthEntry::error("delivery", "[delivery.local] missing"),
        },
        DeliveryTarget::Http => match &delivery.http {
            Some(http) if http.token.is_some() => {
                HealthEntry::ok("delivery", format!("http {}", http.upload_url))
            }
            Some(http) => HealthEntry::warn(
                "delivery",
                format!("http {} without bearer token", http.upload_url),
            ),
            None => HealthEntry::error("delivery", "[delivery.http] missing"),
        },
        DeliveryTarget::Object => match &delivery.object {
            Some(object) => HealthEntry::ok(
                "delivery",
                format!("object {} via {}", object.remote, object.rclone_path.display()),
            ),
            None => HealthEntry::error("delivery", "[delivery.object] missing"),
        },
    }
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{} not found", path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    if path.is_dir() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else if path.exists() {
        HealthEntry::error(name, format!("{} is not a directory", path.display()))
    } else {
        HealthEntry::warn(
            name,
            format!("{} will be created on first failure", path.display()),
        )
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(
            name,
            format!("{} will be created on first run", path.display()),
        );
    }
    match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => match conn.query_row("SELECT COUNT(*) FROM fetch_runs", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(count) => HealthEntry::ok(name, format!("{} ({count} runs)", path.display())),
            Err(err) => HealthEntry::error(name, format!("{}: {err}", path.display())),
        },
        Err(err) => HealthEntry::error(name, format!("{}: {err}", path.display())),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn context(temp: &TempDir, extra: &str) -> AppContext {
        let root = temp.path();
        let config_path = root.join("catalog.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[site]
base_url = "https://portal.example.com/"
login_url = "https://portal.example.com/login"
export_url = "https://portal.example.com/export/products.csv"

[diagnostics]
screenshot_dir = "{shots}"
failure_log = "{log}"
ledger_db = "{db}"

[delivery]
target = "local"

[delivery.local]
dir = "{out}"
{extra}
"#,
                shots = root.join("shots").display(),
                log = root.join("failures.log").display(),
                db = root.join("ledger.sqlite").display(),
                out = root.join("out").display(),
            ),
        )
        .unwrap();
        AppContext::with_env(&config_path, |name| match name {
            crate::USERNAME_ENV => Some("buyer@example.com".into()),
            crate::PASSWORD_ENV => Some("hunter2".into()),
            _ => None,
        })
        .unwrap()
    }

    fn status_of(entries: &[HealthEntry], name: &str) -> CheckStatus {
        entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.status)
            .unwrap()
    }

    #[test]
    fn fresh_install_only_warns() {
        let temp = TempDir::new().unwrap();
        let entries = execute(&context(&temp, ""));
        assert_eq!(status_of(&entries, "credentials"), CheckStatus::Ok);
        assert_eq!(status_of(&entries, "screenshots"), CheckStatus::Warn);
        assert_eq!(status_of(&entries, "ledger"), CheckStatus::Warn);
        assert_eq!(status_of(&entries, "delivery"), CheckStatus::Warn);
        assert!(entries.iter().all(|entry| entry.status != CheckStatus::Error));
    }

    #[test]
    fn existing_ledger_reports_run_count() {
        let temp = TempDir::new().unwrap();
        let context = context(&temp, "");
        context.open_ledger().unwrap();
        let entries = execute(&context);
        let ledger = entries.iter().find(|entry| entry.name == "ledger").unwrap();
        assert_eq!(ledger.status, CheckStatus::Ok);
        assert!(ledger.detail.contains("(0 runs)"));
    }

    #[test]
    fn missing_chromium_binary_is_an_error() {
        let temp = TempDir::new().unwrap();
        let context = context(
            &temp,
            "[chromium]\nexecutable_path = \"/nonexistent/chromium\"",
        );
        let entries = execute(&context);
        assert_eq!(status_of(&entries, "chromium"), CheckStatus::Error);
        assert!(entries.display().contains("[ERROR] chromium: /nonexistent/chromium not found"));
    }
}
