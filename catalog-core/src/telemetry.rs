use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use crate::browser::{AttemptFailure, BrowserError, RemediationAction};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One failed attempt of a retried task.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub task: String,
    pub category: String,
    pub error_message: String,
    pub attempt: u32,
    pub remediation: String,
    pub delay_ms: Option<u64>,
}

impl FailureRecord {
    pub fn from_attempt(run_id: &str, failure: &AttemptFailure<'_, BrowserError>) -> Self {
        let delay_ms = match failure.action {
            RemediationAction::RetryScheduled { delay_ms } => Some(delay_ms),
            RemediationAction::Abort => None,
        };
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            task: failure.task.to_string(),
            category: failure.error.kind().to_string(),
            error_message: failure.error.to_string(),
            attempt: failure.attempt,
            remediation: failure.action.label().to_string(),
            delay_ms,
        }
    }
}

/// Outcome of one fetch run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub history_id: Option<String>,
    pub target: Option<String>,
    pub bytes: Option<u64>,
    pub sha256: Option<String>,
    pub login_attempts: u64,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Row returned by [`RunLedger::recent_runs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub success: bool,
    pub history_id: Option<String>,
    pub target: Option<String>,
    pub bytes: Option<i64>,
    pub sha256: Option<String>,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
}

/// JSON-lines failure log plus an SQLite ledger of failures and runs.
#[derive(Debug)]
pub struct RunLedger {
    log: Mutex<File>,
    log_path: PathBuf,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl RunLedger {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let ledger = Self {
            log: Mutex::new(file),
            log_path,
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        ledger.initialize_db()?;
        Ok(ledger)
    }

    fn initialize_db(&self) -> Result<(), LedgerError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fetch_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT,
                task TEXT,
                category TEXT,
                error_message TEXT,
                attempt INTEGER,
                remediation TEXT,
                delay_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_fetch_failures_ts ON fetch_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS fetch_runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                history_id TEXT,
                target TEXT,
                bytes INTEGER,
                sha256 TEXT,
                login_attempts INTEGER,
                duration_ms INTEGER,
                error_kind TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_fetch_runs_started ON fetch_runs(started_at DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, LedgerError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> Result<(), LedgerError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO fetch_failures
                (run_id, task, category, error_message, attempt, remediation, delay_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                failure.run_id,
                failure.task,
                failure.category,
                failure.error_message,
                failure.attempt as i64,
                failure.remediation,
                failure.delay_ms.map(|delay| delay as i64),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunRecord) -> Result<(), LedgerError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT OR REPLACE INTO fetch_runs (
                run_id, started_at, success, history_id, target, bytes, sha256,
                login_attempts, duration_ms, error_kind, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id,
                run.started_at.to_rfc3339(),
                if run.success { 1 } else { 0 },
                run.history_id,
                run.target,
                run.bytes.map(|bytes| bytes as i64),
                run.sha256,
                run.login_attempts as i64,
                run.duration_ms,
                run.error_kind,
                run.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, LedgerError> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, started_at, success, history_id, target, bytes, sha256,
                    duration_ms, error_kind
             FROM fetch_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunSummary {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                success: row.get::<_, i64>(2)? != 0,
                history_id: row.get(3)?,
                target: row.get(4)?,
                bytes: row.get(5)?,
                sha256: row.get(6)?,
                duration_ms: row.get(7)?,
                error_kind: row.get(8)?,
            })
        })?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub fn failure_count(&self, run_id: &str) -> Result<u64, LedgerError> {
        let conn = self.open_db()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fetch_failures WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn run(run_id: &str, started_at: DateTime<Utc>, success: bool) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            started_at,
            success,
            history_id: success.then(|| "20261015T080000Z".to_string()),
            target: Some("local".into()),
            bytes: success.then_some(2048),
            sha256: None,
            login_attempts: 1,
            duration_ms: 4200,
            error_kind: (!success).then(|| "login-failed".to_string()),
            error_message: None,
        }
    }

    #[test]
    fn ledger_persists_failures_and_runs() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("logs/failures.log");
        let db_path = dir.path().join("ledger.sqlite");
        let ledger = RunLedger::new(&log_path, &db_path).unwrap();

        let error = BrowserError::SessionExpired {
            content_type: "text/html".into(),
            size: 812,
        };
        let failure = AttemptFailure {
            task: "download",
            attempt: 1,
            error: &error,
            action: RemediationAction::RetryScheduled { delay_ms: 3000 },
        };
        ledger
            .record_failure(&FailureRecord::from_attempt("run-1", &failure))
            .unwrap();
        ledger
            .record_run(&run("run-1", Utc::now(), true))
            .unwrap();

        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("session-expired"));
        assert_eq!(ledger.failure_count("run-1").unwrap(), 1);
        assert_eq!(ledger.failure_count("run-2").unwrap(), 0);

        let conn = Connection::open(&db_path).unwrap();
        let delay: i64 = conn
            .query_row("SELECT delay_ms FROM fetch_failures", [], |row| row.get(0))
            .unwrap();
        assert_eq!(delay, 3000);
    }

    #[test]
    fn recent_runs_are_newest_first_and_limited() {
        let dir = tempdir().unwrap();
        let ledger =
            RunLedger::new(dir.path().join("failures.log"), dir.path().join("ledger.sqlite"))
                .unwrap();
        for (idx, success) in [(1, true), (2, false), (3, true)] {
            let started = Utc.with_ymd_and_hms(2026, 10, idx, 8, 0, 0).unwrap();
            ledger
                .record_run(&run(&format!("run-{idx}"), started, success))
                .unwrap();
        }

        let runs = ledger.recent_runs(2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run-3");
        assert_eq!(runs[1].run_id, "run-2");
        assert!(!runs[1].success);
        assert_eq!(runs[1].error_kind.as_deref(), Some("login-failed"));
        assert_eq!(runs[0].bytes, Some(2048));
    }
}
