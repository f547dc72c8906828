pub mod http;
pub mod local;
pub mod object;

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::{DeliverySection, DeliveryTarget};

pub use self::http::HttpDelivery;
pub use self::local::LocalDelivery;
pub use self::object::{CommandExecutor, ObjectDelivery, SystemCommandExecutor};

/// Directory (or object prefix) holding the timestamped copies.
pub const HISTORY_DIR: &str = "history";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("delivery misconfigured: {0}")]
    Configuration(String),
}

impl From<tokio::task::JoinError> for DeliveryError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeliveryError::Io(std::io::Error::other(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub target: String,
    pub canonical: String,
    pub history: Option<String>,
    pub bytes: usize,
}

/// Destination for a validated catalog export.
///
/// `deliver` writes the canonical copy first and the history copy second; the
/// two writes are independent and a failed history write does not undo the
/// canonical one.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn target(&self) -> DeliveryTarget;

    async fn deliver(
        &self,
        bytes: &[u8],
        history_id: &str,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    /// Removes the oldest history entries beyond `keep`, returning the removed ids.
    async fn prune_history(&self, keep: usize) -> Result<Vec<String>, DeliveryError>;
}

/// History id for a run started at `at`: `YYYYMMDDTHHMMSSZ` in UTC.
pub fn history_id(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn history_file_name(history_id: &str) -> String {
    format!("{history_id}.csv")
}

/// Returns the history id when `name` is a history file written by this crate.
pub fn parse_history_file_name(name: &str) -> Option<&str> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(\d{8}T\d{6}Z)\.csv$").expect("valid history pattern"));
    pattern
        .captures(name)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str())
}

/// Ids to remove so that at most `keep` remain, oldest first.
pub(crate) fn select_expired(mut ids: Vec<String>, keep: usize) -> Vec<String> {
    ids.sort();
    ids.dedup();
    let excess = ids.len().saturating_sub(keep);
    ids.truncate(excess);
    ids
}

pub fn build_delivery(section: &DeliverySection) -> Result<Box<dyn Delivery>, DeliveryError> {
    match section.target {
        DeliveryTarget::Local => {
            let local = section.local.as_ref().ok_or_else(|| {
                DeliveryError::Configuration("[delivery.local] table is required".into())
            })?;
            Ok(Box::new(LocalDelivery::new(
                local.dir.clone(),
                local.canonical_name.clone(),
            )))
        }
        DeliveryTarget::Http => {
            let http = section.http.as_ref().ok_or_else(|| {
                DeliveryError::Configuration("[delivery.http] table is required".into())
            })?;
            Ok(Box::new(HttpDelivery::from_config(http)?))
        }
        DeliveryTarget::Object => {
            let object = section.object.as_ref().ok_or_else(|| {
                DeliveryError::Configuration("[delivery.object] table is required".into())
            })?;
            Ok(Box::new(ObjectDelivery::new(
                object.rclone_path.clone(),
                object.remote.clone(),
                object.prefix.clone(),
                object.canonical_name.clone(),
                None,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_ids_sort_chronologically() {
        let early = history_id(Utc.with_ymd_and_hms(2026, 9, 30, 23, 59, 59).unwrap());
        let late = history_id(Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(early, "20260930T235959Z");
        assert!(early < late);
    }

    #[test]
    fn parses_only_history_file_names() {
        assert_eq!(
            parse_history_file_name("20261015T101500Z.csv"),
            Some("20261015T101500Z")
        );
        assert_eq!(parse_history_file_name("catalog.csv"), None);
        assert_eq!(parse_history_file_name("20261015T101500Z.csv.tmp"), None);
    }

    #[test]
    fn select_expired_keeps_newest() {
        let ids = vec![
            "20261003T000000Z".to_string(),
            "20261001T000000Z".to_string(),
            "20261002T000000Z".to_string(),
        ];
        assert_eq!(select_expired(ids.clone(), 2), vec!["20261001T000000Z"]);
        assert!(select_expired(ids.clone(), 5).is_empty());
        assert_eq!(select_expired(ids, 0).len(), 3);
    }
}
