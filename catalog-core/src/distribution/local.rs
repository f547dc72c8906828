use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::DeliveryTarget;

use super::{
    history_file_name, parse_history_file_name, select_expired, Delivery, DeliveryError,
    DeliveryReceipt, HISTORY_DIR,
};

/// Writes the export into a directory: `<dir>/<canonical_name>` plus
/// `<dir>/history/<id>.csv`.
#[derive(Debug, Clone)]
pub struct LocalDelivery {
    dir: PathBuf,
    canonical_name: String,
}

impl LocalDelivery {
    pub fn new(dir: impl Into<PathBuf>, canonical_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            canonical_name: canonical_name.into(),
        }
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.dir.join(&self.canonical_name)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.dir.join(HISTORY_DIR)
    }

    pub fn history_ids(&self) -> Result<Vec<String>, DeliveryError> {
        let dir = self.history_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| DeliveryError::Io(std::io::Error::other(err)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(parse_history_file_name) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Writes `bytes` to a temp file beside `target` and renames it into place.
fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".catalog-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|err| err.error)?;
    Ok(())
}

#[async_trait]
impl Delivery for LocalDelivery {
    fn target(&self) -> DeliveryTarget {
        DeliveryTarget::Local
    }

    async fn deliver(
        &self,
        bytes: &[u8],
        history_id: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let canonical = self.canonical_path();
        let history = self.history_dir().join(history_file_name(history_id));
        let payload = bytes.to_vec();
        let canonical_target = canonical.clone();
        let history_target = history.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            write_atomic(&canonical_target, &payload)?;
            write_atomic(&history_target, &payload)
        })
        .await??;
        info!(
            canonical = %canonical.display(),
            history = %history.display(),
            bytes = bytes.len(),
            "catalog written to local directory"
        );
        Ok(DeliveryReceipt {
            target: self.target().to_string(),
            canonical: canonical.to_string_lossy().into_owned(),
            history: Some(history.to_string_lossy().into_owned()),
            bytes: bytes.len(),
        })
    }

    async fn prune_history(&self, keep: usize) -> Result<Vec<String>, DeliveryError> {
        let expired = select_expired(self.history_ids()?, keep);
        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            let path = self.history_dir().join(history_file_name(&id));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed.push(id),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "history file vanished before pruning");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), keep, "pruned local history");
        }
        Ok(removed)
    }
}
