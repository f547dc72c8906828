use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::DeliveryTarget;

use super::{
    history_file_name, parse_history_file_name, select_expired, Delivery, DeliveryError,
    DeliveryReceipt, HISTORY_DIR,
};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// Pushes the export to an rclone remote (S3, GCS, B2, ...).
#[derive(Clone)]
pub struct ObjectDelivery {
    rclone_path: PathBuf,
    remote: String,
    prefix: String,
    canonical_name: String,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for ObjectDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDelivery")
            .field("rclone_path", &self.rclone_path)
            .field("remote", &self.remote)
            .field("prefix", &self.prefix)
            .field("canonical_name", &self.canonical_name)
            .finish()
    }
}

impl ObjectDelivery {
    pub fn new(
        rclone_path: PathBuf,
        remote: String,
        prefix: String,
        canonical_name: String,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            rclone_path,
            remote,
            prefix,
            canonical_name,
            executor,
        }
    }

    pub fn canonical_object(&self) -> String {
        join_remote(&self.remote, &[self.prefix.as_str(), self.canonical_name.as_str()])
    }

    pub fn history_object(&self, history_id: &str) -> String {
        let file_name = history_file_name(history_id);
        join_remote(
            &self.remote,
            &[self.prefix.as_str(), HISTORY_DIR, file_name.as_str()],
        )
    }

    fn history_root(&self) -> String {
        join_remote(&self.remote, &[self.prefix.as_str(), HISTORY_DIR])
    }

    async fn rclone(&self, args: &[&str]) -> Result<std::process::Output, DeliveryError> {
        let mut command = Command::new(&self.rclone_path);
        command.args(args);
        let mut parts = vec![self.rclone_path.to_string_lossy().into_owned()];
        parts.extend(args.iter().map(|arg| arg.to_string()));
        let cmd_string = parts.join(" ");
        debug!(command = %cmd_string, "running rclone");
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            return Err(DeliveryError::CommandFailure {
                command: cmd_string,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output)
    }

    async fn copy_to(&self, source: &Path, destination: &str) -> Result<(), DeliveryError> {
        let source = source.to_string_lossy();
        self.rclone(&["copyto", &*source, destination]).await?;
        Ok(())
    }
}

pub(crate) fn join_remote(remote: &str, parts: &[&str]) -> String {
    let mut path = remote.trim_end_matches('/').to_string();
    for part in parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
    {
        if !path.ends_with(':') {
            path.push('/');
        }
        path.push_str(part);
    }
    path
}

#[async_trait]
impl Delivery for ObjectDelivery {
    fn target(&self) -> DeliveryTarget {
        DeliveryTarget::Object
    }

    async fn deliver(
        &self,
        bytes: &[u8],
        history_id: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let payload = bytes.to_vec();
        let staged = tokio::task::spawn_blocking(move || stage_payload(&payload)).await??;

        let canonical = self.canonical_object();
        let history = self.history_object(history_id);
        self.copy_to(staged.path(), &canonical).await?;
        self.copy_to(staged.path(), &history).await?;
        info!(
            canonical = %canonical,
            history = %history,
            bytes = bytes.len(),
            "catalog copied to object storage"
        );
        Ok(DeliveryReceipt {
            target: self.target().to_string(),
            canonical,
            history: Some(history),
            bytes: bytes.len(),
        })
    }

    async fn prune_history(&self, keep: usize) -> Result<Vec<String>, DeliveryError> {
        let root = self.history_root();
        let listing = self.rclone(&["lsf", root.as_str(), "--files-only"]).await?;
        let ids = String::from_utf8_lossy(&listing.stdout)
            .lines()
            .filter_map(|line| parse_history_file_name(line.trim()))
            .map(str::to_string)
            .collect::<Vec<_>>();
        let expired = select_expired(ids, keep);
        for id in &expired {
            let object = self.history_object(id);
            self.rclone(&["deletefile", object.as_str()]).await?;
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), keep, remote = %root, "pruned object history");
        }
        Ok(expired)
    }
}

fn stage_payload(payload: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("catalog-upload-")
        .suffix(".csv")
        .tempfile()?;
    file.write_all(payload)?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;
    #[cfg(windows)]
    use std::os::windows::process::ExitStatusExt;

    fn output(code: i32, stdout: &str) -> std::process::Output {
        #[cfg(unix)]
        let status = std::process::ExitStatus::from_raw(code << 8);
        #[cfg(windows)]
        let status = std::process::ExitStatus::from_raw(code as u32);
        std::process::Output {
            status,
            stdout: stdout.as_bytes().to_vec(),
            stderr: if code == 0 {
                Vec::new()
            } else {
                b"permission denied".to_vec()
            },
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<Vec<String>>>,
        outputs: Mutex<Vec<std::process::Output>>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
            let args = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            self.calls.lock().unwrap().push(args);
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| output(0, "")))
        }
    }

    fn delivery(executor: Arc<RecordingExecutor>) -> ObjectDelivery {
        ObjectDelivery::new(
            PathBuf::from("rclone"),
            "s3:vendor-feeds/".into(),
            "/catalog/".into(),
            "catalog.csv".into(),
            Some(executor as Arc<dyn CommandExecutor>),
        )
    }

    #[test]
    fn joins_remote_paths() {
        assert_eq!(join_remote("b2:", &["", "catalog.csv"]), "b2:catalog.csv");
        assert_eq!(
            join_remote("s3:bucket/", &["/feeds/", "history", "x.csv"]),
            "s3:bucket/feeds/history/x.csv"
        );
    }

    #[tokio::test]
    async fn deliver_copies_canonical_then_history() {
        let executor = Arc::new(RecordingExecutor::default());
        let receipt = delivery(Arc::clone(&executor))
            .deliver(b"sku,name\n", "20261015T080000Z")
            .await
            .unwrap();

        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0], "copyto");
        assert_eq!(calls[0][2], "s3:vendor-feeds/catalog/catalog.csv");
        assert_eq!(
            calls[1][2],
            "s3:vendor-feeds/catalog/history/20261015T080000Z.csv"
        );
        assert_eq!(receipt.canonical, "s3:vendor-feeds/catalog/catalog.csv");
    }

    #[tokio::test]
    async fn failed_history_copy_reports_command() {
        let executor = Arc::new(RecordingExecutor::default());
        // Outputs are popped from the back: canonical succeeds, history fails.
        executor
            .outputs
            .lock()
            .unwrap()
            .extend([output(1, ""), output(0, "")]);
        let err = delivery(Arc::clone(&executor))
            .deliver(b"a,b", "20261015T080000Z")
            .await
            .unwrap_err();
        match err {
            DeliveryError::CommandFailure {
                command, stderr, ..
            } => {
                assert!(command.starts_with("rclone copyto"));
                assert!(command.contains("history/20261015T080000Z.csv"));
                assert_eq!(stderr, "permission denied");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prune_lists_then_deletes_oldest() {
        let executor = Arc::new(RecordingExecutor::default());
        executor.outputs.lock().unwrap().push(output(
            0,
            "20261012T080000Z.csv\nREADME.md\n20261010T080000Z.csv\n20261011T080000Z.csv\n",
        ));
        let removed = delivery(Arc::clone(&executor))
            .prune_history(1)
            .await
            .unwrap();

        assert_eq!(removed, vec!["20261010T080000Z", "20261011T080000Z"]);
        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(
            calls[0],
            vec!["lsf", "s3:vendor-feeds/catalog/history", "--files-only"]
        );
        assert_eq!(
            calls[1],
            vec!["deletefile", "s3:vendor-feeds/catalog/history/20261010T080000Z.csv"]
        );
        assert_eq!(calls.len(), 3);
    }
}
