use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use nimbus_transport::TransportClient;

use super::store::{
    StoreError, TransferRecord, TransferSession, TransferStatus, TransferStore,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Upload records returned to the pending state.
    pub reset: u64,
    /// Download records whose in-flight marker was cleared.
    pub downloads_reset: u64,
    /// Share-extension records deleted together with their cached payloads.
    pub extension_deleted: u64,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.reset == 0 && self.downloads_reset == 0 && self.extension_deleted == 0
    }
}

/// Repairs records left mid-transfer by a crash or kill: anything marked
/// in-flight whose transport task no longer exists.
pub struct ZombieReconciler {
    store: TransferStore,
    transport: TransportClient,
    cache_root: PathBuf,
    /// How long a dispatched-but-unbound record may stay that way before it
    /// is declared orphaned.
    grace: Duration,
}

impl ZombieReconciler {
    pub fn new(
        store: TransferStore,
        transport: TransportClient,
        cache_root: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            cache_root,
            grace,
        }
    }

    pub async fn run(&self, account: &str) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let live = self.transport.live_tasks();
        let mut suspects: Vec<i64> = Vec::new();

        for record in self.store.list_in_flight(account).await? {
            match record.session {
                TransferSession::Download => {
                    // Interrupted downloads restart from scratch; just drop
                    // the in-flight marker.
                    self.store.set_status(record.id, TransferStatus::Normal).await?;
                    report.downloads_reset += 1;
                }
                TransferSession::UploadBackgroundExt => {
                    self.delete_extension_leftovers(&record).await?;
                    self.store.delete_transfer(record.id).await?;
                    eprintln!(
                        "[nimbusd] dropped stale extension record {}",
                        record.destination()
                    );
                    report.extension_deleted += 1;
                }
                TransferSession::Upload => {
                    // Foreground uploads die with the session that started
                    // them; a record without a matching live task is stale.
                    let local = PathBuf::from(&record.local_path);
                    if !live.iter().any(|task| task.local_path() == local) {
                        self.store.reset_to_wait(record.id).await?;
                        eprintln!(
                            "[nimbusd] reset abandoned upload {}",
                            record.destination()
                        );
                        report.reset += 1;
                    }
                }
                TransferSession::UploadBackground | TransferSession::UploadBackgroundWifi => {
                    if record.status == TransferStatus::InUpload && record.task_id == 0 {
                        // Might be a scheduler pass racing us; give it a
                        // grace period before declaring the record orphaned.
                        suspects.push(record.id);
                    } else if record.status == TransferStatus::Uploading
                        && !live.iter().any(|task| task.id() as i64 == record.task_id)
                    {
                        self.store.reset_to_wait(record.id).await?;
                        eprintln!(
                            "[nimbusd] reset upload {} bound to dead task {}",
                            record.destination(),
                            record.task_id
                        );
                        report.reset += 1;
                    }
                }
            }
        }

        if !suspects.is_empty() {
            tokio::time::sleep(self.grace).await;
            for id in suspects {
                let Some(record) = self.store.get_transfer(id).await? else {
                    continue;
                };
                if record.status == TransferStatus::InUpload && record.task_id == 0 {
                    self.store.reset_to_wait(record.id).await?;
                    eprintln!(
                        "[nimbusd] reset orphaned upload {}",
                        record.destination()
                    );
                    report.reset += 1;
                }
            }
        }

        Ok(report)
    }

    async fn delete_extension_leftovers(
        &self,
        record: &TransferRecord,
    ) -> Result<(), ReconcileError> {
        let chunks = self.cache_root.join("chunks").join(record.id.to_string());
        match tokio::fs::remove_dir_all(&chunks).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let payload = self.cache_root.join("extension").join(&record.file_name);
        match tokio::fs::remove_file(&payload).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}
