use std::sync::Arc;

use thiserror::Error;

use nimbus_transport::{FolderEntry, TransportClient, TransportError};

use super::store::{StoreError, TransferStore};
use super::tracker::{TaskTracker, WorkflowGuard};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
pub enum RefreshOutcome {
    /// Another refresh of the same folder is in progress; nothing was done.
    AlreadyRunning,
    /// The folder ETag matches the cached one; the listing was skipped.
    Unchanged,
    Refetched { entries: Vec<FolderEntry> },
}

/// Cheap folder change detection: an ETag-only probe first, the full listing
/// only when the folder actually changed. Concurrent refreshes of the same
/// folder are collapsed through the task tracker.
pub struct FolderSyncAccelerator {
    store: TransferStore,
    transport: TransportClient,
    tracker: Arc<TaskTracker>,
}

impl FolderSyncAccelerator {
    pub fn new(store: TransferStore, transport: TransportClient, tracker: Arc<TaskTracker>) -> Self {
        Self {
            store,
            transport,
            tracker,
        }
    }

    pub async fn refresh_folder(
        &self,
        account: &str,
        path: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        let identifier = format!("read_folder:{path}");
        self.tracker.cleanup();
        if self.tracker.is_tracking(&identifier) {
            return Ok(RefreshOutcome::AlreadyRunning);
        }
        let guard = WorkflowGuard::begin();
        self.tracker.track(&identifier, guard.task());

        let probe = self.transport.folder_metadata(account, path, true).await?;
        if self.store.folder_etag(account, path).await?.as_deref() == Some(probe.etag.as_str()) {
            return Ok(RefreshOutcome::Unchanged);
        }

        let listing = self.transport.folder_metadata(account, path, false).await?;
        self.store.set_folder_etag(account, path, &listing.etag).await?;
        eprintln!(
            "[nimbusd] folder {path} changed, fetched {} entries",
            listing.entries.len()
        );
        Ok(RefreshOutcome::Refetched {
            entries: listing.entries,
        })
    }
}
