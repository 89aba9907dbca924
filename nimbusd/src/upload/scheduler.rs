use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use nimbus_transport::{TransportClient, UploadHandle};

use super::discover::created_stamp;
use super::store::{
    SELECTOR_PRIORITY, StoreError, TransferRecord, TransferSession, TransferStatus, TransferStore,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub const DEFAULT_CONCURRENCY_CAP: usize = 10;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub account: String,
    pub concurrency_cap: usize,
    pub delete_after_upload: bool,
    /// Needed for post-upload library cleanup; None disables it.
    pub library_root: Option<PathBuf>,
}

/// Whether the user is around. Encrypted and chunked payloads only move
/// while the session is active, and library cleanup additionally requires
/// an unlocked session.
#[derive(Debug)]
pub struct RuntimeState {
    active: AtomicBool,
    locked: AtomicBool,
}

impl RuntimeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            locked: AtomicBool::new(false),
        })
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

/// Current connectivity class as seen by the daemon.
#[derive(Debug)]
pub struct NetworkMonitor {
    wifi: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(wifi: bool) -> Arc<Self> {
        Arc::new(Self {
            wifi: AtomicBool::new(wifi),
        })
    }

    pub fn set_wifi(&self, wifi: bool) {
        self.wifi.store(wifi, Ordering::SeqCst);
    }

    pub fn is_wifi(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }
}

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Another pass was already running; nothing was examined.
    pub busy: bool,
    pub dispatched: u64,
    pub skipped: u64,
    /// Failed records moved back to pending because nothing else could run.
    pub errors_reset: u64,
    /// Library files removed after their uploads completed.
    pub cleaned: u64,
}

/// Drains pending transfer records into transport tasks, highest-priority
/// selector first, within the concurrency cap.
pub struct UploadScheduler {
    store: TransferStore,
    transport: TransportClient,
    runtime: Arc<RuntimeState>,
    network: Arc<NetworkMonitor>,
    config: SchedulerConfig,
    pass_lock: Mutex<()>,
}

impl UploadScheduler {
    pub fn new(
        store: TransferStore,
        transport: TransportClient,
        runtime: Arc<RuntimeState>,
        network: Arc<NetworkMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            runtime,
            network,
            config,
            pass_lock: Mutex::new(()),
        }
    }

    /// One scheduling pass. Passes never overlap: a pass that finds another
    /// one running returns immediately with `busy` set.
    pub async fn process_once(&self) -> Result<PassSummary, SchedulerError> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            return Ok(PassSummary {
                busy: true,
                ..PassSummary::default()
            });
        };

        let mut summary = PassSummary::default();
        let account = self.config.account.as_str();
        let in_flight = self.store.count_in_flight(account).await?;
        let mut budget = (self.config.concurrency_cap as i64 - in_flight).max(0);
        let live = self.transport.live_tasks();
        let active = self.runtime.is_active();
        let wifi = self.network.is_wifi();

        'selectors: for selector in SELECTOR_PRIORITY {
            if budget == 0 {
                break;
            }
            let candidates = self.store.list_waiting(account, selector, budget).await?;
            for record in candidates {
                if budget == 0 {
                    break 'selectors;
                }
                // Extension records belong to the share-extension process.
                if record.session == TransferSession::UploadBackgroundExt {
                    summary.skipped += 1;
                    continue;
                }
                if record.session.demands_wifi() && !wifi {
                    summary.skipped += 1;
                    continue;
                }
                if !active && (record.e2e_encrypted || record.chunked) {
                    summary.skipped += 1;
                    continue;
                }
                let destination = record.destination();
                if live.iter().any(|task| task.remote_path() == destination) {
                    // A task for this path is still running; reconciliation
                    // owns the stale record, not us.
                    summary.skipped += 1;
                    continue;
                }

                let clamp = record.e2e_encrypted || record.chunked;
                self.store
                    .set_status(record.id, TransferStatus::InUpload)
                    .await?;
                match self.transport.submit_upload(
                    account,
                    Path::new(&record.local_path),
                    &destination,
                ) {
                    Ok(handle) => {
                        self.store
                            .bind_task(record.id, handle.task.id() as i64)
                            .await?;
                        summary.dispatched += 1;
                        budget -= 1;
                        self.watch_completion(record, handle);
                        // Encrypted and chunked payloads go one per pass.
                        if clamp {
                            break 'selectors;
                        }
                    }
                    Err(err) => {
                        eprintln!("[nimbusd] failed to start upload of {destination}: {err}");
                        self.store
                            .set_upload_error(record.id, &err.to_string())
                            .await?;
                    }
                }
            }
        }

        if summary.dispatched == 0 {
            summary.errors_reset = self.store.reset_errors_to_wait(account).await?;
            if summary.errors_reset > 0 {
                eprintln!(
                    "[nimbusd] queue drained; retrying {} failed transfer(s)",
                    summary.errors_reset
                );
            }
        }

        if summary.dispatched == 0
            && summary.errors_reset == 0
            && self.store.count_in_flight(account).await? == 0
            && self.store.count_waiting(account).await? == 0
        {
            summary.cleaned = self.clean_library().await?;
        }

        Ok(summary)
    }

    fn watch_completion(&self, record: TransferRecord, handle: UploadHandle) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let destination = record.destination();
            match handle.outcome().await {
                Ok(_) => {
                    if let Some(asset_id) = &record.asset_id {
                        let created = OffsetDateTime::from_unix_timestamp(record.created)
                            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                        if let Err(err) = store
                            .record_media(&record.account, asset_id, &created_stamp(created))
                            .await
                        {
                            eprintln!("[nimbusd] failed to index {asset_id}: {err}");
                        }
                    }
                    if let Err(err) = store.delete_transfer(record.id).await {
                        eprintln!("[nimbusd] failed to retire record {}: {err}", record.id);
                    }
                    eprintln!("[nimbusd] uploaded {destination}");
                }
                Err(err) => {
                    eprintln!("[nimbusd] upload of {destination} failed: {err}");
                    if let Err(store_err) =
                        store.set_upload_error(record.id, &err.to_string()).await
                    {
                        eprintln!(
                            "[nimbusd] failed to mark record {} failed: {store_err}",
                            record.id
                        );
                    }
                }
            }
        });
    }

    /// Remove library originals whose uploads are fully settled. Only runs
    /// when the queue is idle, the opt-in is set and the session is active
    /// and unlocked.
    async fn clean_library(&self) -> Result<u64, SchedulerError> {
        if !self.config.delete_after_upload {
            return Ok(0);
        }
        if !self.runtime.is_active() || self.runtime.is_locked() {
            return Ok(0);
        }
        let Some(root) = &self.config.library_root else {
            return Ok(0);
        };

        let account = self.config.account.as_str();
        let pending: HashSet<String> = self
            .store
            .assets_with_transfers(account)
            .await?
            .into_iter()
            .collect();

        let mut cleaned = 0;
        for asset_id in self.store.media_assets(account).await? {
            if pending.contains(&asset_id) {
                continue;
            }
            let path = root.join(&asset_id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    cleaned += 1;
                    eprintln!("[nimbusd] removed uploaded original {}", path.display());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    eprintln!("[nimbusd] failed to remove {}: {err}", path.display());
                }
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::store::tests::make_store;
    use crate::upload::store::{Selector, TransferInput};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        store: TransferStore,
        scheduler: UploadScheduler,
        runtime: Arc<RuntimeState>,
        network: Arc<NetworkMonitor>,
        library: TempDir,
        _server: MockServer,
    }

    async fn harness(server: MockServer, cap: usize, delete_after_upload: bool) -> Harness {
        let store = make_store().await;
        let transport = TransportClient::new(&server.uri(), "test-token").unwrap();
        let runtime = RuntimeState::new();
        let network = NetworkMonitor::new(true);
        let library = tempdir().unwrap();
        let scheduler = UploadScheduler::new(
            store.clone(),
            transport,
            Arc::clone(&runtime),
            Arc::clone(&network),
            SchedulerConfig {
                account: "acct".into(),
                concurrency_cap: cap,
                delete_after_upload,
                library_root: Some(library.path().to_path_buf()),
            },
        );
        Harness {
            store,
            scheduler,
            runtime,
            network,
            library,
            _server: server,
        }
    }

    async fn slow_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        server
    }

    async fn add_record(harness: &Harness, name: &str, created: i64) -> TransferRecord {
        add_record_with(harness, name, created, |_| {}).await
    }

    async fn add_record_with(
        harness: &Harness,
        name: &str,
        created: i64,
        tweak: impl FnOnce(&mut TransferInput),
    ) -> TransferRecord {
        let local = harness.library.path().join(name);
        std::fs::write(&local, b"payload").unwrap();
        let mut input = TransferInput {
            account: "acct".into(),
            asset_id: Some(name.to_string()),
            server_url: "/Photos/2024/06".into(),
            file_name: name.into(),
            file_name_view: name.into(),
            local_path: local.to_string_lossy().into_owned(),
            session: TransferSession::UploadBackground,
            selector: Selector::AutoUpload,
            chunked: false,
            e2e_encrypted: false,
            created,
        };
        tweak(&mut input);
        harness.store.create_transfer(&input).await.unwrap()
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if check().await {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn dispatch_respects_concurrency_cap() {
        let harness = harness(slow_server().await, 10, false).await;
        for n in 0..15 {
            add_record(&harness, &format!("{n:02}.jpg"), 100 + n).await;
        }

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 10);
        assert_eq!(harness.store.count_in_flight("acct").await.unwrap(), 10);
        assert_eq!(harness.store.count_waiting("acct").await.unwrap(), 5);

        // Cap already reached, the follow-up pass moves nothing.
        let second = harness.scheduler.process_once().await.unwrap();
        assert_eq!(second.dispatched, 0);
        assert_eq!(harness.store.count_in_flight("acct").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn manual_uploads_dispatch_before_auto_uploads() {
        let harness = harness(slow_server().await, 1, false).await;
        let auto = add_record(&harness, "auto.jpg", 100).await;
        let manual = add_record_with(&harness, "manual.jpg", 200, |input| {
            input.selector = Selector::ManualUpload;
            input.session = TransferSession::Upload;
        })
        .await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);

        // The newer manual record wins over the older auto one.
        let manual = harness.store.get_transfer(manual.id).await.unwrap().unwrap();
        assert_eq!(manual.status, TransferStatus::Uploading);
        let auto = harness.store.get_transfer(auto.id).await.unwrap().unwrap();
        assert_eq!(auto.status, TransferStatus::WaitUpload);
    }

    #[tokio::test]
    async fn wifi_demanding_records_wait_off_wifi() {
        let harness = harness(slow_server().await, 10, false).await;
        harness.network.set_wifi(false);
        let record = add_record_with(&harness, "a.jpg", 100, |input| {
            input.session = TransferSession::UploadBackgroundWifi;
        })
        .await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.skipped, 1);
        let record = harness.store.get_transfer(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::WaitUpload);

        harness.network.set_wifi(true);
        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);
    }

    #[tokio::test]
    async fn encrypted_record_limits_pass_to_single_dispatch() {
        let harness = harness(slow_server().await, 10, false).await;
        add_record_with(&harness, "secret.jpg", 100, |input| {
            input.e2e_encrypted = true;
        })
        .await;
        add_record(&harness, "b.jpg", 200).await;
        add_record(&harness, "c.jpg", 300).await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(harness.store.count_waiting("acct").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn inactive_session_defers_chunked_and_encrypted() {
        let harness = harness(slow_server().await, 10, false).await;
        harness.runtime.set_active(false);
        add_record_with(&harness, "big.mp4", 100, |input| {
            input.chunked = true;
        })
        .await;
        add_record(&harness, "small.jpg", 200).await;

        let summary = harness.scheduler.process_once().await.unwrap();
        // The plain record still moves; only the chunked one waits.
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(harness.store.count_waiting("acct").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn extension_records_are_never_dispatched() {
        let harness = harness(slow_server().await, 10, false).await;
        let record = add_record_with(&harness, "shared.jpg", 100, |input| {
            input.session = TransferSession::UploadBackgroundExt;
            input.selector = Selector::AutoUpload;
        })
        .await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.skipped, 1);
        let record = harness.store.get_transfer(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::WaitUpload);
    }

    #[tokio::test]
    async fn record_with_live_task_for_same_path_is_not_redispatched() {
        let harness = harness(slow_server().await, 10, false).await;
        let record = add_record(&harness, "a.jpg", 100).await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);

        // Simulate a stale record left behind while its task still runs.
        harness.store.reset_to_wait(record.id).await.unwrap();
        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.skipped, 1);
        let record = harness.store.get_transfer(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::WaitUpload);
    }

    #[tokio::test]
    async fn concurrent_pass_reports_busy() {
        let harness = harness(slow_server().await, 10, false).await;
        let _held = harness.scheduler.pass_lock.lock().await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert!(summary.busy);
        assert_eq!(summary.dispatched, 0);
    }

    #[tokio::test]
    async fn empty_pass_retries_failed_records() {
        let harness = harness(slow_server().await, 10, false).await;
        let record = add_record_with(&harness, "a.jpg", 100, |input| {
            input.session = TransferSession::UploadBackgroundWifi;
        })
        .await;
        harness
            .store
            .set_upload_error(record.id, "server returned 507")
            .await
            .unwrap();

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.errors_reset, 1);

        let record = harness.store.get_transfer(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::WaitUpload);
        assert_eq!(record.session_error, "");
        assert_eq!(record.session, TransferSession::UploadBackground);
    }

    #[tokio::test]
    async fn successful_upload_retires_record_and_indexes_asset() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let harness = harness(server, 10, false).await;
        let record = add_record(&harness, "a.jpg", 1_717_243_445).await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);

        let store = harness.store.clone();
        let id = record.id;
        wait_until(|| {
            let store = store.clone();
            async move { store.get_transfer(id).await.unwrap().is_none() }
        })
        .await;
        assert!(
            harness
                .store
                .media_contains("acct", "a.jpg", "2024-06-01 12:04:05")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn failed_upload_marks_record_with_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(507))
            .mount(&server)
            .await;
        let harness = harness(server, 10, false).await;
        let record = add_record(&harness, "a.jpg", 100).await;

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);

        let store = harness.store.clone();
        let id = record.id;
        wait_until(|| {
            let store = store.clone();
            async move {
                store
                    .get_transfer(id)
                    .await
                    .unwrap()
                    .is_some_and(|r| r.status == TransferStatus::UploadError)
            }
        })
        .await;
        let record = harness.store.get_transfer(record.id).await.unwrap().unwrap();
        assert!(record.session_error.contains("507"));
        assert_eq!(record.task_id, 0);
    }

    #[tokio::test]
    async fn idle_pass_cleans_uploaded_library_files() {
        let harness = harness(slow_server().await, 10, true).await;
        let uploaded = harness.library.path().join("done.jpg");
        std::fs::write(&uploaded, b"x").unwrap();
        harness
            .store
            .record_media("acct", "done.jpg", "2024-06-01 10:00:00")
            .await
            .unwrap();

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.cleaned, 1);
        assert!(!uploaded.exists());

        // Locked session blocks cleanup.
        let kept = harness.library.path().join("kept.jpg");
        std::fs::write(&kept, b"x").unwrap();
        harness
            .store
            .record_media("acct", "kept.jpg", "2024-06-01 11:00:00")
            .await
            .unwrap();
        harness.runtime.set_locked(true);
        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.cleaned, 0);
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn cleanup_spares_assets_still_referenced_by_records() {
        let harness = harness(slow_server().await, 10, true).await;
        // A settled record still references its asset, so the original must
        // survive the sweep even though the asset is indexed.
        let record = add_record(&harness, "referenced.jpg", 100).await;
        harness
            .store
            .set_status(record.id, TransferStatus::Normal)
            .await
            .unwrap();
        harness
            .store
            .record_media("acct", "referenced.jpg", "2024-06-01 10:00:00")
            .await
            .unwrap();

        let orphan = harness.library.path().join("orphan.jpg");
        std::fs::write(&orphan, b"x").unwrap();
        harness
            .store
            .record_media("acct", "orphan.jpg", "2024-06-01 11:00:00")
            .await
            .unwrap();

        let summary = harness.scheduler.process_once().await.unwrap();
        assert_eq!(summary.cleaned, 1);
        assert!(!orphan.exists());
        assert!(harness.library.path().join("referenced.jpg").exists());
    }
}
