use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nimbus_transport::TransportClient;
use tokio::sync::mpsc;

use crate::upload::accelerator::{FolderSyncAccelerator, RefreshOutcome};
use crate::upload::discover::{AssetDiscoverer, DiscoverError, DiscoveryMode, MediaKinds};
use crate::upload::metadata::{AutoUploadPolicy, Planned, UploadPlanner};
use crate::upload::reconcile::ZombieReconciler;
use crate::upload::scheduler::{
    DEFAULT_CONCURRENCY_CAP, NetworkMonitor, RuntimeState, SchedulerConfig, UploadScheduler,
};
use crate::upload::store::{Selector, TransferStore};
use crate::upload::tracker::TaskTracker;
use crate::upload::watcher::{LibraryChange, start_library_watcher};

const DEFAULT_UPLOAD_PATH: &str = "/Photos";
const DEFAULT_PROCESS_INTERVAL_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_ZOMBIE_GRACE_SECS: u64 = 30;
const DEFAULT_CHUNK_THRESHOLD: u64 = 100 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub library_dir: PathBuf,
    pub database: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub server_url: String,
    pub token: String,
    pub account: String,
    pub upload_path: String,
    pub subfolder_granularity: u8,
    pub filename_mask: Option<String>,
    pub jpeg_compat: bool,
    pub wifi_only: bool,
    pub video_wifi_only: bool,
    pub media_kinds: MediaKinds,
    pub concurrency_cap: usize,
    pub process_interval: Duration,
    pub poll_interval: Duration,
    pub zombie_grace: Duration,
    pub chunk_threshold: u64,
    pub encrypted_prefixes: Vec<String>,
    pub delete_after_upload: bool,
    pub assume_wifi: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let library_dir = std::env::var("NIMBUS_LIBRARY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("Pictures"));
        let database = std::env::var("NIMBUS_DATABASE").ok().map(PathBuf::from);
        let cache_dir = std::env::var("NIMBUS_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::cache_dir()
                    .unwrap_or_else(|| home.join(".cache"))
                    .join("nimbus")
            });
        let server_url =
            std::env::var("NIMBUS_SERVER_URL").context("NIMBUS_SERVER_URL is not set")?;
        let token = std::env::var("NIMBUS_TOKEN").context("NIMBUS_TOKEN is not set")?;
        let account = std::env::var("NIMBUS_ACCOUNT").unwrap_or_else(|_| "default".to_string());
        let upload_path = std::env::var("NIMBUS_UPLOAD_PATH")
            .unwrap_or_else(|_| DEFAULT_UPLOAD_PATH.to_string());
        let subfolder_granularity = std::env::var("NIMBUS_SUBFOLDER_GRANULARITY")
            .ok()
            .and_then(|value| value.parse::<u8>().ok())
            .unwrap_or(1);
        let filename_mask = std::env::var("NIMBUS_FILENAME_MASK")
            .ok()
            .filter(|mask| !mask.is_empty());
        let jpeg_compat = read_bool_env("NIMBUS_JPEG_COMPAT", true);
        let wifi_only = read_bool_env("NIMBUS_WIFI_ONLY", false);
        let video_wifi_only = read_bool_env("NIMBUS_VIDEO_WIFI_ONLY", false);
        let media_kinds = parse_media_kinds(
            std::env::var("NIMBUS_MEDIA_KINDS")
                .unwrap_or_default()
                .as_str(),
        );
        let concurrency_cap =
            read_u64_env("NIMBUS_CONCURRENCY_CAP", DEFAULT_CONCURRENCY_CAP as u64) as usize;
        let process_interval = Duration::from_secs(read_u64_env(
            "NIMBUS_PROCESS_INTERVAL_SECS",
            DEFAULT_PROCESS_INTERVAL_SECS,
        ));
        let poll_interval = Duration::from_secs(read_u64_env(
            "NIMBUS_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
        ));
        let zombie_grace = Duration::from_secs(read_u64_env(
            "NIMBUS_ZOMBIE_GRACE_SECS",
            DEFAULT_ZOMBIE_GRACE_SECS,
        ));
        let chunk_threshold = std::env::var("NIMBUS_CHUNK_THRESHOLD")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CHUNK_THRESHOLD);
        let encrypted_prefixes = parse_prefixes(
            std::env::var("NIMBUS_ENCRYPTED_PREFIXES")
                .unwrap_or_default()
                .as_str(),
        );
        let delete_after_upload = read_bool_env("NIMBUS_DELETE_AFTER_UPLOAD", false);
        let assume_wifi = read_bool_env("NIMBUS_ASSUME_WIFI", true);

        Ok(Self {
            library_dir,
            database,
            cache_dir,
            server_url,
            token,
            account,
            upload_path,
            subfolder_granularity,
            filename_mask,
            jpeg_compat,
            wifi_only,
            video_wifi_only,
            media_kinds,
            concurrency_cap,
            process_interval,
            poll_interval,
            zombie_grace,
            chunk_threshold,
            encrypted_prefixes,
            delete_after_upload,
            assume_wifi,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: TransferStore,
    scheduler: Arc<UploadScheduler>,
    reconciler: Arc<ZombieReconciler>,
    accelerator: Arc<FolderSyncAccelerator>,
    discoverer: Arc<AssetDiscoverer>,
    planner: Arc<UploadPlanner>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir at {:?}", config.cache_dir))?;

        let store = match &config.database {
            Some(path) => TransferStore::new_at(path).await,
            None => TransferStore::new_default().await,
        }
        .context("failed to initialize transfer store")?;
        let transport = TransportClient::new(&config.server_url, config.token.clone())
            .context("failed to create transport client")?;

        let runtime = RuntimeState::new();
        let network = NetworkMonitor::new(config.assume_wifi);
        let tracker = Arc::new(TaskTracker::new());

        let scheduler = Arc::new(UploadScheduler::new(
            store.clone(),
            transport.clone(),
            runtime,
            network,
            SchedulerConfig {
                account: config.account.clone(),
                concurrency_cap: config.concurrency_cap,
                delete_after_upload: config.delete_after_upload,
                library_root: Some(config.library_dir.clone()),
            },
        ));
        let reconciler = Arc::new(ZombieReconciler::new(
            store.clone(),
            transport.clone(),
            config.cache_dir.clone(),
            config.zombie_grace,
        ));
        let accelerator = Arc::new(FolderSyncAccelerator::new(
            store.clone(),
            transport,
            tracker,
        ));
        let discoverer = Arc::new(AssetDiscoverer::new(config.library_dir.clone(), store.clone()));
        let planner = Arc::new(UploadPlanner::new(
            store.clone(),
            AutoUploadPolicy {
                destination: config.upload_path.clone(),
                subfolder_granularity: config.subfolder_granularity,
                filename_mask: config.filename_mask.clone(),
                jpeg_compat: config.jpeg_compat,
                wifi_only: config.wifi_only,
                video_wifi_only: config.video_wifi_only,
                chunk_threshold: config.chunk_threshold,
                encrypted_prefixes: config.encrypted_prefixes.clone(),
            },
        ));

        Ok(Self {
            config,
            store,
            scheduler,
            reconciler,
            accelerator,
            discoverer,
            planner,
        })
    }

    pub async fn run(self, align: bool) -> anyhow::Result<()> {
        eprintln!(
            "[nimbusd] started: account={}, library={}, upload_path={}",
            self.config.account,
            self.config.library_dir.display(),
            self.config.upload_path
        );

        // Repair whatever the previous process left mid-transfer before any
        // new work is dispatched.
        let report = self
            .reconciler
            .run(&self.config.account)
            .await
            .context("startup reconciliation failed")?;
        if !report.is_empty() {
            eprintln!(
                "[nimbusd] reconciled stale records: reset={}, downloads={}, extension={}",
                report.reset, report.downloads_reset, report.extension_deleted
            );
        }

        if align {
            eprintln!("[nimbusd] aligning media index with the library");
            run_discovery(
                &self.discoverer,
                &self.planner,
                &self.config.account,
                self.config.media_kinds,
                DiscoveryMode::Align,
            )
            .await;
        }

        let scheduler_for_interval = Arc::clone(&self.scheduler);
        let process_interval = self.config.process_interval;
        let interval_handle = tokio::spawn(async move {
            loop {
                match scheduler_for_interval.process_once().await {
                    Ok(summary) if summary.dispatched > 0 => {
                        eprintln!("[nimbusd] dispatched {} upload(s)", summary.dispatched);
                    }
                    Ok(_) => {}
                    Err(err) => eprintln!("[nimbusd] scheduler error: {err}"),
                }
                tokio::time::sleep(process_interval).await;
            }
        });

        // Record mutations wake the scheduler without waiting for the timer.
        let scheduler_for_changes = Arc::clone(&self.scheduler);
        let mut changes = self.store.subscribe();
        let changes_handle = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                // Coalesce bursts of mutations into one pass.
                tokio::time::sleep(Duration::from_millis(200)).await;
                changes.borrow_and_update();
                if let Err(err) = scheduler_for_changes.process_once().await {
                    eprintln!("[nimbusd] scheduler error: {err}");
                }
            }
        });

        let (watcher, library_rx) = match start_library_watcher(&self.config.library_dir) {
            Ok((watcher, rx)) => (Some(watcher), Some(rx)),
            Err(err) => {
                eprintln!("[nimbusd] warning: failed to watch media library: {err}");
                (None, None)
            }
        };

        let discoverer = Arc::clone(&self.discoverer);
        let planner = Arc::clone(&self.planner);
        let account = self.config.account.clone();
        let media_kinds = self.config.media_kinds;
        let poll_interval = self.config.poll_interval;
        let discovery_handle = tokio::spawn(async move {
            let mut library_rx = library_rx;
            let mut auto_upload_enabled = true;
            loop {
                if auto_upload_enabled {
                    match discoverer
                        .discover(&account, media_kinds, DiscoveryMode::Incremental)
                        .await
                    {
                        Ok(assets) => {
                            let mut created = 0u64;
                            for asset in assets {
                                match planner
                                    .plan_asset(
                                        &account,
                                        &asset,
                                        Selector::AutoUpload,
                                        DiscoveryMode::Incremental,
                                    )
                                    .await
                                {
                                    Ok(Planned::Created(_)) => created += 1,
                                    Ok(Planned::Duplicate) => {}
                                    Err(err) => {
                                        eprintln!(
                                            "[nimbusd] failed to queue {}: {err}",
                                            asset.asset_id
                                        );
                                    }
                                }
                            }
                            if created > 0 {
                                eprintln!("[nimbusd] queued {created} new asset(s) for upload");
                            }
                        }
                        Err(DiscoverError::PermissionDenied) => {
                            eprintln!(
                                "[nimbusd] media library access denied, disabling auto-upload"
                            );
                            auto_upload_enabled = false;
                        }
                        Err(err) => eprintln!("[nimbusd] discovery error: {err}"),
                    }
                }

                let mut watcher_gone = false;
                match library_rx.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => {}
                            event = rx.recv() => {
                                if event.is_none() {
                                    watcher_gone = true;
                                } else {
                                    // Drain the burst the change produced.
                                    while let Ok(LibraryChange) = rx.try_recv() {}
                                }
                            }
                        }
                    }
                    None => tokio::time::sleep(poll_interval).await,
                }
                if watcher_gone {
                    library_rx = None;
                }
            }
        });

        let accelerator = Arc::clone(&self.accelerator);
        let account = self.config.account.clone();
        let upload_path = self.config.upload_path.clone();
        let refresh_interval = self.config.poll_interval;
        let accelerator_handle = tokio::spawn(async move {
            loop {
                match accelerator.refresh_folder(&account, &upload_path).await {
                    Ok(RefreshOutcome::Refetched { entries }) => {
                        eprintln!(
                            "[nimbusd] upload folder changed on the server ({} entries)",
                            entries.len()
                        );
                    }
                    Ok(_) => {}
                    Err(err) => eprintln!("[nimbusd] folder refresh error: {err}"),
                }
                tokio::time::sleep(refresh_interval).await;
            }
        });

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[nimbusd] shutting down");

        interval_handle.abort();
        changes_handle.abort();
        discovery_handle.abort();
        accelerator_handle.abort();

        Ok(())
    }
}

async fn run_discovery(
    discoverer: &AssetDiscoverer,
    planner: &UploadPlanner,
    account: &str,
    kinds: MediaKinds,
    mode: DiscoveryMode,
) {
    match discoverer.discover(account, kinds, mode).await {
        Ok(assets) => {
            let mut created = 0u64;
            let selector = match mode {
                DiscoveryMode::Align => Selector::AutoUploadAll,
                DiscoveryMode::Incremental => Selector::AutoUpload,
            };
            for asset in assets {
                match planner.plan_asset(account, &asset, selector, mode).await {
                    Ok(Planned::Created(_)) => created += 1,
                    Ok(Planned::Duplicate) => {}
                    Err(err) => eprintln!("[nimbusd] failed to queue {}: {err}", asset.asset_id),
                }
            }
            eprintln!("[nimbusd] alignment queued {created} asset(s)");
        }
        Err(err) => eprintln!("[nimbusd] alignment discovery failed: {err}"),
    }
}

fn parse_media_kinds(value: &str) -> MediaKinds {
    match value.trim().to_ascii_lowercase().as_str() {
        "images" | "image" | "photos" => MediaKinds::Images,
        "videos" | "video" => MediaKinds::Videos,
        _ => MediaKinds::All,
    }
}

fn parse_prefixes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| parse_bool_value(&value))
        .unwrap_or(default)
}

fn parse_bool_value(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kinds_parse_with_all_fallback() {
        assert_eq!(parse_media_kinds("images"), MediaKinds::Images);
        assert_eq!(parse_media_kinds("Photos"), MediaKinds::Images);
        assert_eq!(parse_media_kinds("videos"), MediaKinds::Videos);
        assert_eq!(parse_media_kinds("all"), MediaKinds::All);
        assert_eq!(parse_media_kinds(""), MediaKinds::All);
        assert_eq!(parse_media_kinds("garbage"), MediaKinds::All);
    }

    #[test]
    fn prefixes_split_on_commas_and_drop_blanks() {
        assert_eq!(
            parse_prefixes("/Vault, /Private/Photos ,"),
            vec!["/Vault".to_string(), "/Private/Photos".to_string()]
        );
        assert!(parse_prefixes("").is_empty());
    }

    #[test]
    fn bool_values_accept_common_spellings() {
        assert!(parse_bool_value("1"));
        assert!(parse_bool_value("TRUE"));
        assert!(parse_bool_value(" yes "));
        assert!(parse_bool_value("on"));
        assert!(!parse_bool_value("0"));
        assert!(!parse_bool_value("off"));
        assert!(!parse_bool_value("nope"));
    }
}
