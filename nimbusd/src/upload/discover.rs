use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;

use super::store::{StoreError, TransferStore};

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("media library access denied")]
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// User preference: which media to consider for auto-upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKinds {
    Images,
    Videos,
    All,
}

impl MediaKinds {
    pub fn accepts(&self, kind: MediaKind) -> bool {
        match self {
            MediaKinds::Images => kind == MediaKind::Image,
            MediaKinds::Videos => kind == MediaKind::Video,
            MediaKinds::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Only assets not yet present in the media index.
    Incremental,
    /// Full resync: everything, and the index is rebuilt from the result.
    Align,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaAsset {
    /// Library-relative path; stable identity of the asset within the
    /// library root.
    pub asset_id: String,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub created: OffsetDateTime,
    pub size: u64,
}

impl MediaAsset {
    pub fn file_name(&self) -> &str {
        self.asset_id
            .rsplit('/')
            .next()
            .unwrap_or(self.asset_id.as_str())
    }

    /// Creation timestamp as stored in the media index.
    pub fn created_stamp(&self) -> String {
        created_stamp(self.created)
    }
}

pub fn created_stamp(created: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        created.year(),
        created.month() as u8,
        created.day(),
        created.hour(),
        created.minute(),
        created.second()
    )
}

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "heic", "webp"];
const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mov", "m4v", "mkv", "webm"];

fn media_kind_for(path: &Path) -> Option<MediaKind> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Enumerates camera media under a library directory and filters out assets
/// already imported for the account.
pub struct AssetDiscoverer {
    root: PathBuf,
    store: TransferStore,
}

impl AssetDiscoverer {
    pub fn new(root: PathBuf, store: TransferStore) -> Self {
        Self { root, store }
    }

    pub async fn discover(
        &self,
        account: &str,
        kinds: MediaKinds,
        mode: DiscoveryMode,
    ) -> Result<Vec<MediaAsset>, DiscoverError> {
        let mut assets = match self.scan(kinds).await {
            Ok(assets) => assets,
            // A missing library directory is an empty library, not an error.
            Err(DiscoverError::Io(err)) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        assets.sort_by(|a, b| (a.created, &a.asset_id).cmp(&(b.created, &b.asset_id)));

        match mode {
            DiscoveryMode::Incremental => {
                let mut fresh = Vec::with_capacity(assets.len());
                for asset in assets {
                    if !self
                        .store
                        .media_contains(account, &asset.asset_id, &asset.created_stamp())
                        .await?
                    {
                        fresh.push(asset);
                    }
                }
                Ok(fresh)
            }
            DiscoveryMode::Align => {
                let entries: Vec<(String, String)> = assets
                    .iter()
                    .map(|asset| (asset.asset_id.clone(), asset.created_stamp()))
                    .collect();
                self.store.rebuild_media_index(account, &entries).await?;
                Ok(assets)
            }
        }
    }

    async fn scan(&self, kinds: MediaKinds) -> Result<Vec<MediaAsset>, DiscoverError> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(map_io)?;
            while let Some(entry) = entries.next_entry().await.map_err(map_io)? {
                let path = entry.path();
                let meta = entry.metadata().await.map_err(map_io)?;
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(kind) = media_kind_for(&path) else {
                    continue;
                };
                if !kinds.accepts(kind) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let created = meta
                    .modified()
                    .map(OffsetDateTime::from)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                out.push(MediaAsset {
                    asset_id: relative.to_string_lossy().replace('\\', "/"),
                    path,
                    kind,
                    created,
                    size: meta.len(),
                });
            }
        }
        Ok(out)
    }
}

fn map_io(err: io::Error) -> DiscoverError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        DiscoverError::PermissionDenied
    } else {
        DiscoverError::Io(err)
    }
}
