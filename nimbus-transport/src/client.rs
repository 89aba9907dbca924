use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::TransportError;
use crate::task::{TaskKind, TaskRegistry, TransferTask};

/// Folder listing as served by the metadata endpoint. With `etag_only` the
/// server omits `entries` and only the folder ETag is returned.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderMetadata {
    pub etag: String,
    #[serde(default)]
    pub entries: Vec<FolderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    pub etag: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub etag: Option<String>,
}

/// Handle to an in-flight upload: the registry-visible task plus the future
/// resolving its outcome.
pub struct UploadHandle {
    pub task: Arc<TransferTask>,
    join: JoinHandle<Result<UploadOutcome, TransportError>>,
}

impl UploadHandle {
    pub async fn outcome(self) -> Result<UploadOutcome, TransportError> {
        self.join.await.map_err(|_| TransportError::Aborted)?
    }
}

pub struct DownloadHandle {
    pub task: Arc<TransferTask>,
    join: JoinHandle<Result<DownloadOutcome, TransportError>>,
}

impl DownloadHandle {
    pub async fn outcome(self) -> Result<DownloadOutcome, TransportError> {
        self.join.await.map_err(|_| TransportError::Aborted)?
    }
}

#[derive(Clone)]
pub struct TransportClient {
    http: Client,
    base_url: Url,
    token: String,
    registry: Arc<TaskRegistry>,
}

impl TransportClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            registry: Arc::new(TaskRegistry::default()),
        })
    }

    /// Every task started by this client that has not yet completed.
    pub fn live_tasks(&self) -> Vec<Arc<TransferTask>> {
        self.registry.live()
    }

    /// Start a streaming PUT of `local` to `remote_path`. Returns immediately;
    /// the transfer runs on the runtime and the handle resolves its outcome.
    pub fn submit_upload(
        &self,
        account: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<UploadHandle, TransportError> {
        let url = self.files_url(account, remote_path)?;
        let task = self
            .registry
            .start(TaskKind::Upload, account, remote_path, local);
        let cancel = task.cancellation();

        let http = self.http.clone();
        let token = self.token.clone();
        let registry = Arc::clone(&self.registry);
        let source = local.to_path_buf();
        let remote = remote_path.to_string();
        let task_for_join = Arc::clone(&task);
        let join = tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                res = run_upload(http, url, token, source, remote) => res,
            };
            registry.finish(&task_for_join);
            result
        });

        Ok(UploadHandle { task, join })
    }

    /// Start a streaming GET of `remote_path` into `target`, written via a
    /// `.partial` sibling renamed into place on success.
    pub fn submit_download(
        &self,
        account: &str,
        remote_path: &str,
        target: &Path,
    ) -> Result<DownloadHandle, TransportError> {
        let url = self.files_url(account, remote_path)?;
        let task = self
            .registry
            .start(TaskKind::Download, account, remote_path, target);
        let cancel = task.cancellation();

        let http = self.http.clone();
        let token = self.token.clone();
        let registry = Arc::clone(&self.registry);
        let target = target.to_path_buf();
        let remote = remote_path.to_string();
        let task_for_join = Arc::clone(&task);
        let join = tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                res = run_download(http, url, token, target, remote) => res,
            };
            registry.finish(&task_for_join);
            result
        });

        Ok(DownloadHandle { task, join })
    }

    /// Fetch folder metadata. With `etag_only` the request asks for depth 0,
    /// which skips the entry listing on the server side.
    pub async fn folder_metadata(
        &self,
        account: &str,
        path: &str,
        etag_only: bool,
    ) -> Result<FolderMetadata, TransportError> {
        let mut url = self.meta_url(account, path)?;
        url.query_pairs_mut()
            .append_pair("depth", if etag_only { "0" } else { "1" });
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status(),
                path: path.to_string(),
            });
        }
        Ok(response.json::<FolderMetadata>().await?)
    }

    fn files_url(&self, account: &str, remote_path: &str) -> Result<Url, TransportError> {
        self.endpoint("files", account, remote_path)
    }

    fn meta_url(&self, account: &str, remote_path: &str) -> Result<Url, TransportError> {
        self.endpoint("meta", account, remote_path)
    }

    fn endpoint(&self, root: &str, account: &str, remote_path: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidBaseUrl)?;
            segments.push(root);
            segments.push(account);
            for part in remote_path.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }
}

async fn run_upload(
    http: Client,
    url: Url,
    token: String,
    source: PathBuf,
    remote: String,
) -> Result<UploadOutcome, TransportError> {
    // Checksum first so the server can verify the body it receives.
    let bytes = tokio::fs::read(&source).await?;
    let checksum = format!("{:x}", md5::compute(&bytes));
    drop(bytes);

    let file = tokio::fs::File::open(&source).await?;
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    let response = http
        .put(url)
        .bearer_auth(token)
        .header("X-Checksum-Md5", checksum)
        .body(body)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(TransportError::Status {
            status: response.status(),
            path: remote,
        });
    }
    Ok(UploadOutcome {
        etag: header_etag(response.headers()),
    })
}

async fn run_download(
    http: Client,
    url: Url,
    token: String,
    target: PathBuf,
    remote: String,
) -> Result<DownloadOutcome, TransportError> {
    use futures_util::StreamExt;

    let response = http.get(url).bearer_auth(token).send().await?;
    if !response.status().is_success() {
        return Err(TransportError::Status {
            status: response.status(),
            path: remote,
        });
    }
    let etag = header_etag(response.headers());

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(&target);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    tokio::fs::rename(partial, target).await?;

    Ok(DownloadOutcome { etag })
}

fn header_etag(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_matches('"').to_string())
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
