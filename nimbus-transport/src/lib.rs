pub mod client;
pub mod task;

pub use client::{
    DownloadHandle, DownloadOutcome, FolderEntry, FolderMetadata, TransportClient, UploadHandle,
    UploadOutcome,
};
pub use task::{TaskKind, TaskState, TransferTask};

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("server returned {status} for {path}")]
    Status { status: StatusCode, path: String },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer task aborted before completion")]
    Aborted,
}

impl TransportError {
    /// Auth and client-side errors are permanent; everything else is worth
    /// another attempt on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
                    )
            }
            TransportError::Request(_) | TransportError::Io(_) => true,
            _ => false,
        }
    }
}
