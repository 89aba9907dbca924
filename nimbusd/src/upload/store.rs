use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid transfer status: {0}")]
    InvalidStatus(String),
    #[error("invalid transfer session: {0}")]
    InvalidSession(String),
    #[error("invalid transfer selector: {0}")]
    InvalidSelector(String),
    #[error("transfer not found after insert")]
    MissingRecord,
}

/// Exactly one status at a time; transitions are driven by the scheduler and
/// by zombie reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    WaitUpload,
    InUpload,
    Uploading,
    UploadError,
    Normal,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::WaitUpload => "wait_upload",
            TransferStatus::InUpload => "in_upload",
            TransferStatus::Uploading => "uploading",
            TransferStatus::UploadError => "upload_error",
            TransferStatus::Normal => "normal",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "wait_upload" => Ok(TransferStatus::WaitUpload),
            "in_upload" => Ok(TransferStatus::InUpload),
            "uploading" => Ok(TransferStatus::Uploading),
            "upload_error" => Ok(TransferStatus::UploadError),
            "normal" => Ok(TransferStatus::Normal),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Which transport queue a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSession {
    Upload,
    UploadBackground,
    UploadBackgroundWifi,
    UploadBackgroundExt,
    Download,
}

impl TransferSession {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferSession::Upload => "upload",
            TransferSession::UploadBackground => "upload_background",
            TransferSession::UploadBackgroundWifi => "upload_background_wifi",
            TransferSession::UploadBackgroundExt => "upload_background_ext",
            TransferSession::Download => "download",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "upload" => Ok(TransferSession::Upload),
            "upload_background" => Ok(TransferSession::UploadBackground),
            "upload_background_wifi" => Ok(TransferSession::UploadBackgroundWifi),
            "upload_background_ext" => Ok(TransferSession::UploadBackgroundExt),
            "download" => Ok(TransferSession::Download),
            other => Err(StoreError::InvalidSession(other.to_string())),
        }
    }

    pub fn is_background_upload(&self) -> bool {
        matches!(
            self,
            TransferSession::UploadBackground
                | TransferSession::UploadBackgroundWifi
                | TransferSession::UploadBackgroundExt
        )
    }

    pub fn demands_wifi(&self) -> bool {
        matches!(self, TransferSession::UploadBackgroundWifi)
    }
}

/// Business purpose of a transfer; drives scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    AutoUpload,
    AutoUploadAll,
    ManualUpload,
    ExtensionUpload,
    Download,
}

/// Fixed dispatch priority across selector buckets. Extension uploads are
/// owned by the extension process and never dispatched here.
pub const SELECTOR_PRIORITY: [Selector; 3] = [
    Selector::ManualUpload,
    Selector::AutoUpload,
    Selector::AutoUploadAll,
];

impl Selector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selector::AutoUpload => "auto_upload",
            Selector::AutoUploadAll => "auto_upload_all",
            Selector::ManualUpload => "manual_upload",
            Selector::ExtensionUpload => "extension_upload",
            Selector::Download => "download",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "auto_upload" => Ok(Selector::AutoUpload),
            "auto_upload_all" => Ok(Selector::AutoUploadAll),
            "manual_upload" => Ok(Selector::ManualUpload),
            "extension_upload" => Ok(Selector::ExtensionUpload),
            "download" => Ok(Selector::Download),
            other => Err(StoreError::InvalidSelector(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferInput {
    pub account: String,
    pub asset_id: Option<String>,
    pub server_url: String,
    pub file_name: String,
    pub file_name_view: String,
    pub local_path: String,
    pub session: TransferSession,
    pub selector: Selector,
    pub chunked: bool,
    pub e2e_encrypted: bool,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: i64,
    pub account: String,
    pub asset_id: Option<String>,
    pub server_url: String,
    pub file_name: String,
    pub file_name_view: String,
    pub local_path: String,
    pub status: TransferStatus,
    pub session: TransferSession,
    pub selector: Selector,
    pub task_id: i64,
    pub chunked: bool,
    pub e2e_encrypted: bool,
    pub session_error: String,
    pub created: i64,
}

impl TransferRecord {
    /// Full remote path of the file once uploaded.
    pub fn destination(&self) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.file_name
        )
    }
}

const TRANSFER_COLUMNS: &str = "id, account, asset_id, server_url, file_name, file_name_view, \
     local_path, status, session, selector, task_id, chunked, e2e_encrypted, session_error, created";

/// SQLite-backed source of truth for transfer records, the media-library
/// index and per-folder ETags. Mutations of the transfers table tick the
/// change channel so the scheduler can re-scan without polling.
#[derive(Clone)]
pub struct TransferStore {
    pool: SqlitePool,
    changes: watch::Sender<u64>,
}

impl TransferStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        let (changes, _) = watch::channel(0);
        Self { pool, changes }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_at(db_path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::new_at(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                asset_id TEXT,
                server_url TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_name_view TEXT NOT NULL,
                local_path TEXT NOT NULL,
                status TEXT NOT NULL,
                session TEXT NOT NULL,
                selector TEXT NOT NULL,
                task_id INTEGER NOT NULL DEFAULT 0,
                chunked INTEGER NOT NULL DEFAULT 0,
                e2e_encrypted INTEGER NOT NULL DEFAULT 0,
                session_error TEXT NOT NULL DEFAULT '',
                created INTEGER NOT NULL,
                UNIQUE(account, server_url, file_name)
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS transfers_status_idx
                 ON transfers (account, status, selector, created);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS media_index (
                account TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                created TEXT NOT NULL,
                PRIMARY KEY (account, asset_id, created)
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS folder_etags (
                account TEXT NOT NULL,
                path TEXT NOT NULL,
                etag TEXT NOT NULL,
                PRIMARY KEY (account, path)
            );",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Receiver ticks on every mutation of the transfers table.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    pub async fn create_transfer(
        &self,
        input: &TransferInput,
    ) -> Result<TransferRecord, StoreError> {
        let result = sqlx::query(
            "INSERT INTO transfers (
                account, asset_id, server_url, file_name, file_name_view, local_path,
                status, session, selector, task_id, chunked, e2e_encrypted, session_error, created
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, '', ?12)",
        )
        .bind(&input.account)
        .bind(&input.asset_id)
        .bind(&input.server_url)
        .bind(&input.file_name)
        .bind(&input.file_name_view)
        .bind(&input.local_path)
        .bind(TransferStatus::WaitUpload.as_str())
        .bind(input.session.as_str())
        .bind(input.selector.as_str())
        .bind(if input.chunked { 1 } else { 0 })
        .bind(if input.e2e_encrypted { 1 } else { 0 })
        .bind(input.created)
        .execute(&self.pool)
        .await?;

        self.notify();
        self.get_transfer(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRecord)
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Option<TransferRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    /// Duplicate gate: does any record at this destination folder carry the
    /// given name as either its server-side or its view name?
    pub async fn has_transfer_matching(
        &self,
        account: &str,
        server_url: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM transfers
             WHERE account = ?1 AND server_url = ?2
               AND (file_name = ?3 OR file_name_view = ?3)",
        )
        .bind(account)
        .bind(server_url)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count > 0)
    }

    pub async fn list_waiting(
        &self,
        account: &str,
        selector: Selector,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE account = ?1 AND status = 'wait_upload' AND selector = ?2
             ORDER BY created ASC, id ASC
             LIMIT ?3"
        ))
        .bind(account)
        .bind(selector.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn list_in_flight(&self, account: &str) -> Result<Vec<TransferRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE account = ?1 AND status IN ('in_upload', 'uploading')
             ORDER BY created ASC, id ASC"
        ))
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn count_in_flight(&self, account: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM transfers
             WHERE account = ?1 AND status IN ('in_upload', 'uploading')",
        )
        .bind(account)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_waiting(&self, account: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM transfers WHERE account = ?1 AND status = 'wait_upload'",
        )
        .bind(account)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn set_status(&self, id: i64, status: TransferStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE transfers SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    /// Record is now owned by a live transport task.
    pub async fn bind_task(&self, id: i64, task_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE transfers SET status = 'uploading', task_id = ?1 WHERE id = ?2")
            .bind(task_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    pub async fn set_upload_error(&self, id: i64, message: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transfers SET status = 'upload_error', session_error = ?1, task_id = 0
             WHERE id = ?2",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.notify();
        Ok(())
    }

    /// Back to the retryable pending state: error cleared, no bound task.
    pub async fn reset_to_wait(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transfers
             SET status = 'wait_upload', session_error = '', task_id = 0
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.notify();
        Ok(())
    }

    /// Unconditional retry of every terminally-failed record, rebound to the
    /// default background session. Returns the number of rows touched.
    pub async fn reset_errors_to_wait(&self, account: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE transfers
             SET status = 'wait_upload', session_error = '', task_id = 0,
                 session = 'upload_background'
             WHERE account = ?1 AND status = 'upload_error'",
        )
        .bind(account)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            self.notify();
        }
        Ok(result.rows_affected())
    }

    pub async fn delete_transfer(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM transfers WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    /// Asset identifiers still referenced by any transfer record.
    pub async fn assets_with_transfers(&self, account: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT asset_id FROM transfers
             WHERE account = ?1 AND asset_id IS NOT NULL",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("asset_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn record_media(
        &self,
        account: &str,
        asset_id: &str,
        created: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO media_index (account, asset_id, created) VALUES (?1, ?2, ?3)",
        )
        .bind(account)
        .bind(asset_id)
        .bind(created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn media_contains(
        &self,
        account: &str,
        asset_id: &str,
        created: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM media_index
             WHERE account = ?1 AND asset_id = ?2 AND created = ?3",
        )
        .bind(account)
        .bind(asset_id)
        .bind(created)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count > 0)
    }

    pub async fn media_assets(&self, account: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT asset_id FROM media_index WHERE account = ?1")
            .bind(account)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("asset_id").map_err(StoreError::from))
            .collect()
    }

    /// Replace the index for an account with exactly the given set (align /
    /// full-resync mode).
    pub async fn rebuild_media_index(
        &self,
        account: &str,
        entries: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM media_index WHERE account = ?1")
            .bind(account)
            .execute(&mut *tx)
            .await?;
        for (asset_id, created) in entries {
            sqlx::query(
                "INSERT OR IGNORE INTO media_index (account, asset_id, created) VALUES (?1, ?2, ?3)",
            )
            .bind(account)
            .bind(asset_id)
            .bind(created)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn folder_etag(
        &self,
        account: &str,
        path: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT etag FROM folder_etags WHERE account = ?1 AND path = ?2")
            .bind(account)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("etag").map_err(StoreError::from))
            .transpose()
    }

    pub async fn set_folder_etag(
        &self,
        account: &str,
        path: &str,
        etag: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO folder_etags (account, path, etag) VALUES (?1, ?2, ?3)
             ON CONFLICT(account, path) DO UPDATE SET etag = excluded.etag",
        )
        .bind(account)
        .bind(path)
        .bind(etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TransferRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let session: String = row.try_get("session")?;
    let selector: String = row.try_get("selector")?;
    let chunked: i64 = row.try_get("chunked")?;
    let e2e_encrypted: i64 = row.try_get("e2e_encrypted")?;
    Ok(TransferRecord {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        asset_id: row.try_get("asset_id")?,
        server_url: row.try_get("server_url")?,
        file_name: row.try_get("file_name")?,
        file_name_view: row.try_get("file_name_view")?,
        local_path: row.try_get("local_path")?,
        status: TransferStatus::parse(&status)?,
        session: TransferSession::parse(&session)?,
        selector: Selector::parse(&selector)?,
        task_id: row.try_get("task_id")?,
        chunked: chunked != 0,
        e2e_encrypted: e2e_encrypted != 0,
        session_error: row.try_get("session_error")?,
        created: row.try_get("created")?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("nimbus");
    path.push("transfers.db");
    Ok(path)
}
