use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Suspended,
    Completed,
}

const STATE_RUNNING: u8 = 0;
const STATE_SUSPENDED: u8 = 1;
const STATE_COMPLETED: u8 = 2;

/// One in-flight transfer as seen by the transport layer. Handles are shared
/// (`Arc`) between the live-task registry and whoever dispatched the transfer.
pub struct TransferTask {
    id: u64,
    kind: TaskKind,
    account: String,
    remote_path: String,
    local_path: PathBuf,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl TransferTask {
    pub(crate) fn new(
        id: u64,
        kind: TaskKind,
        account: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            account: account.to_string(),
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            state: AtomicU8::new(STATE_RUNNING),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::SeqCst) {
            STATE_SUSPENDED => TaskState::Suspended,
            STATE_COMPLETED => TaskState::Completed,
            _ => TaskState::Running,
        }
    }

    /// Running or suspended; completed tasks are only kept around until the
    /// next registry sweep.
    pub fn is_live(&self) -> bool {
        self.state() != TaskState::Completed
    }

    pub fn suspend(&self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_SUSPENDED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn resume(&self) {
        let _ = self.state.compare_exchange(
            STATE_SUSPENDED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn set_completed(&self) {
        self.state.store(STATE_COMPLETED, Ordering::SeqCst);
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_path", &self.remote_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of every task the client has started and not yet finished.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    next_id: AtomicU64,
    tasks: Mutex<Vec<Arc<TransferTask>>>,
}

impl TaskRegistry {
    pub(crate) fn start(
        &self,
        kind: TaskKind,
        account: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Arc<TransferTask> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let task = TransferTask::new(id, kind, account, remote_path, local_path);
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .push(Arc::clone(&task));
        task
    }

    pub(crate) fn finish(&self, task: &TransferTask) {
        task.set_completed();
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .retain(|entry| entry.id() != task.id());
    }

    pub(crate) fn live(&self) -> Vec<Arc<TransferTask>> {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .iter()
            .filter(|task| task.is_live())
            .cloned()
            .collect()
    }
}
