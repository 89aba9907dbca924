use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use nimbus_transport::{TaskState, TransferTask};

/// Anything the tracker can hold: live transport tasks and in-process
/// workflow guards both qualify.
pub trait Trackable: Send + Sync {
    fn state(&self) -> TaskState;
    fn cancel(&self);
}

impl Trackable for TransferTask {
    fn state(&self) -> TaskState {
        TransferTask::state(self)
    }

    fn cancel(&self) {
        TransferTask::cancel(self)
    }
}

/// Registry of in-flight work keyed by a logical identifier (resource path +
/// purpose). The sole cancellation surface: callers cancel by identifier,
/// never by task handle.
#[derive(Default)]
pub struct TaskTracker {
    inner: Mutex<HashMap<String, Vec<Arc<dyn Trackable>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `identifier`, dropping any prior entry for the
    /// same identifier that is still live so repeated calls against the same
    /// resource never leak duplicate trackers.
    pub fn track(&self, identifier: &str, task: Arc<dyn Trackable>) {
        let mut inner = self.inner.lock().expect("task tracker poisoned");
        let entries = inner.entry(identifier.to_string()).or_default();
        entries.retain(|entry| entry.state() == TaskState::Completed);
        entries.push(task);
    }

    /// True iff a running or suspended task exists for the identifier.
    pub fn is_tracking(&self, identifier: &str) -> bool {
        let inner = self.inner.lock().expect("task tracker poisoned");
        inner
            .get(identifier)
            .is_some_and(|entries| {
                entries
                    .iter()
                    .any(|entry| entry.state() != TaskState::Completed)
            })
    }

    /// Cancel and forget every entry under the identifier.
    pub fn cancel(&self, identifier: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("task tracker poisoned");
            inner.remove(identifier)
        };
        if let Some(entries) = removed {
            for entry in entries {
                entry.cancel();
            }
        }
    }

    /// Purge completed entries. Opportunistic; correctness never depends on
    /// when this runs.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("task tracker poisoned");
        inner.retain(|_, entries| {
            entries.retain(|entry| entry.state() != TaskState::Completed);
            !entries.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("task tracker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const WORKFLOW_RUNNING: u8 = 0;
const WORKFLOW_COMPLETED: u8 = 1;

/// Trackable stand-in for a workflow that is not a transport task (e.g. a
/// folder metadata read). Completed by the owning [`WorkflowGuard`] on drop,
/// covering every exit path.
pub struct WorkflowTask {
    state: AtomicU8,
}

impl Trackable for WorkflowTask {
    fn state(&self) -> TaskState {
        if self.state.load(Ordering::SeqCst) == WORKFLOW_COMPLETED {
            TaskState::Completed
        } else {
            TaskState::Running
        }
    }

    fn cancel(&self) {
        self.state.store(WORKFLOW_COMPLETED, Ordering::SeqCst);
    }
}

pub struct WorkflowGuard {
    task: Arc<WorkflowTask>,
}

impl WorkflowGuard {
    pub fn begin() -> Self {
        Self {
            task: Arc::new(WorkflowTask {
                state: AtomicU8::new(WORKFLOW_RUNNING),
            }),
        }
    }

    pub fn task(&self) -> Arc<dyn Trackable> {
        Arc::clone(&self.task) as Arc<dyn Trackable>
    }
}

impl Drop for WorkflowGuard {
    fn drop(&mut self) {
        self.task.state.store(WORKFLOW_COMPLETED, Ordering::SeqCst);
    }
}
