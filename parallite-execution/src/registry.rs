//! In-flight task correlation and deadlines
//!
//! Every accepted submission is registered here before a worker is leased.
//! A registration owns the task's deadline timer and its one-shot
//! resolution state: the first of {completion, deadline expiry} wins and
//! later events on the same entry are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Completed,
    Expired,
}

#[derive(Debug)]
struct EntryShared {
    state: Mutex<EntryState>,
    /// Fired when the deadline expires; dispatchers race their worker
    /// exchange against this token.
    expired: CancellationToken,
}

/// Registry of live tasks keyed by task id.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<EntryShared>>>,
    timeout: Duration,
    accepting: AtomicBool,
}

impl TaskRegistry {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            timeout,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a task and start its deadline timer.
    ///
    /// Fails when the id is already live or the registry has been closed.
    pub fn register(self: &Arc<Self>, task_id: &str) -> Result<Registration, ExecutionError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ExecutionError::ShuttingDown);
        }

        let shared = Arc::new(EntryShared {
            state: Mutex::new(EntryState::Pending),
            expired: CancellationToken::new(),
        });
        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(task_id) {
                return Err(ExecutionError::DuplicateTask(task_id.to_owned()));
            }
            tasks.insert(task_id.to_owned(), Arc::clone(&shared));
        }

        let timer = tokio::spawn({
            let shared = Arc::clone(&shared);
            let timeout = self.timeout;
            let task_id = task_id.to_owned();
            async move {
                tokio::time::sleep(timeout).await;
                let mut state = shared.state.lock();
                if *state == EntryState::Pending {
                    *state = EntryState::Expired;
                    drop(state);
                    debug!(task_id = %task_id, "task deadline fired");
                    shared.expired.cancel();
                }
            }
        });

        Ok(Registration {
            task_id: task_id.to_owned(),
            shared,
            timer,
            registry: Arc::clone(self),
        })
    }

    /// Stop accepting registrations. Live entries keep running until they
    /// resolve or their deadlines fire.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Guard for one live task. Dropping it removes the entry and stops the
/// deadline timer.
#[derive(Debug)]
pub struct Registration {
    task_id: String,
    shared: Arc<EntryShared>,
    timer: JoinHandle<()>,
    registry: Arc<TaskRegistry>,
}

impl Registration {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Fired when this task's deadline expires.
    pub fn expired_token(&self) -> &CancellationToken {
        &self.shared.expired
    }

    /// Claim the entry for completion. Returns false if the deadline
    /// already fired, in which case the timeout response has won and the
    /// caller's result must be discarded.
    pub fn try_complete(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state == EntryState::Pending {
            *state = EntryState::Completed;
            true
        } else {
            false
        }
    }

    pub fn is_expired(&self) -> bool {
        *self.shared.state.lock() == EntryState::Expired
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.timer.abort();
        self.registry.tasks.lock().remove(&self.task_id);
    }
}
