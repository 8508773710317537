use crate::InstallerError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use stratus_schema::ClusterId;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running => f.write_str("running"),
            TaskStatus::Succeeded => f.write_str("succeeded"),
            TaskStatus::Failed(reason) => write!(f, "failed: {reason}"),
            TaskStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug)]
struct TaskShared {
    cancel: AtomicBool,
    status: Mutex<TaskStatus>,
}

impl TaskShared {
    fn status(&self) -> MutexGuard<'_, TaskStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The running task's side of its entry: lets the body poll for
/// cancellation.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cluster_id: ClusterId,
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    pub fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct TaskEntry {
    join: Option<JoinHandle<()>>,
    shared: Arc<TaskShared>,
}

/// One background provisioning thread per cluster.
///
/// A task's record outlives its thread so the final status stays
/// queryable until the cluster is deleted. Finished threads are joined
/// whenever a new task starts.
#[derive(Debug, Default)]
pub struct ProvisionTasks {
    tasks: Mutex<HashMap<ClusterId, TaskEntry>>,
}

impl ProvisionTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<ClusterId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `body` on its own thread. Its return value becomes the task's
    /// final status; a panic is recorded as a failure.
    pub fn spawn<F>(&self, cluster_id: ClusterId, body: F) -> Result<(), InstallerError>
    where
        F: FnOnce(&TaskHandle) -> TaskStatus + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            cancel: AtomicBool::new(false),
            status: Mutex::new(TaskStatus::Running),
        });
        let handle = TaskHandle {
            cluster_id: cluster_id.clone(),
            shared: Arc::clone(&shared),
        };

        let mut tasks = self.tasks();
        if tasks
            .get(&cluster_id)
            .is_some_and(|entry| !entry.shared.status().is_finished())
        {
            return Err(InstallerError::AlreadyRegistered(cluster_id));
        }
        let finished = reap(&mut tasks);
        let join = thread::Builder::new()
            .name(format!("provision-{cluster_id}"))
            .spawn(move || {
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&handle)));
                let status = result.unwrap_or_else(|_| {
                    warn!("provisioning task for {} panicked", handle.cluster_id);
                    TaskStatus::Failed("provisioning task panicked".to_owned())
                });
                debug!("provisioning task for {} {status}", handle.cluster_id);
                *handle.shared.status() = status;
            })?;
        tasks.insert(
            cluster_id,
            TaskEntry {
                join: Some(join),
                shared,
            },
        );
        drop(tasks);
        for join in finished {
            let _ = join.join();
        }
        Ok(())
    }

    /// Drop the record of a finished task. A running task is left alone and
    /// `false` returned.
    pub fn forget(&self, cluster_id: &str) -> bool {
        let removed = {
            let mut tasks = self.tasks();
            let finished = tasks
                .get(cluster_id)
                .is_some_and(|entry| entry.shared.status().is_finished());
            if !finished {
                return false;
            }
            tasks.remove(cluster_id)
        };
        if let Some(join) = removed.and_then(|entry| entry.join) {
            let _ = join.join();
        }
        true
    }

    /// Number of task records, finished or not.
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self, cluster_id: &str) -> Option<TaskStatus> {
        self.tasks()
            .get(cluster_id)
            .map(|entry| entry.shared.status().clone())
    }

    /// Ask a running task to stop at its next step boundary. Returns `false`
    /// when there is no task or it has already finished.
    pub fn request_cancel(&self, cluster_id: &str) -> bool {
        let tasks = self.tasks();
        match tasks.get(cluster_id) {
            Some(entry) if !entry.shared.status().is_finished() => {
                entry.shared.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Block until the task finishes and return its status. The registry
    /// lock is not held while joining.
    pub fn wait(&self, cluster_id: &str) -> Option<TaskStatus> {
        let (join, shared) = {
            let mut tasks = self.tasks();
            let entry = tasks.get_mut(cluster_id)?;
            (entry.join.take(), Arc::clone(&entry.shared))
        };
        if let Some(join) = join {
            if join.join().is_err() {
                *shared.status() = TaskStatus::Failed("provisioning task panicked".to_owned());
            }
        }
        let status = shared.status().clone();
        Some(status)
    }

    pub fn wait_all(&self) {
        let ids: Vec<ClusterId> = self.tasks().keys().cloned().collect();
        for id in ids {
            self.wait(&id);
        }
    }
}

/// Take the join handles of threads whose body has already returned.
fn reap(tasks: &mut HashMap<ClusterId, TaskEntry>) -> Vec<JoinHandle<()>> {
    tasks
        .values_mut()
        .filter(|entry| entry.shared.status().is_finished())
        .filter_map(|entry| entry.join.take())
        .collect()
}
