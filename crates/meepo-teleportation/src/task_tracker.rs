//! Task tracking for relayed streams
//!
//! Each teleported connection runs on its own task, keyed by the stream
//! label. Finished tasks deregister themselves; closing a half aborts
//! whatever is still running.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Default)]
struct Tasks {
    running: HashMap<String, (u64, JoinHandle<()>)>,
    next_id: u64,
    closed: bool,
}

/// Tracks the per-stream tasks of one teleportation half
#[derive(Default)]
pub struct StreamTracker {
    tasks: Mutex<Tasks>,
}

impl StreamTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn `fut` as the task for `label`
    ///
    /// A previous task under the same label is aborted. Returns false without
    /// spawning once the tracker has been shut down.
    pub fn spawn<F>(self: &Arc<Self>, label: String, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Held across the spawn so the task cannot deregister before it is
        // inserted
        let mut tasks = self.lock();
        if tasks.closed {
            return false;
        }

        let id = tasks.next_id;
        tasks.next_id += 1;

        let tracker = Arc::downgrade(self);
        let key = label.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.finish(&key, id);
            }
        });

        if let Some((_, old)) = tasks.running.insert(label, (id, handle)) {
            old.abort();
        }
        true
    }

    /// Abort every task and refuse new ones
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut tasks = self.lock();
            tasks.closed = true;
            tasks.running.drain().collect()
        };
        trace!(tasks = drained.len(), "aborting stream tasks");
        for (_, (_, handle)) in drained {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, label: &str, id: u64) {
        let mut tasks = self.lock();
        if tasks.running.get(label).is_some_and(|(current, _)| *current == id) {
            tasks.running.remove(label);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTracker")
            .field("running", &self.len())
            .finish()
    }
}
