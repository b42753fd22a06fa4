use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::models::DownloadTask;
use crate::transport::TransportError;

/// Receives coordinator lifecycle callbacks.
///
/// Callbacks are synchronous and are invoked after the coordinator has
/// finished its own state mutation, so an observer may read coordinator
/// state re-entrantly. Blocking in a callback stalls delivery to the
/// observers registered after it.
pub trait DownloadObserver: Send + Sync {
    /// A task changed state. Also fired for the terminal transition, with
    /// the task already removed from the active-set.
    fn on_state_changed(&self, task: &DownloadTask);

    /// The transport wrote `bytes_written` more bytes for `task`.
    fn on_progress(
        &self,
        _task: &DownloadTask,
        _bytes_written: u64,
        _total_written: u64,
        _total_expected: Option<u64>,
    ) {
    }

    /// `task` finished; its artifact sits at `location`.
    fn on_completed(&self, _task: &DownloadTask, _location: &Path) {}

    /// `task` ended without an artifact.
    fn on_failed(&self, _task: &DownloadTask, _error: &TransportError) {}
}

/// Fan-out list of observers, deduplicated by identity.
///
/// Identity means the `Arc` allocation, not value equality: registering a
/// clone of an already-registered `Arc` is a no-op, registering a second
/// observer of the same type is not. Notification order is registration
/// order.
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn DownloadObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Arc<dyn DownloadObserver>) {
        let mut observers = self.observers.lock().unwrap();
        if observers.iter().any(|existing| Arc::ptr_eq(existing, &observer)) {
            return;
        }
        observers.push(observer);
    }

    pub fn unregister(&self, observer: &Arc<dyn DownloadObserver>) {
        self.observers
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    /// Snapshot under the lock, notify outside it, so a callback can
    /// register or unregister observers without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn DownloadObserver>> {
        self.observers.lock().unwrap().clone()
    }

    pub fn notify_state_changed(&self, task: &DownloadTask) {
        for observer in self.snapshot() {
            observer.on_state_changed(task);
        }
    }

    pub fn notify_progress(
        &self,
        task: &DownloadTask,
        bytes_written: u64,
        total_written: u64,
        total_expected: Option<u64>,
    ) {
        for observer in self.snapshot() {
            observer.on_progress(task, bytes_written, total_written, total_expected);
        }
    }

    pub fn notify_completed(&self, task: &DownloadTask, location: &Path) {
        for observer in self.snapshot() {
            observer.on_completed(task, location);
        }
    }

    pub fn notify_failed(&self, task: &DownloadTask, error: &TransportError) {
        for observer in self.snapshot() {
            observer.on_failed(task, error);
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
