use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{CompletedDownload, DownloadTask, TaskState};
use crate::observer::{DownloadObserver, ObserverRegistry};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a download for {0} is already active or queued")]
    AlreadyActive(String),
}

/// Everything the coordinator mutates, behind one lock.
///
/// The admission check always runs under the same guard as the mutation
/// that triggered it, so two concurrent triggers can never both see stale
/// capacity and over-admit.
struct CoordinatorState<P> {
    /// All live tasks, keyed by source URL.
    active: HashMap<String, DownloadTask>,
    /// Caller payloads, kept in lockstep with `active`.
    payloads: HashMap<String, P>,
    /// FIFO admission order; holds keys of tasks in `Queued` state.
    queue: VecDeque<String>,
    /// Number of tasks currently in `Downloading` state.
    downloading: usize,
    /// Transfer id -> task key, for routing transport events.
    transfers: HashMap<u64, String>,
}

/// Owns the download lifecycle: admission up to a fixed concurrency limit,
/// FIFO queuing, pause/resume with transport checkpoints, and observer
/// notification on every state change.
///
/// Construct one per application and share it behind an `Arc`; there is no
/// global instance. Completed downloads are pushed as
/// `(payload, location)` pairs into the channel given at construction;
/// persistence is the receiver's concern.
pub struct DownloadCoordinator<P> {
    inner: Mutex<CoordinatorState<P>>,
    transport: Arc<dyn Transport>,
    observers: ObserverRegistry,
    completed_tx: mpsc::UnboundedSender<CompletedDownload<P>>,
    limit: usize,
}

impl<P: Send + 'static> DownloadCoordinator<P> {
    pub fn new(
        transport: Arc<dyn Transport>,
        limit: usize,
        completed_tx: mpsc::UnboundedSender<CompletedDownload<P>>,
    ) -> Self {
        Self {
            inner: Mutex::new(CoordinatorState {
                active: HashMap::new(),
                payloads: HashMap::new(),
                queue: VecDeque::new(),
                downloading: 0,
                transfers: HashMap::new(),
            }),
            transport,
            observers: ObserverRegistry::new(),
            completed_tx,
            limit,
        }
    }

    /// Consumes a transport's event stream and feeds it into the
    /// coordinator until the transport drops its sender.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                coordinator.handle_transport_event(event).await;
            }
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn DownloadObserver>) {
        self.observers.register(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn DownloadObserver>) {
        self.observers.unregister(observer);
    }

    /// Creates a `Queued` task for `url`, binds `payload` to it, and admits
    /// it immediately if a download slot is free.
    ///
    /// A key may only have one live task: re-requesting an active or queued
    /// URL is rejected rather than silently restarted.
    pub async fn request_download(
        &self,
        url: impl Into<String>,
        payload: P,
    ) -> Result<(), CoordinatorError> {
        let url = url.into();
        let mut changed = Vec::new();
        {
            let mut state = self.inner.lock().await;
            if state.active.contains_key(&url) {
                return Err(CoordinatorError::AlreadyActive(url));
            }

            let task = DownloadTask::new(url.clone());
            changed.push(task.clone());
            state.active.insert(url.clone(), task);
            state.payloads.insert(url.clone(), payload);
            state.queue.push_back(url.clone());
            info!(url = %url, "download requested");

            self.admit_from_queue(&mut state, &mut changed);
        }
        self.flush_state_changes(changed);
        Ok(())
    }

    /// Removes the task for `url` from every container, aborting its
    /// transfer if one is in flight. No-op for unknown keys, so calling it
    /// twice is harmless.
    pub async fn cancel(&self, url: &str) {
        let mut changed = Vec::new();
        {
            let mut state = self.inner.lock().await;
            let Some(mut task) = state.active.remove(url) else {
                return;
            };
            state.payloads.remove(url);

            if let Some(handle) = task.handle.take() {
                state.transfers.remove(&handle.id());
                self.transport.abort(&handle);
            }
            if task.state == TaskState::Downloading {
                state.downloading -= 1;
                self.admit_from_queue(&mut state, &mut changed);
            }
            state.queue.retain(|queued| queued != url);
            info!(url = %url, "download cancelled");

            // Observers see the terminal transition last for this task.
            changed.push(task);
        }
        self.flush_state_changes(changed);
    }

    /// Aborts the transfer for `url` while asking the transport for a
    /// checkpoint, frees its download slot, and parks the task as `Paused`.
    ///
    /// The checkpoint arrives asynchronously and may be absent if the
    /// transfer had not progressed enough; `resume` copes with both.
    /// No-op unless the task is currently `Downloading`.
    pub async fn pause(&self, url: &str) {
        let mut changed = Vec::new();
        {
            let mut state = self.inner.lock().await;
            let Some(task) = state.active.get_mut(url) else {
                return;
            };
            if task.state != TaskState::Downloading {
                return;
            }

            if let Some(handle) = task.handle.take() {
                // The transfers entry stays: ResumeDataReady still has to
                // find its way back to this task.
                self.transport.abort_for_resumption(&handle);
            }
            task.state = TaskState::Paused;
            let paused = task.clone();

            state.downloading -= 1;
            self.admit_from_queue(&mut state, &mut changed);
            state.queue.retain(|queued| queued != url);
            info!(url = %url, "download paused");

            changed.push(paused);
        }
        self.flush_state_changes(changed);
    }

    /// Re-enqueues a `Paused` task at the tail of the FIFO queue. The
    /// stored checkpoint, if any, is consumed when the task is admitted;
    /// otherwise admission starts a fresh transfer from the source URL.
    /// No-op unless the task is currently `Paused`.
    pub async fn resume(&self, url: &str) {
        let mut changed = Vec::new();
        {
            let mut state = self.inner.lock().await;
            let Some(task) = state.active.get_mut(url) else {
                return;
            };
            if task.state != TaskState::Paused {
                return;
            }

            task.state = TaskState::Queued;
            let resumable = task.is_resumable();
            changed.push(task.clone());
            state.queue.push_back(url.to_string());
            info!(url = %url, resumable, "download resumed");

            self.admit_from_queue(&mut state, &mut changed);
        }
        self.flush_state_changes(changed);
    }

    /// Applies one transport event. Events for transfers the coordinator no
    /// longer knows (cancelled, or already completed) are dropped silently.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Progress {
                id,
                bytes_written,
                total_written,
                total_expected,
            } => {
                let task = {
                    let state = self.inner.lock().await;
                    state
                        .transfers
                        .get(&id)
                        .and_then(|url| state.active.get(url))
                        .cloned()
                };
                if let Some(task) = task {
                    self.observers
                        .notify_progress(&task, bytes_written, total_written, total_expected);
                }
            }

            TransportEvent::Completed { id, location } => {
                let mut changed = Vec::new();
                let finished = {
                    let mut state = self.inner.lock().await;
                    let Some(url) = state.transfers.remove(&id) else {
                        debug!(id, "completion for unknown transfer, ignoring");
                        return;
                    };
                    let Some(mut task) = state.active.remove(&url) else {
                        return;
                    };
                    let payload = state.payloads.remove(&url);

                    if task.state == TaskState::Downloading {
                        state.downloading -= 1;
                        self.admit_from_queue(&mut state, &mut changed);
                    }
                    task.handle = None;
                    info!(url = %url, location = %location.display(), "download completed");
                    (task, payload)
                };

                let (task, payload) = finished;
                if let Some(payload) = payload {
                    let _ = self.completed_tx.send(CompletedDownload {
                        payload,
                        location: location.clone(),
                    });
                }
                self.flush_state_changes(changed);
                self.observers.notify_completed(&task, &location);
            }

            TransportEvent::Failed { id, error } => {
                let mut changed = Vec::new();
                let failed = {
                    let mut state = self.inner.lock().await;
                    let Some(url) = state.transfers.remove(&id) else {
                        debug!(id, "failure for unknown transfer, ignoring");
                        return;
                    };
                    let Some(mut task) = state.active.remove(&url) else {
                        return;
                    };
                    state.payloads.remove(&url);

                    if task.state == TaskState::Downloading {
                        state.downloading -= 1;
                        self.admit_from_queue(&mut state, &mut changed);
                    }
                    task.handle = None;
                    warn!(url = %url, %error, "download failed");
                    task
                };

                self.flush_state_changes(changed);
                self.observers.notify_failed(&failed, &error);
            }

            TransportEvent::ResumeDataReady { id, data } => {
                let mut state = self.inner.lock().await;
                let Some(url) = state.transfers.remove(&id) else {
                    return;
                };
                let Some(task) = state.active.get_mut(&url) else {
                    return;
                };
                // The task may already be queued again if the user resumed
                // before the checkpoint arrived; it has not started a new
                // transfer yet, so the checkpoint is still worth keeping.
                if matches!(task.state, TaskState::Paused | TaskState::Queued)
                    && task.resume_data.is_none()
                {
                    debug!(url = %url, present = data.is_some(), "stored resume data");
                    task.resume_data = data;
                }
            }
        }
    }

    /// Pops queued tasks into free download slots, oldest first. Must run
    /// under the state guard of the mutation that changed queue or counter.
    fn admit_from_queue(&self, state: &mut CoordinatorState<P>, changed: &mut Vec<DownloadTask>) {
        while state.downloading < self.limit {
            let Some(url) = state.queue.pop_front() else {
                break;
            };
            let Some(task) = state.active.get_mut(&url) else {
                continue;
            };

            let handle = match task.resume_data.take() {
                Some(data) => self.transport.start_resumed(data),
                None => self.transport.start(&url),
            };
            state.transfers.insert(handle.id(), url.clone());
            task.handle = Some(handle);
            task.state = TaskState::Downloading;
            state.downloading += 1;
            debug!(url = %url, downloading = state.downloading, "admitted from queue");

            changed.push(task.clone());
        }
    }

    /// Delivers pending state-change notifications. Callers invoke this
    /// after releasing the state guard so observers can read back into the
    /// coordinator without deadlocking.
    fn flush_state_changes(&self, changed: Vec<DownloadTask>) {
        for task in &changed {
            self.observers.notify_state_changed(task);
        }
    }

    /// Snapshot of every live task, queued, downloading and paused alike.
    pub async fn downloads(&self) -> Vec<DownloadTask> {
        self.inner.lock().await.active.values().cloned().collect()
    }

    /// Snapshot of the task for `url`, if it is still live.
    pub async fn get(&self, url: &str) -> Option<DownloadTask> {
        self.inner.lock().await.active.get(url).cloned()
    }

    /// Number of tasks currently holding a download slot.
    pub async fn downloading_count(&self) -> usize {
        self.inner.lock().await.downloading
    }
}
