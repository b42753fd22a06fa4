use std::path::PathBuf;

use crate::transport::{ResumeData, TransferHandle};

/// The lifecycle state of a download task.
///
/// There is no terminal variant: a finished or cancelled task is removed
/// from the coordinator's active-set instead of being marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the FIFO queue for a free download slot.
    Queued,
    /// Admitted; the transport is moving bytes for this task.
    Downloading,
    /// Aborted by the user, possibly holding resume data for a later restart.
    Paused,
}

/// One download's lifecycle record.
///
/// The source URL doubles as the task's identity: the coordinator keys its
/// active-set by it, so it must stay stable for the task's lifetime.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub state: TaskState,
    /// Checkpoint produced by the last pause, consumed by the next admission.
    pub(crate) resume_data: Option<ResumeData>,
    /// Control handle for the in-flight transfer; `Some` only while `Downloading`.
    pub(crate) handle: Option<TransferHandle>,
}

impl DownloadTask {
    pub(crate) fn new(url: String) -> Self {
        Self {
            url,
            state: TaskState::Queued,
            resume_data: None,
            handle: None,
        }
    }

    /// Whether a restart would pick up from a partial transfer rather than
    /// fetching from scratch.
    pub fn is_resumable(&self) -> bool {
        self.resume_data.is_some()
    }
}

/// A finished download, handed off to the caller's persistence sink.
///
/// `location` points at the artifact the transport produced; moving it
/// somewhere durable is the receiver's job, not the coordinator's.
#[derive(Debug)]
pub struct CompletedDownload<P> {
    pub payload: P,
    pub location: PathBuf,
}
