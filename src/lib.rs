pub mod coordinator;
pub mod models;
pub mod observer;
pub mod transport;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::coordinator::{CoordinatorError, DownloadCoordinator};
    pub use crate::models::{CompletedDownload, DownloadTask, TaskState};
    pub use crate::observer::{DownloadObserver, ObserverRegistry};
    pub use crate::transport::{
        HttpTransport, ResumeData, TransferHandle, Transport, TransportError, TransportEvent,
    };
}
