use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors a transfer can terminate with.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed resume data: {0}")]
    BadResumeData(#[from] serde_json::Error),
    #[error("artifact missing or unreadable at completion")]
    ArtifactUnreadable,
}

/// Identifies one in-flight transfer.
///
/// Minted by the transport that started the transfer; the coordinator only
/// stores and returns it, it never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

impl TransferHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Checkpoint produced by an aborted transfer.
///
/// Opaque outside this module: the coordinator carries it across a
/// pause/resume cycle without interpreting it, and only the transport can
/// mint or consume one. `to_bytes`/`from_bytes` exist so callers can stash
/// a paused checkpoint beyond the coordinator's lifetime if they want to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeData {
    url: String,
    part_path: PathBuf,
    bytes_written: u64,
    total_expected: Option<u64>,
}

impl ResumeData {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a plain struct of strings and integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Events pushed by a transport to whoever owns the receiving end,
/// keyed by the id of the `TransferHandle` they concern.
#[derive(Debug)]
pub enum TransportEvent {
    /// A chunk of the transfer was written.
    Progress {
        id: u64,
        bytes_written: u64,
        total_written: u64,
        total_expected: Option<u64>,
    },
    /// The transfer finished and the artifact at `location` is readable.
    Completed { id: u64, location: PathBuf },
    /// The transfer ended without an artifact.
    Failed { id: u64, error: TransportError },
    /// Response to `abort_for_resumption`; `data` is `None` when the
    /// transfer had nothing worth checkpointing.
    ResumeDataReady { id: u64, data: Option<ResumeData> },
}

/// The byte-moving seam the coordinator drives.
///
/// Starting is non-blocking: implementations spawn the actual transfer and
/// report progress and terminal outcomes through their event channel.
pub trait Transport: Send + Sync + 'static {
    /// Start a fresh transfer from the source address.
    fn start(&self, url: &str) -> TransferHandle;

    /// Start a transfer from a previously produced checkpoint.
    fn start_resumed(&self, data: ResumeData) -> TransferHandle;

    /// Abort the transfer and discard any partial data. Best-effort: the
    /// transfer may already have completed.
    fn abort(&self, handle: &TransferHandle);

    /// Abort the transfer and ask for a checkpoint. The checkpoint (or its
    /// absence) is delivered later as `ResumeDataReady`.
    fn abort_for_resumption(&self, handle: &TransferHandle);
}

/// Per-worker control state held while its transfer is in flight.
struct WorkerControl {
    cancel: CancellationToken,
    keep_partial: Arc<AtomicBool>,
}

/// HTTP transport streaming each transfer to a `.part` file.
///
/// Resumption uses `Range` requests: the checkpoint records how many bytes
/// the part file already holds and the restarted request appends from there.
pub struct HttpTransport {
    client: Client,
    part_dir: PathBuf,
    events: mpsc::UnboundedSender<TransportEvent>,
    next_id: AtomicU64,
    workers: Arc<Mutex<HashMap<u64, WorkerControl>>>,
}

impl HttpTransport {
    /// Creates the transport and the receiving end of its event stream.
    pub fn new(part_dir: PathBuf) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            client: Client::new(),
            part_dir,
            events,
            next_id: AtomicU64::new(1),
            workers: Arc::new(Mutex::new(HashMap::new())),
        });
        (transport, rx)
    }

    fn spawn_worker(&self, id: u64, url: String, part_path: PathBuf, start_offset: u64) -> TransferHandle {
        let cancel = CancellationToken::new();
        let keep_partial = Arc::new(AtomicBool::new(false));

        self.workers.lock().unwrap().insert(
            id,
            WorkerControl {
                cancel: cancel.clone(),
                keep_partial: keep_partial.clone(),
            },
        );

        let client = self.client.clone();
        let events = self.events.clone();
        let workers = self.workers.clone();

        tokio::spawn(async move {
            debug!(id, url = %url, start_offset, "transfer worker starting");
            let outcome = run_transfer(&client, &url, &part_path, start_offset, id, &events, &cancel).await;

            match outcome {
                Ok(TransferOutcome::Completed) => {
                    let _ = events.send(TransportEvent::Completed {
                        id,
                        location: part_path,
                    });
                }
                Ok(TransferOutcome::Aborted {
                    bytes_written,
                    total_expected,
                }) => {
                    if keep_partial.load(Ordering::SeqCst) {
                        let data = if bytes_written > 0 {
                            Some(ResumeData {
                                url,
                                part_path,
                                bytes_written,
                                total_expected,
                            })
                        } else {
                            let _ = tokio::fs::remove_file(&part_path).await;
                            None
                        };
                        let _ = events.send(TransportEvent::ResumeDataReady { id, data });
                    } else {
                        let _ = tokio::fs::remove_file(&part_path).await;
                    }
                }
                Err(error) => {
                    warn!(id, url = %url, %error, "transfer failed");
                    let _ = tokio::fs::remove_file(&part_path).await;
                    let _ = events.send(TransportEvent::Failed { id, error });
                }
            }

            workers.lock().unwrap().remove(&id);
        });

        TransferHandle(id)
    }
}

impl Transport for HttpTransport {
    fn start(&self, url: &str) -> TransferHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let part_path = self.part_dir.join(format!("{id}.part"));
        self.spawn_worker(id, url.to_string(), part_path, 0)
    }

    fn start_resumed(&self, data: ResumeData) -> TransferHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.spawn_worker(id, data.url, data.part_path, data.bytes_written)
    }

    fn abort(&self, handle: &TransferHandle) {
        if let Some(control) = self.workers.lock().unwrap().get(&handle.id()) {
            control.cancel.cancel();
        }
    }

    fn abort_for_resumption(&self, handle: &TransferHandle) {
        if let Some(control) = self.workers.lock().unwrap().get(&handle.id()) {
            control.keep_partial.store(true, Ordering::SeqCst);
            control.cancel.cancel();
        }
    }
}

enum TransferOutcome {
    Completed,
    Aborted {
        bytes_written: u64,
        total_expected: Option<u64>,
    },
}

async fn run_transfer(
    client: &Client,
    url: &str,
    part_path: &Path,
    start_offset: u64,
    id: u64,
    events: &mpsc::UnboundedSender<TransportEvent>,
    cancel: &CancellationToken,
) -> Result<TransferOutcome, TransportError> {
    if let Some(parent) = part_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // A checkpoint is only honored when the part file still matches it.
    let on_disk = match tokio::fs::metadata(part_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    let mut offset = if start_offset > 0 && on_disk == start_offset {
        start_offset
    } else {
        0
    };

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    }
    let response = request.send().await?.error_for_status()?;

    // Servers that ignore the range reply 200 with the whole body.
    if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
        debug!(id, url, "server ignored range request, restarting from scratch");
        offset = 0;
    }

    let total_expected = response.content_length().map(|len| len + offset);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(part_path)
        .await?;
    file.set_len(offset).await?;
    if offset > 0 {
        use tokio::io::{AsyncSeekExt, SeekFrom};
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let mut stream = response.bytes_stream();
    let mut total_written = offset;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                file.flush().await?;
                return Ok(TransferOutcome::Aborted {
                    bytes_written: total_written,
                    total_expected,
                });
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let bytes = chunk?;
        file.write_all(&bytes).await?;
        total_written += bytes.len() as u64;
        let _ = events.send(TransportEvent::Progress {
            id,
            bytes_written: bytes.len() as u64,
            total_written,
            total_expected,
        });
    }
    file.flush().await?;

    // A completion without a readable artifact is a failure, not a panic.
    match tokio::fs::metadata(part_path).await {
        Ok(meta) if meta.len() == total_written => Ok(TransferOutcome::Completed),
        _ => Err(TransportError::ArtifactUnreadable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_data_survives_the_opaque_blob_form() {
        let data = ResumeData {
            url: "https://example.com/a.mp3".to_string(),
            part_path: PathBuf::from("/tmp/parts/1.part"),
            bytes_written: 4096,
            total_expected: Some(10_000),
        };

        let restored = ResumeData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(restored.url, data.url);
        assert_eq!(restored.part_path, data.part_path);
        assert_eq!(restored.bytes_written, data.bytes_written);
        assert_eq!(restored.total_expected, data.total_expected);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(ResumeData::from_bytes(b"not a checkpoint").is_err());
    }

    #[tokio::test]
    async fn unreachable_server_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut events) = HttpTransport::new(dir.path().to_path_buf());

        // Port 9 (discard) has no listener; the connection is refused.
        let handle = transport.start("http://127.0.0.1:9/missing.bin");

        loop {
            match events.recv().await {
                Some(TransportEvent::Failed { id, .. }) => {
                    assert_eq!(id, handle.id());
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed without a failure"),
            }
        }
    }
}
