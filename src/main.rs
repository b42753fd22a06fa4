use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use trackdl::prelude::*;

const URLS: &[(&str, &str)] = &[
    ("https://proof.ovh.net/files/10Mb.dat", "first.dat"),
    ("https://proof.ovh.net/files/10Mb.dat?copy=2", "second.dat"),
    ("https://proof.ovh.net/files/10Mb.dat?copy=3", "third.dat"),
];

struct ProgressPrinter;

impl DownloadObserver for ProgressPrinter {
    fn on_state_changed(&self, task: &DownloadTask) {
        println!("[state] {} -> {:?}", task.url, task.state);
    }

    fn on_progress(
        &self,
        task: &DownloadTask,
        _bytes_written: u64,
        total_written: u64,
        total_expected: Option<u64>,
    ) {
        if let Some(total) = total_expected {
            if total > 0 && total_written % (total / 4).max(1) < 16 * 1024 {
                println!(
                    "[progress] {} {:.0}%",
                    task.url,
                    total_written as f64 / total as f64 * 100.0
                );
            }
        }
    }

    fn on_failed(&self, task: &DownloadTask, error: &TransportError) {
        println!("[failed] {}: {}", task.url, error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("trackdl=debug")
        .init();

    let part_dir = PathBuf::from("parts");
    let out_dir = PathBuf::from("downloads");
    tokio::fs::create_dir_all(&out_dir).await?;

    let (transport, events) = HttpTransport::new(part_dir);
    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel::<CompletedDownload<String>>();
    let coordinator = Arc::new(DownloadCoordinator::new(transport, 2, completed_tx));
    coordinator.spawn_event_pump(events);
    coordinator.register_observer(Arc::new(ProgressPrinter));

    for (url, name) in URLS {
        coordinator.request_download(*url, name.to_string()).await?;
    }

    // Exercise the pause/resume path on the first task.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let first = URLS[0].0;
    coordinator.pause(first).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    coordinator.resume(first).await;

    // The persistence side: move each finished artifact into place.
    let mut remaining = URLS.len();
    while remaining > 0 {
        let Some(done) = completed_rx.recv().await else {
            break;
        };
        let destination = out_dir.join(&done.payload);
        move_artifact(&done.location, &destination).await?;
        println!("[saved] {}", destination.display());
        remaining -= 1;
    }

    Ok(())
}

async fn move_artifact(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}
