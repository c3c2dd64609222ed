use anyhow::{bail, Result};
use distbuild_base::proto::{BuildStarted, StatusUpdate};
use distbuild_util::net::JsonLineSender;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, Mutex};

/// A single-connection HTTP streaming-JSON writer for one build's `/build` response. `started`
/// must be called exactly once before any `updated`; the first `updated` carrying
/// `build_finished` closes the writer's "done" signal, which is what unblocks the HTTP handler.
pub struct StatusWriter {
    sender: Mutex<JsonLineSender>,
    started: AtomicBool,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl StatusWriter {
    pub fn new(sender: JsonLineSender) -> (Self, oneshot::Receiver<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(sender),
                started: AtomicBool::new(false),
                done_tx: Mutex::new(Some(done_tx)),
            },
            done_rx,
        )
    }

    pub async fn started(&self, msg: &BuildStarted) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("StatusWriter::started called more than once");
        }
        self.sender.lock().await.send(msg).await
    }

    pub async fn updated(&self, update: &StatusUpdate) -> Result<()> {
        self.sender.lock().await.send(update).await?;
        if update.build_finished.is_some() {
            if let Some(tx) = self.done_tx.lock().await.take() {
                let _ = tx.send(());
            }
        }
        Ok(())
    }
}
