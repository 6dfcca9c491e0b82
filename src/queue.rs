//! Fan-out queue delivering accepted publications and lifecycle events to
//! the in-process subscriber.

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{Publication, Update};

/// Create a connected writer/reader pair
pub fn updates_queue() -> (UpdatesWriter, UpdatesReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UpdatesWriter { tx: Some(tx) }, UpdatesReader { rx })
}

/// Writer half, owned by the run loop. Multi-producer in principle but the
/// loop is the only pusher; closing drops the sender so a blocked reader
/// observes the end of the queue.
pub struct UpdatesWriter {
    tx: Option<mpsc::UnboundedSender<Update>>,
}

impl UpdatesWriter {
    /// Push an update; silently dropped once the queue is closed
    pub fn push(&self, update: Update) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(update);
        } else {
            debug!("Dropping update pushed after queue close");
        }
    }

    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Reader half. A single consumer is assumed; delivery is FIFO and
/// lossless while the queue is open.
pub struct UpdatesReader {
    rx: mpsc::UnboundedReceiver<Update>,
}

impl UpdatesReader {
    /// Block until the next publication arrives. Other update variants
    /// read while waiting are discarded.
    pub async fn recv_publication(&mut self) -> Result<Publication> {
        loop {
            match self.rx.recv().await {
                Some(Update::Publication(publication)) => return Ok(publication),
                Some(Update::Synced) => continue,
                None => bail!("updates queue closed"),
            }
        }
    }

    /// Block until the one-shot synced marker arrives. Publications read
    /// while waiting are discarded.
    pub async fn recv_synced(&mut self) -> Result<()> {
        loop {
            match self.rx.recv().await {
                Some(Update::Synced) => return Ok(()),
                Some(Update::Publication(_)) => continue,
                None => bail!("updates queue closed"),
            }
        }
    }
}
