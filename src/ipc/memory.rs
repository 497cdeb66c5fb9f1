use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};
use crate::ipc::{link_pair, CoordinatorLink, Transport, WorkerLink, LINK_BUFFER};

/// Worker-side handle for an in-process coordinator.
#[derive(Clone)]
pub struct MemoryTransport {
    accept_tx: mpsc::Sender<CoordinatorLink>,
}

/// Coordinator-side queue of incoming in-process connections.
pub struct MemoryListener {
    accept_rx: mpsc::Receiver<CoordinatorLink>,
}

pub fn memory_channel() -> (MemoryTransport, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::channel(16);
    (MemoryTransport { accept_tx }, MemoryListener { accept_rx })
}

impl MemoryListener {
    /// Next connection, or `None` once every transport handle is dropped.
    pub async fn accept(&mut self) -> Option<CoordinatorLink> {
        self.accept_rx.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<WorkerLink> {
        let (worker, coordinator) = link_pair(LINK_BUFFER);
        self.accept_tx
            .send(coordinator)
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;
        Ok(worker)
    }
}
