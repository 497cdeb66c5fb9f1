//! Coordinator/worker channel.
//!
//! A connection is a pair of bounded queues, one per direction, wrapped in a
//! [`Link`]. The receiving half yielding `None` is the disconnect signal for
//! both sides. Transports only differ in how a worker obtains its end:
//!
//! - [`memory::MemoryTransport`] hands links to an in-process coordinator
//! - [`crate::grpc::GrpcTransport`] bridges a link onto a tonic bidi stream

pub mod memory;
pub mod message;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

pub use memory::{memory_channel, MemoryListener, MemoryTransport};
pub use message::{
    CapabilityOffer, ClaimOrder, ClaimToken, CoordinatorMessage, StageReport, WorkerMessage,
};

/// Queue depth for each direction of a link.
pub const LINK_BUFFER: usize = 256;

pub struct Link<Out, In> {
    tx: mpsc::Sender<Out>,
    rx: mpsc::Receiver<In>,
}

/// The worker's end of a connection.
pub type WorkerLink = Link<WorkerMessage, CoordinatorMessage>;
/// The coordinator's end of one worker connection.
pub type CoordinatorLink = Link<CoordinatorMessage, WorkerMessage>;

impl<Out, In> Link<Out, In> {
    pub fn new(tx: mpsc::Sender<Out>, rx: mpsc::Receiver<In>) -> Self {
        Self { tx, rx }
    }

    pub async fn send(&self, msg: Out) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PipelineError::ChannelClosed)
    }

    /// `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<In> {
        self.rx.recv().await
    }

    pub fn sender(&self) -> mpsc::Sender<Out> {
        self.tx.clone()
    }

    pub fn into_parts(self) -> (mpsc::Sender<Out>, mpsc::Receiver<In>) {
        (self.tx, self.rx)
    }
}

/// Two connected ends.
pub fn link_pair(buffer: usize) -> (WorkerLink, CoordinatorLink) {
    let (to_coordinator, from_worker) = mpsc::channel(buffer);
    let (to_worker, from_coordinator) = mpsc::channel(buffer);
    (
        Link::new(to_coordinator, from_coordinator),
        Link::new(to_worker, from_worker),
    )
}

/// How a worker reaches its coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<WorkerLink>;
}
