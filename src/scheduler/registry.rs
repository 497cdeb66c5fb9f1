use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};
use crate::ipc::{CapabilityOffer, CoordinatorMessage};

/// A connected worker as the scheduler sees it.
#[derive(Debug)]
pub struct WorkerRegistration {
    pub worker_id: String,
    /// Distinguishes this connection from earlier ones by the same worker.
    pub connection: u64,
    /// Capability label -> concurrent stages the worker said it accepts.
    pub capabilities: BTreeMap<String, u32>,
    pub last_heartbeat: Instant,
    outbound: mpsc::Sender<CoordinatorMessage>,
}

impl WorkerRegistration {
    pub fn new(
        worker_id: String,
        connection: u64,
        offers: Vec<CapabilityOffer>,
        outbound: mpsc::Sender<CoordinatorMessage>,
    ) -> Self {
        let capabilities = offers
            .into_iter()
            .filter(|offer| offer.slots > 0)
            .map(|offer| (offer.name, offer.slots))
            .collect();
        Self {
            worker_id,
            connection,
            capabilities,
            last_heartbeat: Instant::now(),
            outbound,
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }

    pub fn slots(&self, capability: &str) -> u32 {
        self.capabilities.get(capability).copied().unwrap_or(0)
    }

    /// Queue a message without waiting; a full or closed queue is an error.
    pub fn send(&self, message: CoordinatorMessage) -> Result<()> {
        self.outbound
            .try_send(message)
            .map_err(|_| PipelineError::ChannelClosed)
    }
}

/// Registered workers keyed by id.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerRegistration>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Insert a registration, returning the one it replaced.
    pub fn register(&mut self, registration: WorkerRegistration) -> Option<WorkerRegistration> {
        tracing::info!(
            worker_id = %registration.worker_id,
            connection = registration.connection,
            capabilities = ?registration.capabilities,
            "Worker registered"
        );
        self.workers
            .insert(registration.worker_id.clone(), registration)
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerRegistration> {
        self.workers.get(worker_id)
    }

    /// True when `connection` is the worker's live connection.
    pub fn is_current(&self, worker_id: &str, connection: u64) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|w| w.connection == connection)
    }

    pub fn heartbeat(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.update_heartbeat();
        }
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<WorkerRegistration> {
        self.workers.remove(worker_id)
    }

    /// Live workers advertising `capability`, sorted by id.
    pub fn capable_workers(&self, capability: &str) -> Vec<&WorkerRegistration> {
        let mut workers: Vec<_> = self
            .workers
            .values()
            .filter(|w| w.is_alive(self.heartbeat_timeout) && w.slots(capability) > 0)
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    /// Workers whose heartbeat is older than the timeout.
    pub fn dead_workers(&self) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| !w.is_alive(self.heartbeat_timeout))
            .map(|w| w.worker_id.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<&WorkerRegistration> {
        let mut workers: Vec<_> = self.workers.values().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
