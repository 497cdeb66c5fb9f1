use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::ipc::{
    CapabilityOffer, ClaimOrder, ClaimToken, CoordinatorMessage, StageReport, Transport,
    WorkerLink, WorkerMessage,
};
use crate::worker::executor::{ClaimReporter, StageExecutor};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::planner::CommandPlanner;

/// Claim tokens remembered for duplicate detection.
const MAX_REMEMBERED_CLAIMS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Disconnected,
}

#[derive(Debug)]
enum ClaimProgress {
    Running(CancellationToken),
    Finished,
}

/// Claims this worker has accepted, so a re-delivered claim is
/// acknowledged without running the stage twice.
#[derive(Debug, Default)]
struct ClaimMemory {
    entries: HashMap<ClaimToken, ClaimProgress>,
    order: VecDeque<ClaimToken>,
}

impl ClaimMemory {
    fn contains(&self, token: &ClaimToken) -> bool {
        self.entries.contains_key(token)
    }

    fn start(&mut self, token: ClaimToken, cancel: CancellationToken) {
        self.entries.insert(token, ClaimProgress::Running(cancel));
        self.order.push_back(token);

        let mut skipped = 0;
        while self.order.len() > MAX_REMEMBERED_CLAIMS && skipped < self.order.len() {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if matches!(self.entries.get(&oldest), Some(ClaimProgress::Running(_))) {
                self.order.push_back(oldest);
                skipped += 1;
            } else {
                self.entries.remove(&oldest);
            }
        }
    }

    fn finish(&mut self, token: &ClaimToken) {
        if let Some(progress) = self.entries.get_mut(token) {
            *progress = ClaimProgress::Finished;
        }
    }

    fn cancel(&self, token: &ClaimToken) -> bool {
        match self.entries.get(token) {
            Some(ClaimProgress::Running(cancel)) => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Executes claimed stages, bounded per capability by the configured
/// slot counts.
pub struct WorkerPool {
    config: Arc<WorkerConfig>,
    planner: Arc<dyn CommandPlanner>,
    slots: HashMap<String, Arc<Semaphore>>,
    claims: Arc<Mutex<ClaimMemory>>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, planner: Arc<dyn CommandPlanner>) -> Self {
        let slots = config
            .capabilities
            .iter()
            .map(|(name, slots)| (name.clone(), Arc::new(Semaphore::new(*slots as usize))))
            .collect();
        Self {
            config: Arc::new(config),
            planner,
            slots,
            claims: Arc::new(Mutex::new(ClaimMemory::default())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Stay connected until shutdown, reconnecting after every lost session.
    pub async fn run(&self, transport: &dyn Transport, shutdown: CancellationToken) -> Result<()> {
        let reconnect_delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match transport.connect().await {
                Ok(link) => match self.serve(link, &shutdown).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::Disconnected => {
                        tracing::warn!(worker_id = %self.worker_id(), "Lost coordinator connection");
                    }
                },
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id(), error = %e, "Failed to connect to coordinator");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }
    }

    /// One connected session: register, then take claims until the link
    /// drops or shutdown is requested. On shutdown, running stages finish
    /// and report before the worker says goodbye.
    pub async fn serve(&self, mut link: WorkerLink, shutdown: &CancellationToken) -> SessionEnd {
        let outbound = link.sender();
        let register = WorkerMessage::Register {
            worker_id: self.config.worker_id.clone(),
            capabilities: self
                .config
                .capabilities
                .iter()
                .map(|(name, slots)| CapabilityOffer {
                    name: name.clone(),
                    slots: *slots,
                })
                .collect(),
        };
        if link.send(register).await.is_err() {
            return SessionEnd::Disconnected;
        }

        let session = CancellationToken::new();
        let mut heartbeat: Option<JoinHandle<()>> = None;
        let mut running = JoinSet::new();

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                message = link.recv() => match message {
                    Some(CoordinatorMessage::Registered { worker_id, heartbeat_interval_ms }) => {
                        tracing::info!(worker_id = %worker_id, heartbeat_interval_ms, "Registered with coordinator");
                        if heartbeat.is_none() {
                            let interval = heartbeat_interval_ms.min(self.config.heartbeat_interval_ms);
                            heartbeat = Some(self.spawn_heartbeat(outbound.clone(), interval, session.clone()));
                        }
                    }
                    Some(CoordinatorMessage::Claim(order)) => {
                        self.accept(order, &outbound, &session, &mut running).await;
                    }
                    Some(CoordinatorMessage::Cancel { claim }) => self.cancel(claim).await,
                    None => break SessionEnd::Disconnected,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Stage task failed");
                    }
                }
            }
        };

        match end {
            SessionEnd::Shutdown => {
                tracing::info!(worker_id = %self.worker_id(), in_flight = running.len(), "Draining before shutdown");
                while !running.is_empty() {
                    tokio::select! {
                        _ = running.join_next() => {}
                        message = link.recv() => match message {
                            Some(CoordinatorMessage::Claim(order)) => {
                                reject(&outbound, order.claim, "worker is shutting down").await;
                            }
                            Some(CoordinatorMessage::Cancel { claim }) => self.cancel(claim).await,
                            Some(CoordinatorMessage::Registered { .. }) => {}
                            None => {
                                session.cancel();
                                while running.join_next().await.is_some() {}
                            }
                        }
                    }
                }
                let _ = link
                    .send(WorkerMessage::Disconnect {
                        worker_id: self.config.worker_id.clone(),
                    })
                    .await;
            }
            SessionEnd::Disconnected => {
                session.cancel();
                while running.join_next().await.is_some() {}
            }
        }

        session.cancel();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }
        end
    }

    fn spawn_heartbeat(
        &self,
        tx: mpsc::Sender<WorkerMessage>,
        interval_ms: u64,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let worker_id = self.config.worker_id.clone();
        tokio::spawn(async move {
            HeartbeatSender::new(interval_ms)
                .run(tx, worker_id, stop)
                .await
        })
    }

    async fn accept(
        &self,
        order: ClaimOrder,
        outbound: &mpsc::Sender<WorkerMessage>,
        session: &CancellationToken,
        running: &mut JoinSet<()>,
    ) {
        let token = order.claim;
        let mut memory = self.claims.lock().await;
        if memory.contains(&token) {
            tracing::debug!(claim = %token, "Duplicate claim, acknowledging again");
            let _ = outbound.send(WorkerMessage::ClaimAck { claim: token }).await;
            return;
        }

        let capability = order.stage.required_capability();
        let Some(semaphore) = self.slots.get(capability) else {
            reject(outbound, token, &format!("capability {} not offered", capability)).await;
            return;
        };
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            reject(outbound, token, &format!("no free {} slot", capability)).await;
            return;
        };

        let cancel = session.child_token();
        memory.start(token, cancel.clone());
        drop(memory);

        if outbound
            .send(WorkerMessage::ClaimAck { claim: token })
            .await
            .is_err()
        {
            return;
        }
        tracing::info!(
            claim = %token,
            job_id = %order.job_id,
            stage = %order.stage,
            "Accepted claim"
        );

        let executor = StageExecutor::new(Duration::from_millis(self.config.log_flush_interval_ms))
            .with_timeout(self.config.stage_timeout(order.stage.as_str()))
            .with_make_conf_vars(self.config.toolchain.make_conf_vars.clone());
        let planner = self.planner.clone();
        let claims = self.claims.clone();
        let outbound = outbound.clone();
        let worker_id = self.config.worker_id.clone();

        running.spawn(async move {
            let report = run_claim(&worker_id, order, planner.as_ref(), &executor, &outbound, &cancel).await;
            claims.lock().await.finish(&token);
            // The slot must be free before the coordinator hears the result.
            drop(permit);
            if let Some(report) = report {
                let _ = outbound.send(WorkerMessage::StageResult(report)).await;
            }
        });
    }

    async fn cancel(&self, token: ClaimToken) {
        if self.claims.lock().await.cancel(&token) {
            tracing::info!(claim = %token, "Claim withdrawn by coordinator");
        }
    }
}

/// Plan and execute one claimed stage. `None` means the claim was
/// cancelled and must not be reported.
async fn run_claim(
    worker_id: &str,
    order: ClaimOrder,
    planner: &dyn CommandPlanner,
    executor: &StageExecutor,
    outbound: &mpsc::Sender<WorkerMessage>,
    cancel: &CancellationToken,
) -> Option<StageReport> {
    let reporter = ClaimReporter::new(outbound.clone(), order.claim, order.job_id.clone());
    reporter
        .event(&format!("worker {} starting {}", worker_id, order.stage))
        .await;

    let report = |success: bool, exit_code: Option<i32>, timed_out: bool| StageReport {
        claim: order.claim,
        job_id: order.job_id.clone(),
        stage: order.stage,
        success,
        exit_code,
        timed_out,
    };

    let steps = match planner.plan(&order) {
        Ok(steps) => steps,
        Err(e) => {
            reporter
                .event(&format!("cannot run {}: {}", order.stage, e))
                .await;
            return Some(report(false, None, false));
        }
    };

    let outcome = executor.run(&steps, &order.file_root, &reporter, cancel).await;
    if outcome.cancelled {
        tracing::info!(claim = %order.claim, job_id = %order.job_id, "Stage cancelled");
        return None;
    }
    tracing::info!(
        claim = %order.claim,
        job_id = %order.job_id,
        stage = %order.stage,
        success = outcome.success,
        exit_code = ?outcome.exit_code,
        timed_out = outcome.timed_out,
        "Stage finished"
    );
    Some(report(outcome.success, outcome.exit_code, outcome.timed_out))
}

async fn reject(outbound: &mpsc::Sender<WorkerMessage>, claim: ClaimToken, reason: &str) {
    tracing::warn!(claim = %claim, reason, "Rejecting claim");
    let _ = outbound
        .send(WorkerMessage::ClaimReject {
            claim,
            reason: reason.to_string(),
        })
        .await;
}
