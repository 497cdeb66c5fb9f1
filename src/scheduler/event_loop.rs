use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{FailureKind, PipelineError, Result};
use crate::ipc::{
    CapabilityOffer, ClaimOrder, ClaimToken, CoordinatorMessage, StageReport, WorkerMessage,
};
use crate::pipeline::{JobOptions, Stage, StageDefinition, Toolchain};
use crate::scheduler::claims::{Claim, ClaimTable, DeliveryRetries};
use crate::scheduler::registry::{WorkerRegistration, WorkerRegistry};
use crate::scheduler::{CapabilitySummary, SchedulerEvent, SchedulerHandle, WorkerSummary};
use crate::store::{JobId, JobState, JobStore, NewJob, StagedDir};

const EVENT_BUFFER: usize = 1024;

pub struct Scheduler {
    config: Arc<CoordinatorConfig>,
    store: Arc<RwLock<JobStore>>,
    registry: WorkerRegistry,
    claims: ClaimTable,
    retries: DeliveryRetries,
    events: mpsc::Receiver<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(config: Arc<CoordinatorConfig>, store: JobStore) -> (Self, SchedulerHandle) {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let store = Arc::new(RwLock::new(store));
        let scheduler = Self {
            registry: WorkerRegistry::new(config.heartbeat_timeout()),
            claims: ClaimTable::new(),
            retries: DeliveryRetries::new(),
            config,
            store: store.clone(),
            events,
        };
        (scheduler, SchedulerHandle::new(events_tx, store))
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.recover_interrupted().await;
        self.dispatch().await;

        let mut tick = tokio::time::interval(self.config.scheduler_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let changed = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tick.tick() => {
                    self.sweep().await;
                    true
                }
            };
            if changed {
                self.dispatch().await;
            }
        }
    }

    /// A job recorded as running has no live claim after a restart; it
    /// cannot be resumed, so it is failed at the stage it was in.
    async fn recover_interrupted(&mut self) {
        let store_lock = self.store.clone();
        let mut store = store_lock.write().await;
        let interrupted: Vec<(JobId, Stage)> = store
            .list()
            .into_iter()
            .filter_map(|job| match job.state {
                JobState::Running(stage) => Some((job.id.clone(), stage)),
                _ => None,
            })
            .collect();
        for (job_id, stage) in interrupted {
            tracing::warn!(job_id = %job_id, stage = %stage, "Stage interrupted by coordinator restart");
            fail_job(
                &mut store,
                &job_id,
                stage,
                FailureKind::WorkerLost,
                "coordinator restarted while the stage was in flight",
            );
        }
    }

    /// Returns whether the event could have changed what is dispatchable.
    async fn handle_event(&mut self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::Submit {
                name,
                toolchain,
                config,
                from_archive,
                files,
                response_tx,
            } => {
                let created = self.submit(name, toolchain, config, from_archive, &files).await;
                if created.is_err() {
                    discard_in_background(files);
                }
                let _ = response_tx.send(created);
                true
            }
            SchedulerEvent::SetState {
                job_id,
                state,
                response_tx,
            } => {
                let _ = response_tx.send(self.admin_set_state(&job_id, state).await);
                true
            }
            SchedulerEvent::SetConfigField {
                job_id,
                key,
                value,
                response_tx,
            } => {
                let _ = response_tx.send(self.set_config_field(&job_id, &key, &value).await);
                false
            }
            SchedulerEvent::Delete {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.delete_job(&job_id).await);
                true
            }
            SchedulerEvent::ListWorkers { response_tx } => {
                let _ = response_tx.send(self.worker_summaries());
                false
            }
            SchedulerEvent::WorkerRegistered {
                connection,
                worker_id,
                capabilities,
                outbound,
            } => {
                self.worker_registered(connection, worker_id, capabilities, outbound)
                    .await;
                true
            }
            SchedulerEvent::FromWorker {
                connection,
                worker_id,
                message,
            } => {
                if !self.registry.is_current(&worker_id, connection) {
                    tracing::debug!(worker_id = %worker_id, connection, "Message from stale connection dropped");
                    return false;
                }
                self.worker_message(&worker_id, message).await
            }
            SchedulerEvent::WorkerDisconnected {
                connection,
                worker_id,
            } => {
                if !self.registry.is_current(&worker_id, connection) {
                    return false;
                }
                let store_lock = self.store.clone();
                let mut store = store_lock.write().await;
                self.worker_lost(&mut store, &worker_id, "disconnected");
                true
            }
        }
    }

    async fn submit(
        &mut self,
        name: String,
        toolchain: Toolchain,
        mut config: BTreeMap<String, String>,
        from_archive: bool,
        files: &StagedDir,
    ) -> Result<JobId> {
        let options = JobOptions::parse(toolchain, &config, self.config.default_f1_mode)?;
        options.apply_defaults(&mut config);
        let stages = toolchain.pipeline().effective_stages(&options, from_archive);
        let plan = stages
            .iter()
            .map(Stage::as_str)
            .collect::<Vec<_>>()
            .join(" -> ");

        let mut store = self.store.write().await;
        let job_id = store.create(
            NewJob {
                name,
                toolchain,
                config,
                stages,
            },
            files,
        )?;
        record(
            &mut store,
            &job_id,
            &format!("submitted for {} with stages {}", toolchain, plan),
        );
        tracing::info!(job_id = %job_id, toolchain = %toolchain, stages = %plan, "Job submitted");
        Ok(job_id)
    }

    async fn admin_set_state(&mut self, job_id: &JobId, requested: JobState) -> Result<JobState> {
        let store_lock = self.store.clone();
        let mut store = store_lock.write().await;
        let job = store.get(job_id)?;

        let (index, state) = match requested {
            JobState::Queued => {
                let index = if job.current_stage_index >= job.stages.len() {
                    0
                } else {
                    job.current_stage_index
                };
                (index, JobState::Queued)
            }
            JobState::Running(stage) => {
                let index = job.stages.iter().position(|s| *s == stage).ok_or_else(|| {
                    PipelineError::InvalidState(format!(
                        "stage {} is not part of job {}'s pipeline",
                        stage, job_id
                    ))
                })?;
                (index, JobState::Queued)
            }
            JobState::Done | JobState::Failed(_) => (job.current_stage_index, requested),
        };
        if state == JobState::Queued && job.stages.is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "job {} has no stages to run",
                job_id
            )));
        }

        self.withdraw_claim(job_id);
        self.retries.clear(job_id);
        store.update(job_id, |job| {
            job.current_stage_index = index;
            job.state = state;
            job.failure = None;
        })?;
        record(
            &mut store,
            job_id,
            &format!("state changed to {} by operator", state),
        );
        tracing::info!(job_id = %job_id, state = %state, "Job state overridden");
        Ok(state)
    }

    /// Renames go through as given. Any other edit must leave a config the
    /// job's toolchain still accepts, or workers could not plan its stages.
    async fn set_config_field(&mut self, job_id: &JobId, key: &str, value: &str) -> Result<()> {
        let mut store = self.store.write().await;
        if key != "name" {
            let job = store.get(job_id)?;
            let mut edited = job.config.clone();
            edited.insert(key.to_string(), value.to_string());
            JobOptions::parse(job.toolchain, &edited, self.config.default_f1_mode)?;
        }
        store.set_config_field(job_id, key, value)?;
        let event = if key == "name" {
            format!("renamed to {}", value)
        } else {
            format!("config {} set to {}", key, value)
        };
        record(&mut store, job_id, &event);
        Ok(())
    }

    async fn delete_job(&mut self, job_id: &JobId) -> Result<()> {
        let store_lock = self.store.clone();
        let mut store = store_lock.write().await;
        store.get(job_id)?;
        self.withdraw_claim(job_id);
        self.retries.clear(job_id);
        let trash = store.delete(job_id)?;
        discard_in_background(trash);
        tracing::info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    /// Drop the job's claim, if any, and tell the worker to stop.
    fn withdraw_claim(&mut self, job_id: &JobId) {
        if let Some(claim) = self.claims.remove_for_job(job_id) {
            tracing::info!(job_id = %job_id, claim = %claim.token, worker_id = %claim.worker_id, "Claim withdrawn");
            self.notify(&claim.worker_id, CoordinatorMessage::Cancel { claim: claim.token });
        }
    }

    fn notify(&self, worker_id: &str, message: CoordinatorMessage) {
        if let Some(worker) = self.registry.get(worker_id) {
            if worker.send(message).is_err() {
                tracing::debug!(worker_id, "Worker queue unavailable for notification");
            }
        }
    }

    fn worker_summaries(&self) -> Vec<WorkerSummary> {
        self.registry
            .all()
            .into_iter()
            .map(|worker| WorkerSummary {
                worker_id: worker.worker_id.clone(),
                capabilities: worker
                    .capabilities
                    .iter()
                    .map(|(name, slots)| CapabilitySummary {
                        name: name.clone(),
                        slots: *slots,
                        active: self.claims.active_on(&worker.worker_id, name),
                    })
                    .collect(),
                last_heartbeat_age: worker.last_heartbeat.elapsed(),
            })
            .collect()
    }

    async fn worker_registered(
        &mut self,
        connection: u64,
        worker_id: String,
        capabilities: Vec<CapabilityOffer>,
        outbound: mpsc::Sender<CoordinatorMessage>,
    ) {
        if self.registry.get(&worker_id).is_some() {
            let store_lock = self.store.clone();
            let mut store = store_lock.write().await;
            self.worker_lost(&mut store, &worker_id, "re-registered on a new connection");
        }

        let registration =
            WorkerRegistration::new(worker_id.clone(), connection, capabilities, outbound);
        let ack = CoordinatorMessage::Registered {
            worker_id: worker_id.clone(),
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
        };
        if registration.send(ack).is_err() {
            tracing::warn!(worker_id = %worker_id, "Worker went away during registration");
            return;
        }
        self.registry.register(registration);
    }

    /// Returns whether the message could have freed capacity or queued work.
    async fn worker_message(&mut self, worker_id: &str, message: WorkerMessage) -> bool {
        let store_lock = self.store.clone();
        match message {
            WorkerMessage::Heartbeat { .. } => {
                self.registry.heartbeat(worker_id);
                false
            }
            WorkerMessage::ClaimAck { claim } => {
                let Some(held) = self.claims.get(&claim).filter(|c| c.worker_id == worker_id)
                else {
                    tracing::debug!(worker_id, claim = %claim, "Ack for unknown claim ignored");
                    return false;
                };
                if held.acked {
                    return false;
                }
                let (job_id, stage) = (held.job_id.clone(), held.stage);
                self.claims.ack(&claim);
                let mut store = store_lock.write().await;
                record(
                    &mut store,
                    &job_id,
                    &format!("acquired in state running:{} by worker {}", stage, worker_id),
                );
                false
            }
            WorkerMessage::ClaimReject { claim, reason } => {
                if !self.claims.get(&claim).is_some_and(|c| c.worker_id == worker_id) {
                    return false;
                }
                let mut store = store_lock.write().await;
                self.delivery_failed(
                    &mut store,
                    claim,
                    &format!("rejected by worker {}: {}", worker_id, reason),
                    false,
                );
                true
            }
            WorkerMessage::LogAppend {
                claim,
                job_id,
                text,
            } => {
                if self.owns(&claim, &job_id, worker_id) {
                    let mut store = store_lock.write().await;
                    if let Err(e) = store.append_log(&job_id, &text) {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to append job log");
                    }
                }
                false
            }
            WorkerMessage::MakeConf {
                claim,
                job_id,
                values,
            } => {
                if self.owns(&claim, &job_id, worker_id) {
                    let mut store = store_lock.write().await;
                    if let Err(e) = store.update(&job_id, |job| job.make_conf.extend(values)) {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to record make configuration");
                    }
                }
                false
            }
            WorkerMessage::StageResult(report) => {
                let mut store = store_lock.write().await;
                self.stage_result(&mut store, worker_id, report)
            }
            WorkerMessage::Register { .. } => {
                tracing::warn!(worker_id, "Duplicate register on a live connection ignored");
                false
            }
            WorkerMessage::Disconnect { .. } => false,
        }
    }

    fn owns(&self, claim: &ClaimToken, job_id: &JobId, worker_id: &str) -> bool {
        self.claims
            .get(claim)
            .is_some_and(|c| &c.job_id == job_id && c.worker_id == worker_id)
    }

    fn stage_result(&mut self, store: &mut JobStore, worker_id: &str, report: StageReport) -> bool {
        let matches = self.claims.get(&report.claim).is_some_and(|c| {
            c.worker_id == worker_id && c.job_id == report.job_id && c.stage == report.stage
        });
        if !matches {
            tracing::debug!(
                worker_id,
                claim = %report.claim,
                job_id = %report.job_id,
                "Result for settled or unknown claim ignored"
            );
            return false;
        }
        let Some(claim) = self.claims.remove(&report.claim) else {
            return false;
        };
        self.retries.clear(&claim.job_id);

        let Ok(job) = store.get(&claim.job_id) else {
            return true;
        };
        if job.state != JobState::Running(claim.stage) || job.current_stage() != Some(claim.stage) {
            let detail = format!(
                "result for stage {} but record is {} at stage index {}",
                claim.stage, job.state, job.current_stage_index
            );
            tracing::error!(job_id = %claim.job_id, %detail, "Job record disagrees with claim");
            fail_job(store, &claim.job_id, claim.stage, FailureKind::CorruptState, &detail);
            return true;
        }

        if report.success {
            let next_index = job.current_stage_index + 1;
            let next_state = if next_index >= job.stages.len() {
                JobState::Done
            } else {
                JobState::Queued
            };
            let updated = store.update(&claim.job_id, |job| {
                job.current_stage_index = next_index;
                job.state = next_state;
                job.failure = None;
            });
            match updated {
                Ok(_) => {
                    record(
                        store,
                        &claim.job_id,
                        &format!("stage {} finished; state changed to {}", claim.stage, next_state),
                    );
                    tracing::info!(job_id = %claim.job_id, stage = %claim.stage, state = %next_state, "Stage completed");
                }
                Err(e) => {
                    tracing::error!(job_id = %claim.job_id, error = %e, "Failed to persist stage completion");
                }
            }
        } else {
            let kind = if report.timed_out {
                FailureKind::StageTimeout
            } else {
                FailureKind::StageExecution
            };
            let detail = match report.exit_code {
                Some(code) => format!("exit code {} on worker {}", code, worker_id),
                None => format!("no exit code on worker {}", worker_id),
            };
            fail_job(store, &claim.job_id, claim.stage, kind, &detail);
        }
        true
    }

    /// The claim never reached a worker that took it on. The job goes back
    /// to `queued` at the same stage behind a backoff, or fails once the
    /// retry policy is exhausted.
    fn delivery_failed(
        &mut self,
        store: &mut JobStore,
        token: ClaimToken,
        reason: &str,
        cancel_on_worker: bool,
    ) {
        let Some(claim) = self.claims.remove(&token) else {
            return;
        };
        if cancel_on_worker {
            self.notify(&claim.worker_id, CoordinatorMessage::Cancel { claim: token });
        }

        let policy = &self.config.claim_retry;
        let attempts =
            self.retries
                .record_failure(&claim.job_id, claim.stage, policy, Instant::now());
        tracing::warn!(
            job_id = %claim.job_id,
            stage = %claim.stage,
            worker_id = %claim.worker_id,
            attempts,
            reason,
            "Claim delivery failed"
        );

        if policy.exhausted(attempts) {
            self.retries.clear(&claim.job_id);
            fail_job(
                store,
                &claim.job_id,
                claim.stage,
                FailureKind::ClaimDelivery,
                &format!("{} (attempt {})", reason, attempts),
            );
            return;
        }

        match store.transition(&claim.job_id, JobState::Running(claim.stage), JobState::Queued) {
            Ok(()) => record(
                store,
                &claim.job_id,
                &format!(
                    "claim for {} not delivered ({}); state changed to queued, attempt {}",
                    claim.stage, reason, attempts
                ),
            ),
            Err(e) => {
                tracing::error!(job_id = %claim.job_id, error = %e, "Could not requeue after delivery failure");
            }
        }
    }

    fn worker_lost(&mut self, store: &mut JobStore, worker_id: &str, reason: &str) {
        if self.registry.remove(worker_id).is_none() {
            return;
        }
        tracing::warn!(worker_id, reason, "Worker lost");

        for token in self.claims.on_worker(worker_id) {
            let Some(claim) = self.claims.get(&token).cloned() else {
                continue;
            };
            if claim.acked {
                self.claims.remove(&token);
                self.retries.clear(&claim.job_id);
                fail_job(
                    store,
                    &claim.job_id,
                    claim.stage,
                    FailureKind::WorkerLost,
                    &format!("worker {} {}", worker_id, reason),
                );
            } else {
                self.delivery_failed(
                    store,
                    token,
                    &format!("worker {} {} before acknowledging", worker_id, reason),
                    false,
                );
            }
        }
    }

    /// Periodic liveness checks.
    async fn sweep(&mut self) {
        let dead = self.registry.dead_workers();
        let expired = self
            .claims
            .unacked_older_than(self.config.claim_ack_timeout(), Instant::now());
        if dead.is_empty() && expired.is_empty() {
            return;
        }

        let store_lock = self.store.clone();
        let mut store = store_lock.write().await;
        for worker_id in dead {
            self.worker_lost(&mut store, &worker_id, "missed heartbeats");
        }
        let reason = format!("no acknowledgement within {}ms", self.config.claim_ack_timeout_ms);
        for token in expired {
            self.delivery_failed(&mut store, token, &reason, true);
        }
    }

    /// Offer every ready stage that has capacity, oldest job first.
    async fn dispatch(&mut self) {
        let now = Instant::now();
        let store_lock = self.store.clone();
        let mut store = store_lock.write().await;

        let mut ready: Vec<_> = store
            .list()
            .into_iter()
            .filter_map(|job| {
                let stage = job.ready_stage()?;
                Some((job.started, job.seq, job.id.clone(), stage))
            })
            .filter(|(_, _, job_id, _)| {
                self.claims.for_job(job_id).is_none() && !self.retries.is_deferred(job_id, now)
            })
            .collect();
        ready.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, job_id, stage) in ready {
            let definition = StageDefinition::new(stage, &self.config);
            let capability = definition.required_capability;
            if self.claims.in_flight(capability) >= definition.parallelism_limit {
                continue;
            }
            let Some(worker_id) = self.pick_worker(capability) else {
                continue;
            };
            self.issue_claim(&mut store, job_id, stage, worker_id);
        }
    }

    /// Least-loaded live worker with a free slot for `capability`; ties go
    /// to the lowest worker id.
    fn pick_worker(&self, capability: &str) -> Option<String> {
        self.registry
            .capable_workers(capability)
            .into_iter()
            .filter(|w| self.claims.active_on(&w.worker_id, capability) < w.slots(capability))
            .min_by_key(|w| self.claims.load(&w.worker_id))
            .map(|w| w.worker_id.clone())
    }

    fn issue_claim(&mut self, store: &mut JobStore, job_id: JobId, stage: Stage, worker_id: String) {
        if let Err(e) = store.transition(&job_id, JobState::Queued, JobState::Running(stage)) {
            tracing::error!(job_id = %job_id, error = %e, "Refusing to claim job");
            return;
        }
        let Ok(job) = store.get(&job_id) else {
            return;
        };

        let token = ClaimToken::new();
        let order = ClaimOrder {
            claim: token,
            job_id: job_id.clone(),
            name: job.name.clone(),
            stage,
            toolchain: job.toolchain,
            config: job.config.clone(),
            file_root: job.file_root.clone(),
        };
        let claim = Claim {
            token,
            job_id: job_id.clone(),
            stage,
            worker_id: worker_id.clone(),
            issued_at: Instant::now(),
            acked: false,
        };
        if let Err(e) = self.claims.insert(claim) {
            tracing::error!(job_id = %job_id, error = %e, "Claim table out of step with job store");
            fail_job(
                store,
                &job_id,
                stage,
                FailureKind::CorruptState,
                &format!("claim could not be recorded: {}", e),
            );
            return;
        }

        record(
            store,
            &job_id,
            &format!("state changed to running:{} (claimed for worker {})", stage, worker_id),
        );
        tracing::info!(job_id = %job_id, stage = %stage, worker_id = %worker_id, claim = %token, "Stage claimed");

        let sent = self
            .registry
            .get(&worker_id)
            .map(|worker| worker.send(CoordinatorMessage::Claim(order)));
        if !matches!(sent, Some(Ok(()))) {
            self.delivery_failed(store, token, "worker queue unavailable", false);
        }
    }
}

/// Mark a job `failed:<stage>` and explain why in its log.
fn fail_job(store: &mut JobStore, job_id: &JobId, stage: Stage, kind: FailureKind, detail: &str) {
    let state = JobState::Failed(Some(stage));
    let updated = store.update(job_id, |job| {
        job.state = state;
        job.failure = Some(kind);
    });
    match updated {
        Ok(_) => {
            record(
                store,
                job_id,
                &format!("state changed to {} ({}: {})", state, kind, detail),
            );
            tracing::warn!(job_id = %job_id, stage = %stage, failure = %kind, detail, "Job failed");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job failure");
        }
    }
}

/// Remove a staged tree on the blocking pool.
fn discard_in_background(dir: StagedDir) {
    tokio::task::spawn_blocking(move || {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.discard() {
            tracing::warn!(dir = %path.display(), error = %e, "Failed to remove staged directory");
        }
    });
}

/// Best-effort event line in the job log.
fn record(store: &mut JobStore, job_id: &JobId, message: &str) {
    if let Err(e) = store.log_event(job_id, message) {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to write job log event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileTree;

    fn scheduler_with_job(dir: &std::path::Path) -> (Scheduler, JobId) {
        let mut store = JobStore::open(dir).unwrap();
        let staged = StagedDir::import(store.staging_root(), &FileTree::Empty).unwrap();
        let job_id = store
            .create(
                NewJob {
                    name: "mmult".to_string(),
                    toolchain: Toolchain::Sdsoc,
                    config: [("hwname".to_string(), "mmult".to_string())]
                        .into_iter()
                        .collect(),
                    stages: vec![Stage::Synthesize, Stage::Execute],
                },
                &staged,
            )
            .unwrap();
        let (scheduler, _handle) = Scheduler::new(Arc::new(CoordinatorConfig::default()), store);
        (scheduler, job_id)
    }

    #[test]
    fn test_unrecordable_claim_fails_job() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut scheduler, job_id) = scheduler_with_job(dir.path());
        scheduler
            .claims
            .insert(Claim {
                token: ClaimToken::new(),
                job_id: job_id.clone(),
                stage: Stage::Synthesize,
                worker_id: "w0".to_string(),
                issued_at: Instant::now(),
                acked: true,
            })
            .unwrap();

        let store = scheduler.store.clone();
        let mut guard = store.try_write().unwrap();
        scheduler.issue_claim(&mut guard, job_id.clone(), Stage::Synthesize, "w1".to_string());

        let job = guard.get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Failed(Some(Stage::Synthesize)));
        assert_eq!(job.failure, Some(FailureKind::CorruptState));
        assert!(job.log.contains("claim could not be recorded"));
        assert_eq!(scheduler.claims.for_job(&job_id).map(|c| c.worker_id.as_str()), Some("w0"));
    }
}
