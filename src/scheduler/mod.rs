//! Stage scheduling.
//!
//! A single [`Scheduler`] task owns every piece of mutable scheduling state:
//! the worker registry, the outstanding claims and the delivery retry
//! bookkeeping. It is also the only writer of the [`JobStore`]. Everything
//! else talks to it through a cloneable [`SchedulerHandle`], which sends
//! [`SchedulerEvent`]s and waits on a `oneshot` for the reply. Status reads
//! bypass the task and take a read lock on the store.
//!
//! Every event is followed by a dispatch pass, and a periodic tick expires
//! silent workers and unacknowledged claims. Copying a submission's files
//! and removing a deleted job's tree run on the blocking pool, never on the
//! scheduler task.

pub mod claims;
pub mod event_loop;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::{PipelineError, Result};
use crate::ipc::{CapabilityOffer, CoordinatorLink, CoordinatorMessage, WorkerMessage};
use crate::pipeline::Toolchain;
use crate::store::{FileTree, Job, JobId, JobState, JobStore, StagedDir};

pub use claims::{Claim, ClaimTable, DeliveryRetries};
pub use event_loop::Scheduler;
pub use registry::{WorkerRegistration, WorkerRegistry};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub name: String,
    pub toolchain: Toolchain,
    pub config: BTreeMap<String, String>,
    pub files: FileTree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySummary {
    pub name: String,
    pub slots: u32,
    pub active: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub capabilities: Vec<CapabilitySummary>,
    pub last_heartbeat_age: Duration,
}

/// Messages for the scheduler task.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A submission whose files are already staged.
    Submit {
        name: String,
        toolchain: Toolchain,
        config: BTreeMap<String, String>,
        from_archive: bool,
        files: StagedDir,
        response_tx: oneshot::Sender<Result<JobId>>,
    },
    SetState {
        job_id: JobId,
        state: JobState,
        response_tx: oneshot::Sender<Result<JobState>>,
    },
    SetConfigField {
        job_id: JobId,
        key: String,
        value: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Delete {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    ListWorkers {
        response_tx: oneshot::Sender<Vec<WorkerSummary>>,
    },
    WorkerRegistered {
        connection: u64,
        worker_id: String,
        capabilities: Vec<CapabilityOffer>,
        outbound: mpsc::Sender<CoordinatorMessage>,
    },
    FromWorker {
        connection: u64,
        worker_id: String,
        message: WorkerMessage,
    },
    WorkerDisconnected {
        connection: u64,
        worker_id: String,
    },
}

#[derive(Clone)]
pub struct SchedulerHandle {
    events: mpsc::Sender<SchedulerEvent>,
    store: Arc<RwLock<JobStore>>,
    next_connection: Arc<AtomicU64>,
}

impl SchedulerHandle {
    pub(crate) fn new(events: mpsc::Sender<SchedulerEvent>, store: Arc<RwLock<JobStore>>) -> Self {
        Self {
            events,
            store,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerEvent,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.events
            .send(make(response_tx))
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;
        response_rx.await.map_err(|_| PipelineError::ChannelClosed)
    }

    /// Stage the files, then have the scheduler validate options, fix the
    /// stage sequence and create the job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        let SubmitRequest {
            name,
            toolchain,
            config,
            files,
        } = request;
        let from_archive = files.is_archive();
        let staging_root = self.store.read().await.staging_root().to_path_buf();
        let files = tokio::task::spawn_blocking(move || StagedDir::import(&staging_root, &files))
            .await
            .map_err(|e| PipelineError::Internal(format!("file import task failed: {}", e)))??;

        self.request(|response_tx| SchedulerEvent::Submit {
            name,
            toolchain,
            config,
            from_archive,
            files,
            response_tx,
        })
        .await?
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        Ok(self.store.read().await.get(job_id)?.clone())
    }

    /// All jobs without their logs, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let store = self.store.read().await;
        let mut jobs: Vec<Job> = store.list().into_iter().map(Job::summary).collect();
        jobs.sort_by(|a, b| (a.started, a.seq).cmp(&(b.started, b.seq)));
        jobs
    }

    /// Operator override. Any outstanding claim for the job is withdrawn
    /// first; `queued` and `running:<stage>` put the job back in line.
    pub async fn set_state(&self, job_id: &JobId, state: JobState) -> Result<JobState> {
        let job_id = job_id.clone();
        self.request(|response_tx| SchedulerEvent::SetState {
            job_id,
            state,
            response_tx,
        })
        .await?
    }

    pub async fn set_config_field(&self, job_id: &JobId, key: &str, value: &str) -> Result<()> {
        let (job_id, key, value) = (job_id.clone(), key.to_string(), value.to_string());
        self.request(|response_tx| SchedulerEvent::SetConfigField {
            job_id,
            key,
            value,
            response_tx,
        })
        .await?
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let job_id = job_id.clone();
        self.request(|response_tx| SchedulerEvent::Delete {
            job_id,
            response_tx,
        })
        .await?
    }

    pub async fn list_files(&self, job_id: &JobId) -> Result<Vec<String>> {
        self.store.read().await.list_files(job_id)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerSummary>> {
        self.request(|response_tx| SchedulerEvent::ListWorkers { response_tx })
            .await
    }

    /// Serve one worker connection. The first message must be `register`;
    /// the scheduler is told when the connection ends.
    pub fn attach_worker(&self, link: CoordinatorLink) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        tokio::spawn(serve_connection(connection, link, events));
    }

    pub fn store(&self) -> Arc<RwLock<JobStore>> {
        self.store.clone()
    }
}

async fn serve_connection(
    connection: u64,
    link: CoordinatorLink,
    events: mpsc::Sender<SchedulerEvent>,
) {
    let (outbound, mut inbound) = link.into_parts();

    let worker_id = match inbound.recv().await {
        Some(WorkerMessage::Register {
            worker_id,
            capabilities,
        }) => {
            let registered = SchedulerEvent::WorkerRegistered {
                connection,
                worker_id: worker_id.clone(),
                capabilities,
                outbound,
            };
            if events.send(registered).await.is_err() {
                return;
            }
            worker_id
        }
        Some(other) => {
            tracing::warn!(connection, message = ?other, "Worker spoke before registering, closing");
            return;
        }
        None => return,
    };

    while let Some(message) = inbound.recv().await {
        if matches!(message, WorkerMessage::Disconnect { .. }) {
            tracing::info!(worker_id = %worker_id, "Worker disconnecting");
            break;
        }
        let event = SchedulerEvent::FromWorker {
            connection,
            worker_id: worker_id.clone(),
            message,
        };
        if events.send(event).await.is_err() {
            return;
        }
    }

    let _ = events
        .send(SchedulerEvent::WorkerDisconnected {
            connection,
            worker_id,
        })
        .await;
}
