use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::ipc::MemoryListener;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::store::JobStore;
use crate::tls::resolve_identity;

/// The coordinator process: one job store, one scheduler task and the
/// endpoints workers and clients reach it through.
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    scheduler: Scheduler,
    handle: SchedulerHandle,
}

impl Coordinator {
    /// Open (or create) the instance directory and recover its jobs.
    pub fn open(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let store = JobStore::open(&config.instance_dir)?;
        tracing::info!(
            instance_dir = %config.instance_dir.display(),
            jobs = store.len(),
            corrupt = store.corrupt_records().len(),
            "Opened job store"
        );

        let config = Arc::new(config);
        let (scheduler, handle) = Scheduler::new(config.clone(), store);
        Ok(Self {
            config,
            scheduler,
            handle,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Attach every in-process worker connection accepted by `listener`.
    pub fn serve_memory(&self, mut listener: MemoryListener) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Some(link) = listener.accept().await {
                handle.attach_worker(link);
            }
        });
    }

    /// Run the scheduler alone; workers must come in through
    /// [`serve_memory`](Self::serve_memory).
    pub async fn run_local(self, shutdown: CancellationToken) {
        self.scheduler.run(shutdown).await;
    }

    /// Run the scheduler and the gRPC server until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS material cannot be loaded or the server
    /// fails to bind.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut server = GrpcServer::new(self.config.listen_addr, self.handle.clone());
        if let Some(identity) = resolve_identity(&self.config.tls).await? {
            server = server.with_tls(identity);
        }

        let scheduler = tokio::spawn(self.scheduler.run(shutdown.clone()));
        let served = server.run(shutdown.clone()).await;
        if served.is_err() {
            shutdown.cancel();
        }
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
        served
    }
}
