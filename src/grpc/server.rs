use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::client_service::PipelineApi;
use crate::grpc::worker_service::WorkerChannelService;
use crate::proto::pipeline_service_server::PipelineServiceServer;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::scheduler::SchedulerHandle;
use crate::tls::TlsIdentity;

pub struct GrpcServer {
    addr: SocketAddr,
    scheduler: SchedulerHandle,
    tls_identity: Option<TlsIdentity>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, scheduler: SchedulerHandle) -> Self {
        Self {
            addr,
            scheduler,
            tls_identity: None,
        }
    }

    pub fn with_tls(mut self, identity: TlsIdentity) -> Self {
        self.tls_identity = Some(identity);
        self
    }

    /// Serve both services until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut builder = Server::builder();
        if let Some(identity) = &self.tls_identity {
            builder = builder.tls_config(identity.server_tls_config())?;
        }

        tracing::info!(addr = %self.addr, tls = self.tls_identity.is_some(), "Starting gRPC server");

        builder
            .add_service(WorkerServiceServer::new(WorkerChannelService::new(
                self.scheduler.clone(),
            )))
            .add_service(PipelineServiceServer::new(PipelineApi::new(self.scheduler)))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
