use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint};

use crate::error::Result;
use crate::ipc::{CoordinatorMessage, Transport, WorkerLink, WorkerMessage, LINK_BUFFER};
use crate::proto::pipeline_service_client::PipelineServiceClient;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::proto::WorkerEnvelope;
use crate::tls::TlsIdentity;

/// Connects to a coordinator over gRPC, optionally with mTLS.
#[derive(Clone)]
pub struct GrpcTransport {
    endpoint: String,
    tls_identity: Option<TlsIdentity>,
}

impl GrpcTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls_identity: None,
        }
    }

    pub fn with_tls(mut self, identity: TlsIdentity) -> Self {
        self.tls_identity = Some(identity);
        self
    }

    pub async fn channel(&self) -> Result<Channel> {
        let mut endpoint = Endpoint::from_shared(self.endpoint.clone())?;
        if let Some(identity) = &self.tls_identity {
            endpoint = endpoint.tls_config(identity.client_tls_config())?;
        }
        Ok(endpoint.connect().await?)
    }

    /// Client for the job API on the same endpoint.
    pub async fn pipeline_client(&self) -> Result<PipelineServiceClient<Channel>> {
        Ok(PipelineServiceClient::new(self.channel().await?))
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn connect(&self) -> Result<WorkerLink> {
        let mut client = WorkerServiceClient::new(self.channel().await?);

        let (to_coordinator_tx, to_coordinator_rx) = mpsc::channel::<WorkerMessage>(LINK_BUFFER);
        let outbound = ReceiverStream::new(to_coordinator_rx).map(WorkerEnvelope::from);
        let mut inbound = client.attach(outbound).await?.into_inner();

        let (to_worker_tx, to_worker_rx) = mpsc::channel::<CoordinatorMessage>(LINK_BUFFER);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(envelope)) => match CoordinatorMessage::try_from(envelope) {
                        Ok(message) => {
                            if to_worker_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Dropping coordinator message"),
                    },
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(error = %status, "Coordinator stream failed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(endpoint = %self.endpoint, "Connected to coordinator");
        Ok(WorkerLink::new(to_coordinator_tx, to_worker_rx))
    }
}
