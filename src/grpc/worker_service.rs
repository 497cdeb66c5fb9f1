use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::ipc::{CoordinatorLink, WorkerMessage, LINK_BUFFER};
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{CoordinatorEnvelope, WorkerEnvelope};
use crate::scheduler::SchedulerHandle;

/// Bridges each `Attach` stream onto a coordinator link.
pub struct WorkerChannelService {
    scheduler: SchedulerHandle,
}

impl WorkerChannelService {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerChannelService {
    type AttachStream = Pin<Box<dyn Stream<Item = Result<CoordinatorEnvelope, Status>> + Send>>;

    async fn attach(
        &self,
        request: Request<Streaming<WorkerEnvelope>>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let peer = request.remote_addr();
        let mut inbound = request.into_inner();

        let (to_coordinator_tx, to_coordinator_rx) = mpsc::channel::<WorkerMessage>(LINK_BUFFER);
        let (to_worker_tx, to_worker_rx) = mpsc::channel(LINK_BUFFER);
        self.scheduler
            .attach_worker(CoordinatorLink::new(to_worker_tx, to_coordinator_rx));
        tracing::debug!(peer = ?peer, "Worker stream attached");

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(envelope)) => match WorkerMessage::try_from(envelope) {
                        Ok(message) => {
                            if to_coordinator_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(peer = ?peer, error = %e, "Dropping worker message"),
                    },
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(peer = ?peer, error = %status, "Worker stream failed");
                        break;
                    }
                }
            }
        });

        let outbound =
            ReceiverStream::new(to_worker_rx).map(|message| Ok::<_, Status>(CoordinatorEnvelope::from(message)));
        Ok(Response::new(Box::pin(outbound)))
    }
}
