//! gRPC surface of the coordinator.
//!
//! - `WorkerService.Attach`: one bidirectional stream per worker, carrying
//!   the same messages as an in-process [`Link`](crate::ipc::Link)
//! - `PipelineService`: submit, inspect and administer jobs

pub mod client_service;
pub mod convert;
pub mod server;
pub mod transport;
pub mod worker_service;

use tonic::Status;

use crate::error::PipelineError;

pub use client_service::PipelineApi;
pub use server::GrpcServer;
pub use transport::GrpcTransport;
pub use worker_service::WorkerChannelService;

impl From<PipelineError> for Status {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidConfig(msg) => Status::invalid_argument(msg),
            PipelineError::JobNotFound(id) => Status::not_found(format!("Job {} not found", id)),
            PipelineError::WorkerNotFound(id) => {
                Status::not_found(format!("Worker {} not found", id))
            }
            PipelineError::InvalidState(msg) => Status::failed_precondition(msg),
            PipelineError::ChannelClosed => Status::unavailable("Scheduler is not running"),
            PipelineError::Grpc(status) => status,
            other => Status::internal(other.to_string()),
        }
    }
}
