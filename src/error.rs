use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Corrupt state for job {job_id}: {detail}")]
    CorruptState { job_id: String, detail: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why a job left the happy path. Recorded on the job and echoed into its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage's command exited unsuccessfully.
    StageExecution,
    /// The stage exceeded its wall-clock limit and was killed.
    StageTimeout,
    /// The worker holding an acknowledged claim disconnected or went silent.
    WorkerLost,
    /// A claim could not be delivered within the retry policy.
    ClaimDelivery,
    /// The stored record contradicted the scheduler's view.
    CorruptState,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::StageExecution => write!(f, "stage execution failed"),
            FailureKind::StageTimeout => write!(f, "stage timed out"),
            FailureKind::WorkerLost => write!(f, "worker lost"),
            FailureKind::ClaimDelivery => write!(f, "claim delivery failed"),
            FailureKind::CorruptState => write!(f, "corrupt state"),
        }
    }
}
