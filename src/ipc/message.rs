use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::{Stage, Toolchain};
use crate::store::JobId;

/// Identifies one issued claim. Every worker reply carries it back so the
/// coordinator can drop replies for claims it already settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClaimToken {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PipelineError::Internal(format!("invalid claim token '{}': {}", s, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOffer {
    pub name: String,
    pub slots: u32,
}

/// Work order for one stage of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOrder {
    pub claim: ClaimToken,
    pub job_id: JobId,
    pub name: String,
    pub stage: Stage,
    pub toolchain: Toolchain,
    pub config: BTreeMap<String, String>,
    /// Job directory; workers share the coordinator's filesystem view.
    pub file_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub claim: ClaimToken,
    pub job_id: JobId,
    pub stage: Stage,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    Register {
        worker_id: String,
        capabilities: Vec<CapabilityOffer>,
    },
    Heartbeat {
        worker_id: String,
    },
    ClaimAck {
        claim: ClaimToken,
    },
    ClaimReject {
        claim: ClaimToken,
        reason: String,
    },
    LogAppend {
        claim: ClaimToken,
        job_id: JobId,
        text: String,
    },
    StageResult(StageReport),
    MakeConf {
        claim: ClaimToken,
        job_id: JobId,
        values: BTreeMap<String, String>,
    },
    Disconnect {
        worker_id: String,
    },
}

/// Coordinator -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    Registered {
        worker_id: String,
        heartbeat_interval_ms: u64,
    },
    Claim(ClaimOrder),
    Cancel {
        claim: ClaimToken,
    },
}
