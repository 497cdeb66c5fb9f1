use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, PipelineError};
use crate::pipeline::{Stage, Toolchain};

/// Short opaque job identifier, safe for URLs and directory names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let bytes: [u8; 8] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(bytes).replace('-', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a job is in its pipeline.
///
/// Rendered as `queued`, `running:<stage>`, `done`, `failed` or
/// `failed:<stage>`; the same strings are accepted by the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobState {
    Queued,
    Running(Stage),
    Done,
    Failed(Option<Stage>),
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running(stage) => write!(f, "running:{}", stage),
            JobState::Done => write!(f, "done"),
            JobState::Failed(None) => write!(f, "failed"),
            JobState::Failed(Some(stage)) => write!(f, "failed:{}", stage),
        }
    }
}

impl FromStr for JobState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => match s {
                "queued" => Ok(JobState::Queued),
                "done" => Ok(JobState::Done),
                "failed" => Ok(JobState::Failed(None)),
                other => Err(PipelineError::InvalidState(format!(
                    "unknown job state '{}'",
                    other
                ))),
            },
            Some(("running", stage)) => Ok(JobState::Running(stage.parse()?)),
            Some(("failed", stage)) => Ok(JobState::Failed(Some(stage.parse()?))),
            Some(_) => Err(PipelineError::InvalidState(format!(
                "unknown job state '{}'",
                s
            ))),
        }
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        state.to_string()
    }
}

impl TryFrom<String> for JobState {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One submitted build. The persisted part lives in `info.json`; the log
/// and file root are filled in by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub toolchain: Toolchain,
    pub config: BTreeMap<String, String>,
    /// Effective stage sequence, fixed at submission.
    pub stages: Vec<Stage>,
    pub current_stage_index: usize,
    pub state: JobState,
    pub started: DateTime<Utc>,
    /// Submission order; breaks ties between equal `started` stamps.
    pub seq: u64,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    /// Build variables reported by the make strategy's dry run.
    #[serde(default)]
    pub make_conf: BTreeMap<String, String>,
    #[serde(skip)]
    pub log: String,
    #[serde(skip)]
    pub file_root: PathBuf,
}

impl Job {
    pub fn hwname(&self) -> Option<&str> {
        self.config.get("hwname").map(String::as_str)
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.stages.get(self.current_stage_index).copied()
    }

    /// The stage waiting for a worker, if the job is queued.
    pub fn ready_stage(&self) -> Option<Stage> {
        match self.state {
            JobState::Queued => self.current_stage(),
            _ => None,
        }
    }

    /// Copy of the record without the log, for listings.
    pub fn summary(&self) -> Job {
        Job {
            id: self.id.clone(),
            name: self.name.clone(),
            toolchain: self.toolchain,
            config: self.config.clone(),
            stages: self.stages.clone(),
            current_stage_index: self.current_stage_index,
            state: self.state,
            started: self.started,
            seq: self.seq,
            failure: self.failure,
            make_conf: self.make_conf.clone(),
            log: String::new(),
            file_root: self.file_root.clone(),
        }
    }
}
