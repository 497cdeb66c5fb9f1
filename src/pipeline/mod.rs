//! Toolchains and the stage sequences their jobs move through.
//!
//! Each toolchain owns a fixed base sequence. When a job is submitted the
//! sequence is narrowed once, from the job's validated options, into the
//! job's effective sequence; the scheduler never re-derives it.
//!
//! | toolchain | base sequence                        |
//! |-----------|--------------------------------------|
//! | `sdsoc`   | unpack, synthesize, execute          |
//! | `f1`      | unpack, synthesize, afi, execute     |
//!
//! - `unpack` only runs for archive submissions.
//! - `estimate` replaces `synthesize` and drops everything after it.
//! - `afi` only runs for f1 jobs in `hw` mode.
//! - `skipexec` drops `execute`.

pub mod options;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::CoordinatorConfig;
use crate::error::PipelineError;

pub use options::{F1Mode, JobOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    F1,
    Sdsoc,
}

impl Toolchain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Toolchain::F1 => "f1",
            Toolchain::Sdsoc => "sdsoc",
        }
    }

    pub fn pipeline(self) -> Pipeline {
        Pipeline::for_toolchain(self)
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Toolchain {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f1" => Ok(Toolchain::F1),
            "sdsoc" => Ok(Toolchain::Sdsoc),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown toolchain '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Unpack,
    Synthesize,
    Estimate,
    Afi,
    Execute,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Unpack,
        Stage::Synthesize,
        Stage::Estimate,
        Stage::Afi,
        Stage::Execute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Unpack => "unpack",
            Stage::Synthesize => "synthesize",
            Stage::Estimate => "estimate",
            Stage::Afi => "afi",
            Stage::Execute => "execute",
        }
    }

    /// Capability label a worker must advertise to run this stage.
    /// Estimation runs on synthesis machines.
    pub fn required_capability(&self) -> &'static str {
        match self {
            Stage::Unpack => "unpack",
            Stage::Synthesize | Stage::Estimate => "synthesize",
            Stage::Afi => "afi",
            Stage::Execute => "execute",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidState(format!("unknown stage '{}'", s)))
    }
}

/// A stage together with the scheduling facts the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    pub stage: Stage,
    pub required_capability: &'static str,
    pub parallelism_limit: u32,
}

impl StageDefinition {
    pub fn new(stage: Stage, config: &CoordinatorConfig) -> Self {
        let required_capability = stage.required_capability();
        Self {
            stage,
            required_capability,
            parallelism_limit: config.parallelism_limit(required_capability),
        }
    }
}

/// Stage-sequence builder for one toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Sdsoc,
    F1,
}

impl Pipeline {
    pub fn for_toolchain(toolchain: Toolchain) -> Self {
        match toolchain {
            Toolchain::Sdsoc => Pipeline::Sdsoc,
            Toolchain::F1 => Pipeline::F1,
        }
    }

    pub fn base_stages(&self) -> &'static [Stage] {
        match self {
            Pipeline::Sdsoc => &[Stage::Unpack, Stage::Synthesize, Stage::Execute],
            Pipeline::F1 => &[Stage::Unpack, Stage::Synthesize, Stage::Afi, Stage::Execute],
        }
    }

    /// Narrow the base sequence for one job. `from_archive` says whether the
    /// submitted file tree still has to be unpacked.
    pub fn effective_stages(&self, options: &JobOptions, from_archive: bool) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(4);
        for &stage in self.base_stages() {
            match stage {
                Stage::Unpack if !from_archive => {}
                Stage::Synthesize if options.estimate => stages.push(Stage::Estimate),
                Stage::Afi if options.estimate || options.mode != Some(F1Mode::Hw) => {}
                Stage::Execute if options.estimate || options.skipexec => {}
                other => stages.push(other),
            }
        }
        stages
    }
}
