//! Worker side of the pipeline.
//!
//! A worker connects to the coordinator, advertises its capabilities and
//! runs whatever stages it is offered, within its per-capability slot
//! limits.
//!
//! # Components
//!
//! - [`WorkerPool`]: connection lifecycle, claim acceptance and draining
//! - [`CommandPlanner`]: turns a claim into [`Step`]s ([`ToolchainPlanner`]
//!   for the real SDSoC/SDAccel flows)
//! - [`StageExecutor`]: runs steps as child processes and streams output
//! - [`heartbeat`]: keeps the registration alive
//!
//! # Claim flow
//!
//! 1. Coordinator sends a claim; the pool acks it or rejects it (no slot,
//!    capability not offered, shutting down)
//! 2. The planner produces steps for the stage
//! 3. The executor runs them in the job directory, forwarding output as
//!    log batches
//! 4. The pool reports a stage result unless the claim was cancelled

pub mod executor;
pub mod heartbeat;
pub mod planner;
pub mod pool;

pub use executor::{ClaimReporter, StageExecutor, StageOutcome};
pub use planner::{CommandPlanner, CommandSpec, OutputMode, Step, ToolchainPlanner};
pub use pool::{SessionEnd, WorkerPool};
