use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::ClaimRetryPolicy;
use crate::error::{PipelineError, Result};
use crate::ipc::ClaimToken;
use crate::pipeline::Stage;
use crate::store::JobId;

/// An outstanding offer of one stage to one worker.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: ClaimToken,
    pub job_id: JobId,
    pub stage: Stage,
    pub worker_id: String,
    pub issued_at: Instant,
    pub acked: bool,
}

impl Claim {
    pub fn capability(&self) -> &'static str {
        self.stage.required_capability()
    }
}

/// Outstanding claims. Each one occupies a slot of its stage's capability
/// on its worker; at most one claim exists per job.
#[derive(Debug, Default)]
pub struct ClaimTable {
    by_token: HashMap<ClaimToken, Claim>,
    by_job: HashMap<JobId, ClaimToken>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, claim: Claim) -> Result<()> {
        if let Some(existing) = self.by_job.get(&claim.job_id) {
            return Err(PipelineError::CorruptState {
                job_id: claim.job_id.to_string(),
                detail: format!("already claimed under {}", existing),
            });
        }
        self.by_job.insert(claim.job_id.clone(), claim.token);
        self.by_token.insert(claim.token, claim);
        Ok(())
    }

    pub fn get(&self, token: &ClaimToken) -> Option<&Claim> {
        self.by_token.get(token)
    }

    pub fn for_job(&self, job_id: &JobId) -> Option<&Claim> {
        self.by_job.get(job_id).and_then(|t| self.by_token.get(t))
    }

    pub fn ack(&mut self, token: &ClaimToken) -> bool {
        match self.by_token.get_mut(token) {
            Some(claim) => {
                claim.acked = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, token: &ClaimToken) -> Option<Claim> {
        let claim = self.by_token.remove(token)?;
        self.by_job.remove(&claim.job_id);
        Some(claim)
    }

    pub fn remove_for_job(&mut self, job_id: &JobId) -> Option<Claim> {
        let token = self.by_job.get(job_id).copied()?;
        self.remove(&token)
    }

    pub fn on_worker(&self, worker_id: &str) -> Vec<ClaimToken> {
        self.by_token
            .values()
            .filter(|c| c.worker_id == worker_id)
            .map(|c| c.token)
            .collect()
    }

    /// Claims for `capability` across the whole fleet.
    pub fn in_flight(&self, capability: &str) -> u32 {
        self.by_token
            .values()
            .filter(|c| c.capability() == capability)
            .count() as u32
    }

    pub fn active_on(&self, worker_id: &str, capability: &str) -> u32 {
        self.by_token
            .values()
            .filter(|c| c.worker_id == worker_id && c.capability() == capability)
            .count() as u32
    }

    /// Total claims held by a worker, used to prefer the least loaded one.
    pub fn load(&self, worker_id: &str) -> usize {
        self.by_token
            .values()
            .filter(|c| c.worker_id == worker_id)
            .count()
    }

    pub fn unacked_older_than(&self, timeout: Duration, now: Instant) -> Vec<ClaimToken> {
        self.by_token
            .values()
            .filter(|c| !c.acked && now.saturating_duration_since(c.issued_at) >= timeout)
            .map(|c| c.token)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

#[derive(Debug, Clone)]
struct RetryState {
    stage: Stage,
    attempts: u32,
    not_before: Instant,
}

/// Consecutive claim-delivery failures per job, with the backoff deadline
/// before the job may be offered again.
#[derive(Debug, Default)]
pub struct DeliveryRetries {
    entries: HashMap<JobId, RetryState>,
}

impl DeliveryRetries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure and return the attempt number.
    pub fn record_failure(
        &mut self,
        job_id: &JobId,
        stage: Stage,
        policy: &ClaimRetryPolicy,
        now: Instant,
    ) -> u32 {
        let entry = self
            .entries
            .entry(job_id.clone())
            .or_insert_with(|| RetryState {
                stage,
                attempts: 0,
                not_before: now,
            });
        if entry.stage != stage {
            entry.stage = stage;
            entry.attempts = 0;
        }
        entry.attempts += 1;
        entry.not_before = now + policy.backoff(entry.attempts);
        entry.attempts
    }

    pub fn is_deferred(&self, job_id: &JobId, now: Instant) -> bool {
        self.entries
            .get(job_id)
            .is_some_and(|entry| now < entry.not_before)
    }

    pub fn clear(&mut self, job_id: &JobId) {
        self.entries.remove(job_id);
    }
}
