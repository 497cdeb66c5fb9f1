//! Domain <-> protobuf conversions. Enumerations travel as their string
//! forms so the wire stays readable in logs and `grpcurl`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{PipelineError, Result};
use crate::ipc::{CapabilityOffer, ClaimOrder, CoordinatorMessage, StageReport, WorkerMessage};
use crate::proto::{self, coordinator_envelope, worker_envelope};
use crate::scheduler::WorkerSummary;
use crate::store::{Job, JobId};

fn malformed(what: &str) -> PipelineError {
    PipelineError::Internal(format!("malformed {} message", what))
}

impl From<WorkerMessage> for proto::WorkerEnvelope {
    fn from(message: WorkerMessage) -> Self {
        use worker_envelope::Kind;

        let kind = match message {
            WorkerMessage::Register {
                worker_id,
                capabilities,
            } => Kind::Register(proto::RegisterWorker {
                worker_id,
                capabilities: capabilities
                    .into_iter()
                    .map(|c| proto::CapabilityOffer {
                        name: c.name,
                        slots: c.slots,
                    })
                    .collect(),
            }),
            WorkerMessage::Heartbeat { worker_id } => Kind::Heartbeat(proto::Heartbeat { worker_id }),
            WorkerMessage::ClaimAck { claim } => Kind::ClaimAck(proto::ClaimAck {
                claim: claim.to_string(),
            }),
            WorkerMessage::ClaimReject { claim, reason } => Kind::ClaimReject(proto::ClaimReject {
                claim: claim.to_string(),
                reason,
            }),
            WorkerMessage::LogAppend {
                claim,
                job_id,
                text,
            } => Kind::LogAppend(proto::LogAppend {
                claim: claim.to_string(),
                job_id: job_id.to_string(),
                text,
            }),
            WorkerMessage::StageResult(report) => Kind::StageResult(proto::StageResult {
                claim: report.claim.to_string(),
                job_id: report.job_id.to_string(),
                stage: report.stage.to_string(),
                success: report.success,
                exit_code: report.exit_code,
                timed_out: report.timed_out,
            }),
            WorkerMessage::MakeConf {
                claim,
                job_id,
                values,
            } => Kind::MakeConf(proto::MakeConf {
                claim: claim.to_string(),
                job_id: job_id.to_string(),
                values: values.into_iter().collect(),
            }),
            WorkerMessage::Disconnect { worker_id } => {
                Kind::Disconnect(proto::Disconnect { worker_id })
            }
        };
        proto::WorkerEnvelope { kind: Some(kind) }
    }
}

impl TryFrom<proto::WorkerEnvelope> for WorkerMessage {
    type Error = PipelineError;

    fn try_from(envelope: proto::WorkerEnvelope) -> Result<Self> {
        use worker_envelope::Kind;

        let message = match envelope.kind.ok_or_else(|| malformed("worker"))? {
            Kind::Register(r) => WorkerMessage::Register {
                worker_id: r.worker_id,
                capabilities: r
                    .capabilities
                    .into_iter()
                    .map(|c| CapabilityOffer {
                        name: c.name,
                        slots: c.slots,
                    })
                    .collect(),
            },
            Kind::Heartbeat(h) => WorkerMessage::Heartbeat {
                worker_id: h.worker_id,
            },
            Kind::ClaimAck(a) => WorkerMessage::ClaimAck {
                claim: a.claim.parse()?,
            },
            Kind::ClaimReject(r) => WorkerMessage::ClaimReject {
                claim: r.claim.parse()?,
                reason: r.reason,
            },
            Kind::LogAppend(l) => WorkerMessage::LogAppend {
                claim: l.claim.parse()?,
                job_id: JobId::from(l.job_id),
                text: l.text,
            },
            Kind::StageResult(r) => WorkerMessage::StageResult(StageReport {
                claim: r.claim.parse()?,
                job_id: JobId::from(r.job_id),
                stage: r.stage.parse()?,
                success: r.success,
                exit_code: r.exit_code,
                timed_out: r.timed_out,
            }),
            Kind::MakeConf(m) => WorkerMessage::MakeConf {
                claim: m.claim.parse()?,
                job_id: JobId::from(m.job_id),
                values: m.values.into_iter().collect(),
            },
            Kind::Disconnect(d) => WorkerMessage::Disconnect {
                worker_id: d.worker_id,
            },
        };
        Ok(message)
    }
}

impl From<CoordinatorMessage> for proto::CoordinatorEnvelope {
    fn from(message: CoordinatorMessage) -> Self {
        use coordinator_envelope::Kind;

        let kind = match message {
            CoordinatorMessage::Registered {
                worker_id,
                heartbeat_interval_ms,
            } => Kind::Registered(proto::Registered {
                worker_id,
                heartbeat_interval_ms,
            }),
            CoordinatorMessage::Claim(order) => Kind::Claim(proto::ClaimOrder {
                claim: order.claim.to_string(),
                job_id: order.job_id.to_string(),
                name: order.name,
                stage: order.stage.to_string(),
                toolchain: order.toolchain.to_string(),
                config: order.config.into_iter().collect(),
                file_root: order.file_root.to_string_lossy().into_owned(),
            }),
            CoordinatorMessage::Cancel { claim } => Kind::Cancel(proto::CancelClaim {
                claim: claim.to_string(),
            }),
        };
        proto::CoordinatorEnvelope { kind: Some(kind) }
    }
}

impl TryFrom<proto::CoordinatorEnvelope> for CoordinatorMessage {
    type Error = PipelineError;

    fn try_from(envelope: proto::CoordinatorEnvelope) -> Result<Self> {
        use coordinator_envelope::Kind;

        let message = match envelope.kind.ok_or_else(|| malformed("coordinator"))? {
            Kind::Registered(r) => CoordinatorMessage::Registered {
                worker_id: r.worker_id,
                heartbeat_interval_ms: r.heartbeat_interval_ms,
            },
            Kind::Claim(c) => CoordinatorMessage::Claim(ClaimOrder {
                claim: c.claim.parse()?,
                job_id: JobId::from(c.job_id),
                name: c.name,
                stage: c.stage.parse()?,
                toolchain: c.toolchain.parse()?,
                config: c.config.into_iter().collect::<BTreeMap<_, _>>(),
                file_root: PathBuf::from(c.file_root),
            }),
            Kind::Cancel(c) => CoordinatorMessage::Cancel {
                claim: c.claim.parse()?,
            },
        };
        Ok(message)
    }
}

/// Job record for the client API. Listings pass jobs without logs.
pub fn job_to_proto(job: &Job) -> proto::JobInfo {
    proto::JobInfo {
        job_id: job.id.to_string(),
        name: job.name.clone(),
        toolchain: job.toolchain.to_string(),
        state: job.state.to_string(),
        started_ms: job.started.timestamp_millis(),
        config: job.config.clone().into_iter().collect(),
        stages: job.stages.iter().map(ToString::to_string).collect(),
        stage_index: job.current_stage_index as u32,
        failure: job.failure.map(|f| f.to_string()).unwrap_or_default(),
        log: job.log.clone(),
        make_conf: job.make_conf.clone().into_iter().collect(),
        file_root: job.file_root.to_string_lossy().into_owned(),
    }
}

pub fn worker_to_proto(worker: &WorkerSummary) -> proto::WorkerInfo {
    proto::WorkerInfo {
        worker_id: worker.worker_id.clone(),
        capabilities: worker
            .capabilities
            .iter()
            .map(|c| proto::CapabilityInfo {
                name: c.name.clone(),
                slots: c.slots,
                active: c.active,
            })
            .collect(),
        last_heartbeat_ms_ago: worker.last_heartbeat_age.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ClaimToken;
    use crate::pipeline::{Stage, Toolchain};

    #[test]
    fn claim_order_survives_the_wire() {
        let order = ClaimOrder {
            claim: ClaimToken::new(),
            job_id: JobId::from("Xy3_abc"),
            name: "mmult".to_string(),
            stage: Stage::Synthesize,
            toolchain: Toolchain::Sdsoc,
            config: BTreeMap::from([("hwname".to_string(), "mmult".to_string())]),
            file_root: PathBuf::from("/srv/instance/jobs/Xy3_abc"),
        };
        let envelope = proto::CoordinatorEnvelope::from(CoordinatorMessage::Claim(order.clone()));
        let back = CoordinatorMessage::try_from(envelope).unwrap();
        assert_eq!(back, CoordinatorMessage::Claim(order));
    }

    #[test]
    fn stage_result_keeps_missing_exit_code() {
        let report = StageReport {
            claim: ClaimToken::new(),
            job_id: JobId::from("j1"),
            stage: Stage::Execute,
            success: false,
            exit_code: None,
            timed_out: true,
        };
        let envelope = proto::WorkerEnvelope::from(WorkerMessage::StageResult(report.clone()));
        assert_eq!(
            WorkerMessage::try_from(envelope).unwrap(),
            WorkerMessage::StageResult(report)
        );
    }

    #[test]
    fn bad_fields_are_rejected() {
        let empty = proto::WorkerEnvelope { kind: None };
        assert!(WorkerMessage::try_from(empty).is_err());

        let bad_claim = proto::WorkerEnvelope {
            kind: Some(worker_envelope::Kind::ClaimAck(proto::ClaimAck {
                claim: "not-a-uuid".to_string(),
            })),
        };
        assert!(WorkerMessage::try_from(bad_claim).is_err());

        let bad_stage = proto::WorkerEnvelope {
            kind: Some(worker_envelope::Kind::StageResult(proto::StageResult {
                claim: ClaimToken::new().to_string(),
                job_id: "j1".to_string(),
                stage: "tapeout".to_string(),
                success: true,
                exit_code: Some(0),
                timed_out: false,
            })),
        };
        assert!(WorkerMessage::try_from(bad_stage).is_err());
    }
}
