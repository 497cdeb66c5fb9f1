//! Scheduler tests driven through fake workers.
//!
//! These tests verify:
//! - Stage sequencing and state transitions on worker results
//! - Claim delivery failures, retries and backoff
//! - Worker loss handling and restart recovery
//! - Operator overrides and parallelism limits


use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;

use synthfleet::config::ClaimRetryPolicy;
use synthfleet::error::{FailureKind, PipelineError};
use synthfleet::ipc::{CoordinatorMessage, WorkerMessage};
use synthfleet::pipeline::{F1Mode, JobOptions, Stage, Toolchain};
use synthfleet::scheduler::SubmitRequest;
use synthfleet::store::{FileTree, JobState};
use test_harness::{
    assert_eventually, sdsoc_request, test_coordinator_config, FakeWorker, TestCoordinator,
};

const WAIT: Duration = Duration::from_secs(5);
const BOTH: &[(&str, u32)] = &[("synthesize", 1), ("execute", 1)];

#[tokio::test]
async fn test_submit_fixes_stage_sequence() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));

    let job_id = coordinator.submit(sdsoc_request("blink")).await;

    let job = coordinator.job(&job_id).await;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.stages, vec![Stage::Synthesize, Stage::Execute]);
    assert!(job
        .log
        .contains("submitted for sdsoc with stages synthesize -> execute"));
}

#[tokio::test]
async fn test_f1_submission_records_default_mode() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));

    let job_id = coordinator
        .submit(SubmitRequest {
            name: "vadd".to_string(),
            toolchain: Toolchain::F1,
            config: [("hwname".to_string(), "vadd".to_string())]
                .into_iter()
                .collect(),
            files: FileTree::Empty,
        })
        .await;

    let job = coordinator.job(&job_id).await;
    assert_eq!(job.config.get("mode").map(String::as_str), Some("sw_emu"));
    assert_eq!(job.stages, vec![Stage::Synthesize, Stage::Execute]);
}

#[tokio::test]
async fn test_blank_f1_mode_stores_resolved_default() {
    let dir = TempDir::new().unwrap();
    let mut config = test_coordinator_config(dir.path());
    config.default_f1_mode = F1Mode::Hw;
    let coordinator = TestCoordinator::start(config);

    let job_id = coordinator
        .submit(SubmitRequest {
            name: "vadd".to_string(),
            toolchain: Toolchain::F1,
            config: [
                ("hwname".to_string(), "vadd".to_string()),
                ("mode".to_string(), String::new()),
            ]
            .into_iter()
            .collect(),
            files: FileTree::Empty,
        })
        .await;

    let job = coordinator.job(&job_id).await;
    assert_eq!(job.config.get("mode").map(String::as_str), Some("hw"));
    assert_eq!(
        job.stages,
        vec![Stage::Synthesize, Stage::Afi, Stage::Execute]
    );

    // A worker reads the stored config with its own fallback and must still
    // arrive at the mode the stage sequence was built for.
    let seen_by_worker = JobOptions::parse(Toolchain::F1, &job.config, F1Mode::SwEmu).unwrap();
    assert_eq!(seen_by_worker.mode, Some(F1Mode::Hw));
}

#[tokio::test]
async fn test_submit_rejects_bad_options() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));

    let mut unknown = sdsoc_request("bad");
    unknown.config.insert("bogus".to_string(), "1".to_string());
    let result = coordinator.handle.submit(unknown).await;
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));

    let no_hwname = SubmitRequest {
        config: BTreeMap::new(),
        ..sdsoc_request("bad")
    };
    let result = coordinator.handle.submit(no_hwname).await;
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));

    assert!(coordinator.handle.list_jobs().await.is_empty());
    let staging = dir.path().join("staging");
    assert_eventually(
        || {
            let staging = staging.clone();
            async move { std::fs::read_dir(&staging).is_ok_and(|mut d| d.next().is_none()) }
        },
        WAIT,
        "rejected submissions should not leave staged files",
    )
    .await;
}

#[tokio::test]
async fn test_stages_advance_to_done() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("blink")).await;

    let claim = worker.next_claim(WAIT).await.expect("synthesize claim");
    assert_eq!(claim.job_id, job_id);
    assert_eq!(claim.stage, Stage::Synthesize);
    assert_eq!(claim.name, "blink");
    assert_eq!(coordinator.job(&job_id).await.state, JobState::Running(Stage::Synthesize));

    worker.ack(&claim).await;
    worker.log(&claim, "synthesis output\n").await;
    worker.finish(&claim, true, Some(0)).await;

    let claim = worker.next_claim(WAIT).await.expect("execute claim");
    assert_eq!(claim.stage, Stage::Execute);
    worker.ack(&claim).await;
    worker.finish(&claim, true, Some(0)).await;

    assert!(coordinator.wait_for_state(&job_id, JobState::Done, WAIT).await);
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.current_stage_index, 2);
    assert!(job.log.contains("synthesis output\n"));
    assert!(job.log.contains("acquired in state running:synthesize by worker w1"));
    assert!(job.log.contains("stage synthesize finished; state changed to queued"));
    assert!(job.log.contains("stage execute finished; state changed to done"));
}

#[tokio::test]
async fn test_failed_stage_marks_job() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("broken")).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&claim).await;
    worker.finish(&claim, false, Some(2)).await;

    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.failure, Some(FailureKind::StageExecution));
    assert!(job.log.contains("stage execution failed: exit code 2 on worker w1"));

    // Nothing further is offered for a failed job.
    assert!(worker.next_claim(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_timed_out_stage_records_timeout() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("slow")).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&claim).await;
    worker.time_out(&claim).await;

    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );
    assert_eq!(
        coordinator.job(&job_id).await.failure,
        Some(FailureKind::StageTimeout)
    );
}

#[tokio::test]
async fn test_make_conf_is_recorded() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("conf")).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&claim).await;
    worker
        .send(WorkerMessage::MakeConf {
            claim: claim.claim,
            job_id: job_id.clone(),
            values: [("PLATFORM".to_string(), "zed".to_string())]
                .into_iter()
                .collect(),
        })
        .await;

    let handle = coordinator.handle.clone();
    let id = job_id.clone();
    assert_eventually(
        || {
            let handle = handle.clone();
            let id = id.clone();
            async move {
                handle
                    .get_job(&id)
                    .await
                    .is_ok_and(|job| job.make_conf.get("PLATFORM").map(String::as_str) == Some("zed"))
            }
        },
        WAIT,
        "make conf should be stored on the job",
    )
    .await;
}

#[tokio::test]
async fn test_rejected_claim_is_retried_then_fails() {
    let dir = TempDir::new().unwrap();
    let mut config = test_coordinator_config(dir.path());
    config.claim_retry = ClaimRetryPolicy {
        max_attempts: Some(2),
        backoff_ms: 20,
        max_backoff_ms: 100,
    };
    let coordinator = TestCoordinator::start(config);
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("picky")).await;

    let first = worker.next_claim(WAIT).await.expect("first claim");
    worker.reject(&first, "busy").await;
    assert!(coordinator.wait_for_log(&job_id, "attempt 1", WAIT).await);

    let second = worker.next_claim(WAIT).await.expect("second claim");
    assert_ne!(first.claim, second.claim);
    worker.reject(&second, "still busy").await;

    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.failure, Some(FailureKind::ClaimDelivery));
    assert!(job.log.contains("rejected by worker w1: busy"));
}

#[tokio::test]
async fn test_unacknowledged_claim_expires_and_is_reoffered() {
    let dir = TempDir::new().unwrap();
    let mut config = test_coordinator_config(dir.path());
    config.claim_ack_timeout_ms = 200;
    let coordinator = TestCoordinator::start(config);
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("quiet")).await;
    let first = worker.next_claim(WAIT).await.expect("first claim");

    let cancelled = worker.next_cancel(WAIT).await.expect("cancel for unacked claim");
    assert_eq!(cancelled, first.claim);
    assert!(
        coordinator
            .wait_for_log(&job_id, "no acknowledgement within 200ms", WAIT)
            .await
    );

    let second = worker.next_claim(WAIT).await.expect("claim offered again");
    assert_eq!(second.job_id, job_id);
    assert_ne!(second.claim, first.claim);
}

#[tokio::test]
async fn test_lost_worker_fails_acknowledged_stage() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("orphan")).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&claim).await;
    assert!(coordinator.wait_for_log(&job_id, "acquired in state", WAIT).await);

    drop(worker);

    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.failure, Some(FailureKind::WorkerLost));
    assert!(job.log.contains("worker w1 disconnected"));
}

#[tokio::test]
async fn test_lost_worker_before_ack_requeues() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut first = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("handoff")).await;
    first.next_claim(WAIT).await.expect("claim");
    drop(first);

    assert!(coordinator.wait_for_log(&job_id, "before acknowledging", WAIT).await);

    let mut second = FakeWorker::connect(&coordinator.transport, "w2", BOTH).await;
    let claim = second.next_claim(WAIT).await.expect("claim for replacement worker");
    assert_eq!(claim.job_id, job_id);
    assert_eq!(claim.stage, Stage::Synthesize);
}

#[tokio::test]
async fn test_silent_worker_is_expired() {
    let dir = TempDir::new().unwrap();
    let mut config = test_coordinator_config(dir.path());
    config.heartbeat_timeout_ms = 300;
    let coordinator = TestCoordinator::start(config);
    let mut worker = FakeWorker::connect_silent(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("silent")).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&claim).await;

    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.failure, Some(FailureKind::WorkerLost));
    assert!(job.log.contains("missed heartbeats"));
    assert!(coordinator.handle.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reregistration_replaces_old_connection() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut old = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("restart")).await;
    let claim = old.next_claim(WAIT).await.expect("claim");
    old.ack(&claim).await;
    assert!(coordinator.wait_for_log(&job_id, "acquired in state", WAIT).await);

    let _new = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;
    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );

    // The old connection's late result is dropped.
    old.finish(&claim, true, Some(0)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.state, JobState::Failed(Some(Stage::Synthesize)));
    assert!(job.log.contains("re-registered on a new connection"));
}

#[tokio::test]
async fn test_log_from_non_owner_is_ignored() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut owner = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;
    let intruder = FakeWorker::connect(&coordinator.transport, "w2", &[("execute", 1)]).await;

    let job_id = coordinator.submit(sdsoc_request("owned")).await;
    let claim = owner.next_claim(WAIT).await.expect("claim");
    owner.ack(&claim).await;

    intruder.log(&claim, "forged line\n").await;
    owner.log(&claim, "genuine line\n").await;

    assert!(coordinator.wait_for_log(&job_id, "genuine line", WAIT).await);
    assert!(!coordinator.job(&job_id).await.log.contains("forged line"));
}

#[tokio::test]
async fn test_operator_requeue_withdraws_claim() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("rerun")).await;
    let first = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&first).await;

    let state = coordinator
        .handle
        .set_state(&job_id, JobState::Queued)
        .await
        .unwrap();
    assert_eq!(state, JobState::Queued);

    let mut cancelled = None;
    let mut reissued = None;
    while cancelled.is_none() || reissued.is_none() {
        match worker.recv(WAIT).await.expect("coordinator message") {
            CoordinatorMessage::Cancel { claim } => cancelled = Some(claim),
            CoordinatorMessage::Claim(order) => reissued = Some(order),
            _ => {}
        }
    }
    assert_eq!(cancelled, Some(first.claim));
    let second = reissued.unwrap();
    assert_eq!(second.stage, Stage::Synthesize);

    // A result for the withdrawn claim changes nothing.
    worker.finish(&first, true, Some(0)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        coordinator.job(&job_id).await.state,
        JobState::Running(Stage::Synthesize)
    );
    assert!(coordinator
        .job(&job_id)
        .await
        .log
        .contains("state changed to queued by operator"));
}

#[tokio::test]
async fn test_operator_can_restart_at_stage() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));

    let job_id = coordinator.submit(sdsoc_request("resume")).await;
    coordinator
        .handle
        .set_state(&job_id, JobState::Done)
        .await
        .unwrap();

    let bad = coordinator
        .handle
        .set_state(&job_id, JobState::Running(Stage::Afi))
        .await;
    assert!(matches!(bad, Err(PipelineError::InvalidState(_))));

    let state = coordinator
        .handle
        .set_state(&job_id, JobState::Running(Stage::Execute))
        .await
        .unwrap();
    assert_eq!(state, JobState::Queued);

    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    assert_eq!(claim.stage, Stage::Execute);
    assert_eq!(coordinator.job(&job_id).await.current_stage_index, 1);
}

#[tokio::test]
async fn test_delete_withdraws_claim() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("doomed")).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    worker.ack(&claim).await;
    let root = coordinator.job(&job_id).await.file_root;

    coordinator.handle.delete_job(&job_id).await.unwrap();

    assert_eq!(worker.next_cancel(WAIT).await, Some(claim.claim));
    assert!(matches!(
        coordinator.handle.get_job(&job_id).await,
        Err(PipelineError::JobNotFound(_))
    ));
    assert!(!root.exists());

    let staging = dir.path().join("staging");
    assert_eventually(
        || {
            let staging = staging.clone();
            async move { std::fs::read_dir(&staging).is_ok_and(|mut d| d.next().is_none()) }
        },
        WAIT,
        "deleted job tree should be removed in the background",
    )
    .await;
}

#[tokio::test]
async fn test_large_submission_does_not_stall_scheduler() {
    let dir = TempDir::new().unwrap();
    let sources = TempDir::new().unwrap();
    for i in 0..400 {
        std::fs::write(sources.path().join(format!("kernel_{}.cpp", i)), vec![b'x'; 64 * 1024]).unwrap();
    }
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let handle = coordinator.handle.clone();
    let request = SubmitRequest {
        files: FileTree::Directory(sources.path().to_path_buf()),
        ..sdsoc_request("big")
    };
    let submit = tokio::spawn(async move { handle.submit(request).await });

    // The scheduler keeps answering while the files are copied.
    for _ in 0..20 {
        let answered =
            tokio::time::timeout(Duration::from_millis(500), coordinator.handle.list_workers()).await;
        assert!(matches!(answered, Ok(Ok(_))), "scheduler should stay responsive");
        if submit.is_finished() {
            break;
        }
    }

    let job_id = submit.await.unwrap().unwrap();
    let files = coordinator.handle.list_files(&job_id).await.unwrap();
    assert_eq!(files.len(), 400);
}

#[tokio::test]
async fn test_config_edit_keeps_stage_sequence() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));

    let job_id = coordinator.submit(sdsoc_request("edit")).await;
    coordinator
        .handle
        .set_config_field(&job_id, "skipexec", "true")
        .await
        .unwrap();
    coordinator
        .handle
        .set_config_field(&job_id, "name", "renamed")
        .await
        .unwrap();

    let job = coordinator.job(&job_id).await;
    assert_eq!(job.stages, vec![Stage::Synthesize, Stage::Execute]);
    assert_eq!(job.name, "renamed");
    assert!(job.log.contains("config skipexec set to true"));
    assert!(job.log.contains("renamed to renamed"));
}

#[tokio::test]
async fn test_config_edit_must_stay_plannable() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let job_id = coordinator.submit(sdsoc_request("guarded")).await;
    let before = coordinator.job(&job_id).await;

    let unknown = coordinator
        .handle
        .set_config_field(&job_id, "note", "rerun after fix")
        .await;
    assert!(matches!(unknown, Err(PipelineError::InvalidConfig(_))));
    let malformed = coordinator
        .handle
        .set_config_field(&job_id, "skipexec", "maybe")
        .await;
    assert!(matches!(malformed, Err(PipelineError::InvalidConfig(_))));
    let dropped_hwname = coordinator
        .handle
        .set_config_field(&job_id, "hwname", "")
        .await;
    assert!(matches!(dropped_hwname, Err(PipelineError::InvalidConfig(_))));

    let after = coordinator.job(&job_id).await;
    assert_eq!(after.config, before.config);
    assert!(!after.log.contains("config note"));

    // The job still runs with its original config.
    let claim = worker.next_claim(WAIT).await.expect("claim");
    assert_eq!(claim.config, before.config);
    assert!(JobOptions::parse(Toolchain::Sdsoc, &claim.config, F1Mode::SwEmu).is_ok());
}

#[tokio::test]
async fn test_oldest_job_is_offered_first() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));

    let first = coordinator.submit(sdsoc_request("first")).await;
    let second = coordinator.submit(sdsoc_request("second")).await;

    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;
    let claim = worker.next_claim(WAIT).await.expect("claim");
    assert_eq!(claim.job_id, first);
    worker.ack(&claim).await;
    worker.finish(&claim, false, Some(1)).await;

    let claim = worker.next_claim(WAIT).await.expect("claim");
    assert_eq!(claim.job_id, second);
}

#[tokio::test]
async fn test_parallelism_limit_caps_in_flight_stages() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut a = FakeWorker::connect(&coordinator.transport, "a", &[("synthesize", 2)]).await;
    let mut b = FakeWorker::connect(&coordinator.transport, "b", &[("synthesize", 2)]).await;

    let first = coordinator.submit(sdsoc_request("one")).await;
    let second = coordinator.submit(sdsoc_request("two")).await;

    let claim = a.next_claim(WAIT).await.expect("claim for the oldest job");
    assert_eq!(claim.job_id, first);
    a.ack(&claim).await;

    // The default limit of one synthesize stage fleet-wide holds the second job.
    assert!(b.next_claim(Duration::from_millis(300)).await.is_none());
    assert_eq!(coordinator.job(&second).await.state, JobState::Queued);

    a.finish(&claim, true, Some(0)).await;

    // Least-loaded worker, ties to the lowest id.
    let next = a.next_claim(WAIT).await.expect("claim for the second job");
    assert_eq!(next.job_id, second);
}

#[tokio::test]
async fn test_configured_parallelism_spreads_over_workers() {
    let dir = TempDir::new().unwrap();
    let config = test_coordinator_config(dir.path()).with_parallelism("synthesize", 2);
    let coordinator = TestCoordinator::start(config);
    let mut a = FakeWorker::connect(&coordinator.transport, "a", &[("synthesize", 2)]).await;
    let mut b = FakeWorker::connect(&coordinator.transport, "b", &[("synthesize", 2)]).await;

    coordinator.submit(sdsoc_request("one")).await;
    coordinator.submit(sdsoc_request("two")).await;

    let on_a = a.next_claim(WAIT).await.expect("claim on a");
    let on_b = b.next_claim(WAIT).await.expect("claim on b");
    assert_ne!(on_a.job_id, on_b.job_id);

    let workers = coordinator.handle.list_workers().await.unwrap();
    assert_eq!(workers.len(), 2);
    for worker in workers {
        assert_eq!(worker.capabilities[0].name, "synthesize");
        assert_eq!(worker.capabilities[0].active, 1);
        assert_eq!(worker.capabilities[0].slots, 2);
    }
}

#[tokio::test]
async fn test_restart_fails_interrupted_stage() {
    let dir = TempDir::new().unwrap();
    let job_id = {
        let mut coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
        let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;
        let job_id = coordinator.submit(sdsoc_request("interrupted")).await;
        let claim = worker.next_claim(WAIT).await.expect("claim");
        worker.ack(&claim).await;
        assert!(coordinator.wait_for_log(&job_id, "acquired in state", WAIT).await);
        coordinator.stop().await;
        job_id
    };

    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    assert!(
        coordinator
            .wait_for_state(&job_id, JobState::Failed(Some(Stage::Synthesize)), WAIT)
            .await
    );
    let job = coordinator.job(&job_id).await;
    assert_eq!(job.failure, Some(FailureKind::WorkerLost));
    assert!(job.log.contains("coordinator restarted"));
}

#[tokio::test]
async fn test_estimate_job_finishes_without_execution() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut worker = FakeWorker::connect(&coordinator.transport, "w1", BOTH).await;

    let mut request = sdsoc_request("estimate-only");
    request.config.insert("estimate".to_string(), "true".to_string());
    let job_id = coordinator.submit(request).await;
    assert_eq!(coordinator.job(&job_id).await.stages, vec![Stage::Estimate]);

    let claim = worker.next_claim(WAIT).await.expect("estimate claim");
    assert_eq!(claim.stage, Stage::Estimate);
    worker.ack(&claim).await;
    worker.finish(&claim, true, Some(0)).await;

    assert!(coordinator.wait_for_state(&job_id, JobState::Done, WAIT).await);
    assert!(worker.next_claim(Duration::from_millis(300)).await.is_none());
    assert!(!coordinator.job(&job_id).await.log.contains("running:execute"));
}

#[tokio::test]
async fn test_job_waits_for_capable_worker() {
    let dir = TempDir::new().unwrap();
    let coordinator = TestCoordinator::start(test_coordinator_config(dir.path()));
    let mut board = FakeWorker::connect(&coordinator.transport, "board", &[("execute", 1)]).await;

    let job_id = coordinator.submit(sdsoc_request("waiting")).await;
    assert!(board.next_claim(Duration::from_millis(300)).await.is_none());
    assert_eq!(coordinator.job(&job_id).await.state, JobState::Queued);

    let mut builder = FakeWorker::connect(&coordinator.transport, "builder", &[("synthesize", 1)]).await;
    let claim = builder.next_claim(WAIT).await.expect("claim once a builder registers");
    assert_eq!(claim.job_id, job_id);
    assert_eq!(claim.stage, Stage::Synthesize);
}
