// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Calculation stages against a mock SLURM host: polling, retrieval,
//! transport retry budget, resubmission, pausing and cancellation.

mod common;

use std::time::Duration;

use serde_json::json;

use calcflow_core::process::FailureKind;
use calcflow_core::{CalcStage, JobOptions, LaunchRequest, ProcessId, ProcessState, Runner};
use calcflow_environment::transport::{CommandOutput, MockFault, MockOp, MockTransport};

use common::*;

const TIMEOUT: Duration = Duration::from_secs(30);

async fn submit_double(runner: &Runner, x: i64) -> ProcessId {
    runner
        .submit(
            LaunchRequest::new("double", json!({ "x": x }))
                .with_options(JobOptions::new("cluster")),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_scheduler_done_drives_retrieve_and_parse() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(2, true);
    let runner = mock_runner("runner-slurm", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.state, ProcessState::Finished);
    assert_eq!(record.outputs, Some(json!({"result": 2})));

    let calc = record.calc.unwrap();
    assert_eq!(calc.stage, CalcStage::Done);
    assert_eq!(calc.job_id.as_deref(), Some(MOCK_JOB_ID));
    assert_eq!(calc.retries.transport, 0);

    let commands = host.commands().await;
    assert!(commands[0].starts_with("sbatch"));
    let polls = commands.iter().filter(|c| c.starts_with("squeue")).count();
    assert!(polls >= 3, "expected two running polls and one done, got {polls}");
    assert!(commands.iter().any(|c| c.contains("--jobs=4242")));

    // The submit script and input landed in the job directory
    let remote = calc.remote_workdir.unwrap();
    assert!(host.file_exists(&format!("{remote}/_submit.sh")).await);
    assert_eq!(
        host.read_file(&format!("{remote}/x.txt")).await.unwrap(),
        b"1".to_vec()
    );

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_retrieved_file_still_reaches_parser() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(0, false);
    let runner = mock_runner("runner-missing", dir.path(), host, broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.state, ProcessState::Finished);
    let status = record.exit_status.unwrap();
    assert_eq!(status.code, EXIT_MISSING_OUTPUT);
    assert_eq!(status.message.as_deref(), Some("out.txt was not retrieved"));
    assert!(record.outputs.is_none());

    let calc = record.calc.unwrap();
    assert!(calc.missing_files.iter().any(|f| f == "out.txt"));
    assert!(record.reports.iter().any(|r| r.message.contains("out.txt")));

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upload_recovers_within_retry_budget() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(0, true);
    host.fail_next(MockOp::Mkdir, 3, MockFault::Connection).await;
    let runner = mock_runner("runner-retry", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.state, ProcessState::Finished);
    assert_eq!(record.outputs, Some(json!({"result": 2})));
    assert_eq!(record.calc.unwrap().retries.transport, 3);
    assert!(host.calls(MockOp::Mkdir).await >= 4);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upload_excepts_when_retry_budget_is_spent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(0, true);
    host.fail_next(MockOp::Mkdir, 4, MockFault::Connection).await;
    let runner = mock_runner("runner-exhausted", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.state, ProcessState::Excepted);
    let failure = record.exit_status.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::TransportError);
    // One attempt plus three retries, nothing submitted
    assert_eq!(host.calls(MockOp::Mkdir).await, 4);
    assert!(
        !host
            .commands()
            .await
            .iter()
            .any(|c| c.starts_with("sbatch"))
    );

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_authentication_failure_is_not_retried() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(0, true);
    host.fail_next(MockOp::Mkdir, 1, MockFault::Authentication)
        .await;
    let runner = mock_runner("runner-auth", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.state, ProcessState::Excepted);
    assert_eq!(host.calls(MockOp::Mkdir).await, 1);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_submission_is_resubmitted_then_excepted() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = MockTransport::with_handler(|cmd, _| {
        if cmd.command.starts_with("sbatch") {
            CommandOutput::failure(1, "sbatch: error: invalid partition specified")
        } else {
            CommandOutput::success("")
        }
    });
    let runner = mock_runner("runner-rejected", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.state, ProcessState::Excepted);
    let failure = record.exit_status.unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::SchedulerError);

    // Default budget of three resubmissions after the first attempt
    let submissions = host
        .commands()
        .await
        .iter()
        .filter(|c| c.starts_with("sbatch"))
        .count();
    assert_eq!(submissions, 4);
    assert_eq!(record.calc.unwrap().job_id, None);

    runner.shutdown().await.unwrap();
}

fn count(commands: &[String], prefix: &str) -> usize {
    commands.iter().filter(|c| c.starts_with(prefix)).count()
}

#[tokio::test]
async fn test_paused_calculation_is_not_submitted_until_played() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(0, true);
    host.set_latency(MockOp::Mkdir, Duration::from_millis(500))
        .await;
    let runner = mock_runner("runner-pause-submit", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    // Lands while the upload step is still creating the job directory
    let id = submit_double(&runner, 1).await;
    assert!(runner.pause(id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = runner.status(id).await.unwrap();
    assert!(status.paused);
    assert_ne!(status.calc.unwrap().stage, CalcStage::Scheduled);
    assert_eq!(count(&host.commands().await, "sbatch"), 0);

    assert!(runner.play(id).await.unwrap());
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ProcessState::Finished);
    assert_eq!(record.outputs, Some(json!({"result": 2})));
    assert_eq!(count(&host.commands().await, "sbatch"), 1);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_paused_scheduled_calculation_keeps_polling() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let running_polls = 20;
    let host = mock_slurm_host(running_polls, true);
    let runner = mock_runner("runner-pause-poll", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let scheduled = eventually(TIMEOUT, || async {
        runner
            .status(id)
            .await
            .map(|s| s.calc.as_ref().map(|c| c.stage) == Some(CalcStage::Scheduled))
            .unwrap_or(false)
    })
    .await;
    assert!(scheduled, "job was never scheduled");
    assert!(runner.pause(id).await.unwrap());

    // Polling carries on until the scheduler reports the job complete
    let completed = eventually(TIMEOUT, || async {
        count(&host.commands().await, "squeue") > running_polls
    })
    .await;
    assert!(completed, "polling stopped while paused");

    // The completion is held back until the process is played
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = runner.status(id).await.unwrap();
    assert!(status.paused);
    assert_eq!(status.state, ProcessState::Waiting);
    assert_eq!(status.calc.unwrap().stage, CalcStage::Scheduled);
    assert!(!host.commands().await.iter().any(|c| c.starts_with("scancel")));

    assert!(runner.play(id).await.unwrap());
    let record = tokio::time::timeout(TIMEOUT, runner.wait_for(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ProcessState::Finished);
    assert_eq!(record.outputs, Some(json!({"result": 2})));

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_kill_cancels_scheduled_job() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = mock_slurm_host(usize::MAX, true);
    let runner = mock_runner("runner-cancel", dir.path(), host.clone(), broker()).await;
    runner.start().await.unwrap();

    let id = submit_double(&runner, 1).await;
    let scheduled = eventually(TIMEOUT, || async {
        runner
            .status(id)
            .await
            .map(|s| {
                s.state == ProcessState::Waiting
                    && s.calc.as_ref().map(|c| c.stage) == Some(CalcStage::Scheduled)
            })
            .unwrap_or(false)
    })
    .await;
    assert!(scheduled, "job was never scheduled");

    let status = runner.status(id).await.unwrap();
    assert_eq!(
        status.calc.unwrap().job_id.as_deref(),
        Some(MOCK_JOB_ID)
    );

    runner.kill(id, None).await.unwrap();
    let record = runner.store().load(&id).await.unwrap().process;
    assert_eq!(record.state, ProcessState::Killed);
    assert!(
        host.commands()
            .await
            .iter()
            .any(|c| c == &format!("scancel {MOCK_JOB_ID}"))
    );

    runner.shutdown().await.unwrap();
}
