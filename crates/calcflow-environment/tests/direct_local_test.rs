// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direct scheduler driven over the local transport, end to end.

use std::sync::Arc;
use std::time::Duration;

use calcflow_environment::Connection;
use calcflow_environment::scheduler::{
    CodeCommand, DirectScheduler, JobState, JobTemplate, SUBMIT_SCRIPT_FILENAME, Scheduler,
};
use calcflow_environment::transport::{LocalTransport, TransportPool};

#[tokio::test]
async fn test_direct_job_runs_and_disappears() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("job");
    let workdir = workdir.to_str().unwrap().to_string();

    let pool = TransportPool::new();
    pool.register("localhost", Arc::new(LocalTransport::new()), 2)
        .await;
    let scheduler = DirectScheduler::new();

    let mut job = JobTemplate::new("double", &workdir);
    job.commands
        .push(CodeCommand::new("sh").arg("-c").arg("echo $((21 * 2)) > out.txt"));
    let script = scheduler.render_submit_script(&job).unwrap();

    let local_script = dir.path().join("script.sh");
    tokio::fs::write(&local_script, script).await.unwrap();

    let conn = pool.acquire("localhost").await.unwrap();
    conn.mkdir(&workdir, true).await.unwrap();
    conn.put(&local_script, &format!("{workdir}/{SUBMIT_SCRIPT_FILENAME}"))
        .await
        .unwrap();

    let submit = conn
        .exec(
            &scheduler.render_submit_command(SUBMIT_SCRIPT_FILENAME),
            Some(&workdir),
        )
        .await
        .unwrap();
    let job_id = scheduler.parse_submit_output(&submit).unwrap();

    // Poll until the process is gone or reported finished
    let mut finished = false;
    for _ in 0..100 {
        let out = conn
            .exec(&scheduler.render_status_query(&[job_id.clone()]), None)
            .await
            .unwrap();
        let jobs = scheduler.parse_status_output(&out).unwrap();
        match jobs.get(&job_id) {
            None => {
                finished = true;
                break;
            }
            Some(info) if info.state == JobState::Done => {
                finished = true;
                break;
            }
            Some(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(finished, "direct job did not finish");

    let result = tokio::fs::read_to_string(format!("{workdir}/out.txt"))
        .await
        .unwrap();
    assert_eq!(result.trim(), "42");
    assert!(conn.exists(&format!("{workdir}/_scheduler-stdout.txt")).await.unwrap());
}
