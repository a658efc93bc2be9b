// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for calcflow-core integration tests.
//!
//! Provides a doubling calculation with its parser, a few workflows and
//! helpers to build runners with fast polling and backoff.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use calcflow_core::process::{ResumeValue, Step, StepContext};
use calcflow_core::{
    CalcInfo, CalcJobLogic, ChildRequest, JobOptions, ParseOutcome, ParserError, PluginRegistry,
    ProcessLogic, ProcessSpec, RetrievedFiles, Runner, RunnerConfig,
};
use calcflow_environment::scheduler::CodeCommand;
use calcflow_environment::transport::{CommandOutput, MockTransport};
use calcflow_environment::{BackoffPolicy, ComputerConfig};
use calcflow_protocol::{Communicator, LocalBroker};

/// Exit code the doubling parser uses when `out.txt` was not retrieved.
pub const EXIT_MISSING_OUTPUT: i32 = 300;

/// Job id the mock SLURM host hands out.
pub const MOCK_JOB_ID: &str = "4242";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calcflow_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Calculation computing `2 * x` in a shell.
pub struct DoubleJob;

impl CalcJobLogic for DoubleJob {
    fn spec(&self) -> Arc<ProcessSpec> {
        ProcessSpec::builder("double")
            .input("x", true)
            .output("result", true)
            .exit_code(EXIT_MISSING_OUTPUT, "ERROR_MISSING_OUTPUT", "out.txt was not retrieved")
            .build()
            .unwrap()
    }

    fn parser(&self) -> &str {
        "double"
    }

    fn prepare(&self, inputs: &Value, _options: &JobOptions) -> anyhow::Result<CalcInfo> {
        let x = inputs["x"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("x must be an integer"))?;
        Ok(CalcInfo::default()
            .file("x.txt", x.to_string())
            .command(
                CodeCommand::new("sh")
                    .arg("-c")
                    .arg("echo $(( $(cat x.txt) * 2 ))")
                    .stdout("out.txt"),
            )
            .retrieve("out.txt"))
    }
}

pub fn double_parser(
    retrieved: &RetrievedFiles,
    _inputs: &Value,
) -> Result<ParseOutcome, ParserError> {
    if retrieved.is_missing("out.txt") {
        return Ok(ParseOutcome::failed(
            EXIT_MISSING_OUTPUT,
            "out.txt was not retrieved",
        ));
    }
    let text = retrieved.read_to_string("out.txt")?;
    let result: i64 = text
        .trim()
        .parse()
        .map_err(|_| ParserError::Invalid(format!("not an integer: {text:?}")))?;
    Ok(ParseOutcome::ok(json!({ "result": result })))
}

/// Waits for the `go` signal and finishes with the delivered value.
pub struct SignalWorkflow;

#[async_trait]
impl ProcessLogic for SignalWorkflow {
    fn spec(&self) -> Arc<ProcessSpec> {
        ProcessSpec::builder("signal")
            .dynamic_inputs()
            .output("value", false)
            .build()
            .unwrap()
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let label = ctx.label().map(str::to_string);
        match label.as_deref() {
            None => Ok(Step::await_signal("go", "done")),
            Some("done") => match ctx.take_resume() {
                Some(ResumeValue::Signal(value)) => Ok(Step::finish(json!({ "value": value }))),
                other => anyhow::bail!("unexpected resume value {other:?}"),
            },
            Some(other) => anyhow::bail!("unknown label {other}"),
        }
    }
}

/// Sleeps for `inputs.ms` inside its first step, then waits for `go`.
pub struct SlowWorkflow;

#[async_trait]
impl ProcessLogic for SlowWorkflow {
    fn spec(&self) -> Arc<ProcessSpec> {
        ProcessSpec::builder("slow")
            .input("ms", false)
            .output("value", false)
            .build()
            .unwrap()
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let label = ctx.label().map(str::to_string);
        match label.as_deref() {
            None => {
                let ms = ctx.inputs()["ms"].as_u64().unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Step::await_signal("go", "done"))
            }
            Some("done") => Ok(Step::finish(json!({}))),
            Some(other) => anyhow::bail!("unknown label {other}"),
        }
    }
}

/// Launches `inputs.children` sub-processes of `inputs.child_type`
/// (default `signal`) and waits for all of them.
pub struct ParentWorkflow;

#[async_trait]
impl ProcessLogic for ParentWorkflow {
    fn spec(&self) -> Arc<ProcessSpec> {
        ProcessSpec::builder("parent")
            .input("children", true)
            .input("child_type", false)
            .input("child_inputs", false)
            .output("finished", true)
            .build()
            .unwrap()
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let label = ctx.label().map(str::to_string);
        match label.as_deref() {
            None => {
                let count = ctx.inputs()["children"].as_u64().unwrap_or(1);
                let child_type = ctx.inputs()["child_type"]
                    .as_str()
                    .unwrap_or("signal")
                    .to_string();
                let child_inputs = match &ctx.inputs()["child_inputs"] {
                    Value::Null => json!({}),
                    inputs => inputs.clone(),
                };
                let children = (0..count)
                    .map(|i| {
                        ChildRequest::new(child_type.clone(), child_inputs.clone())
                            .with_key(format!("child-{i}"))
                    })
                    .collect();
                Ok(Step::await_children(children, "collect"))
            }
            Some("collect") => match ctx.take_resume() {
                Some(ResumeValue::Children(outcomes)) => {
                    let finished = outcomes.iter().filter(|o| o.is_success()).count();
                    Ok(Step::finish(json!({ "finished": finished })))
                }
                other => anyhow::bail!("unexpected resume value {other:?}"),
            },
            Some(other) => anyhow::bail!("unknown label {other}"),
        }
    }
}

/// Runs `double` as a child and returns its result.
pub struct DoubleWorkflow;

#[async_trait]
impl ProcessLogic for DoubleWorkflow {
    fn spec(&self) -> Arc<ProcessSpec> {
        ProcessSpec::builder("double_wf")
            .input("x", true)
            .input("computer", true)
            .output("result", true)
            .build()
            .unwrap()
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let label = ctx.label().map(str::to_string);
        match label.as_deref() {
            None => {
                let computer = ctx.inputs()["computer"].as_str().unwrap_or("localhost");
                let child = ChildRequest::new("double", json!({ "x": ctx.inputs()["x"] }))
                    .with_options(JobOptions::new(computer));
                Ok(Step::await_children(vec![child], "collect"))
            }
            Some("collect") => match ctx.take_resume() {
                Some(ResumeValue::Children(outcomes)) => {
                    let outputs = outcomes
                        .first()
                        .and_then(|o| o.outputs.clone())
                        .unwrap_or(Value::Null);
                    Ok(Step::finish(json!({ "result": outputs["result"] })))
                }
                other => anyhow::bail!("unexpected resume value {other:?}"),
            },
            Some(other) => anyhow::bail!("unknown label {other}"),
        }
    }
}

/// Registry with the test calculations, workflows and parser.
pub fn test_registry() -> PluginRegistry {
    PluginRegistry::with_defaults()
        .calcjob(Arc::new(DoubleJob))
        .parser("double", Arc::new(double_parser))
        .workflow(Arc::new(SignalWorkflow))
        .workflow(Arc::new(SlowWorkflow))
        .workflow(Arc::new(ParentWorkflow))
        .workflow(Arc::new(DoubleWorkflow))
}

/// Backoff small enough for tests, three retries after the first attempt.
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
        multiplier: 2.0,
        jitter: 0.0,
        max_retries: 3,
    }
}

pub fn test_config(runner_id: &str, work_dir: &std::path::Path) -> RunnerConfig {
    RunnerConfig::default()
        .with_runner_id(runner_id)
        .with_work_dir(work_dir)
        .with_poll_interval(Duration::from_millis(50), 0.0)
        .with_transport_backoff(fast_backoff())
        .with_rpc_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Mock SLURM host: `sbatch` returns [`MOCK_JOB_ID`] and, if `writes_output`
/// is set, leaves `out.txt` with `2` behind. `squeue` reports the job as
/// running `running_polls` times and completed afterwards.
pub fn mock_slurm_host(running_polls: usize, writes_output: bool) -> MockTransport {
    let polls = AtomicUsize::new(0);
    MockTransport::with_handler(move |cmd, fs| {
        if cmd.command.starts_with("sbatch") {
            if writes_output && let Some(dir) = cmd.workdir {
                fs.write(&format!("{dir}/out.txt"), "2\n");
            }
            CommandOutput::success(format!("Submitted batch job {MOCK_JOB_ID}\n"))
        } else if cmd.command.starts_with("squeue") {
            let n = polls.fetch_add(1, Ordering::SeqCst);
            let state = if n < running_polls { "R" } else { "CD" };
            CommandOutput::success(format!("{MOCK_JOB_ID}|{state}|0:01|calcflow\n"))
        } else {
            CommandOutput::success("")
        }
    })
}

/// Computer named `cluster` using the `mock` transport and SLURM.
pub fn mock_cluster() -> ComputerConfig {
    ComputerConfig::new("cluster", "mock", "slurm", "/scratch")
}

/// Computer named `localhost` running jobs directly under `root`.
pub fn local_computer(root: &std::path::Path) -> ComputerConfig {
    ComputerConfig::new("localhost", "local", "direct", root.to_string_lossy())
}

/// Runner against `cluster` backed by `host`.
pub async fn mock_runner(
    runner_id: &str,
    work_dir: &std::path::Path,
    host: MockTransport,
    broker: Arc<dyn Communicator>,
) -> Runner {
    Runner::builder()
        .config(test_config(runner_id, work_dir).with_computer(mock_cluster()))
        .registry(test_registry().transport_instance("mock", Arc::new(host)))
        .communicator(broker)
        .build()
        .await
        .unwrap()
}

pub fn broker() -> Arc<dyn Communicator> {
    Arc::new(LocalBroker::new())
}

/// Poll `f` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
