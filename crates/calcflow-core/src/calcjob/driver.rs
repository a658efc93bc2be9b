// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage steps of a calculation.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use calcflow_environment::scheduler::{
    JobTemplate, SCHEDULER_STDERR, SCHEDULER_STDOUT, SUBMIT_SCRIPT_FILENAME,
};
use calcflow_environment::{Connection, TransportError};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{CalcEnv, CalcInfo, CalcJobLogic, CalcStage, ComputerEnv, JobOptions};
use crate::parser::RetrievedFiles;
use crate::process::actor::panic_message;
use crate::process::{
    Failure, FailureKind, JobOutcome, ProcessKind, ProcessLogic, ProcessSpec, ResumeValue, Step,
    StepContext,
};

/// Adapts a [`CalcJobLogic`] to the generic process driver.
pub(crate) struct CalcJobProcess {
    logic: Arc<dyn CalcJobLogic>,
    env: Arc<CalcEnv>,
}

impl CalcJobProcess {
    pub fn new(logic: Arc<dyn CalcJobLogic>, env: Arc<CalcEnv>) -> Self {
        Self { logic, env }
    }

    fn computer(&self, name: &str) -> anyhow::Result<&ComputerEnv> {
        self.env
            .computer(name)
            .ok_or_else(|| anyhow!("unknown computer '{name}'"))
    }

    fn sandbox_dir(&self, key: &str) -> PathBuf {
        self.env.work_dir.join("sandbox").join(key)
    }

    fn retrieved_dir(&self, key: &str) -> PathBuf {
        self.env.work_dir.join("retrieved").join(key)
    }

    async fn upload(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let options = job_options(ctx)?;
        let computer = self.computer(&options.computer)?;
        let key = ctx.process_id().as_uuid().simple().to_string();

        let info = self
            .logic
            .prepare(ctx.inputs(), &options)
            .context("preparing calculation")?;
        for (name, _) in &info.files {
            check_relative(name)?;
        }
        for name in &info.retrieve_list {
            check_relative(name)?;
        }

        let remote_dir = computer.config.job_workdir(&key);
        let template = job_template(&info, &options, &remote_dir, &key);
        let script = computer
            .scheduler
            .render_submit_script(&template)
            .map_err(|e| Failure::scheduler(&e))?;

        let sandbox = self.sandbox_dir(&key);
        let mut files: Vec<String> = Vec::with_capacity(info.files.len() + 1);
        for (name, contents) in info
            .files
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_slice()))
            .chain(std::iter::once((SUBMIT_SCRIPT_FILENAME, script.as_bytes())))
        {
            let path = sandbox.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating sandbox {}", parent.display()))?;
            }
            tokio::fs::write(&path, contents)
                .await
                .with_context(|| format!("writing sandbox file {name}"))?;
            files.push(name.to_string());
        }

        let (result, retries) = self
            .env
            .backoff
            .retry("upload", |_| {
                upload_once(self, &options.computer, &sandbox, &remote_dir, &files)
            })
            .await;
        let calc = calc_state(ctx)?;
        calc.retries.transport += retries;
        result.map_err(|e| Failure::transport(&e))?;

        let mut retrieve_list = info.retrieve_list.clone();
        for name in [SCHEDULER_STDOUT, SCHEDULER_STDERR] {
            if !retrieve_list.iter().any(|r| r == name) {
                retrieve_list.push(name.to_string());
            }
        }
        calc.remote_workdir = Some(remote_dir.clone());
        calc.retrieve_list = retrieve_list;
        calc.stage = CalcStage::Submitting;

        info!(computer = %options.computer, remote_dir = %remote_dir, files = files.len(), "Uploaded calculation");
        ctx.report(format!("uploaded {} files to {remote_dir}", files.len()));
        Ok(Step::Continue)
    }

    async fn submit(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let (computer_name, remote_dir) = {
            let calc = calc_state(ctx)?;
            let dir = calc
                .remote_workdir
                .clone()
                .ok_or_else(|| anyhow!("submitting before upload"))?;
            (calc.computer.clone(), dir)
        };
        let computer = self.computer(&computer_name)?;
        let command = computer
            .scheduler
            .render_submit_command(SUBMIT_SCRIPT_FILENAME);

        let (result, retries) = self
            .env
            .backoff
            .retry("submit", |_| {
                exec_once(self, &computer_name, &command, Some(&remote_dir))
            })
            .await;
        let calc = calc_state(ctx)?;
        calc.retries.transport += retries;
        let output = result.map_err(|e| Failure::transport(&e))?;
        calc.submit_attempts += 1;

        match computer.scheduler.parse_submit_output(&output) {
            Ok(job_id) => {
                calc.job_id = Some(job_id.clone());
                calc.job_state = Some(calcflow_environment::JobState::Queued);
                calc.stage = CalcStage::Scheduled;
                info!(computer = %computer_name, job_id = %job_id, "Submitted job");
                ctx.report(format!("submitted job {job_id} to {computer_name}"));
                Ok(Step::Await {
                    on: crate::process::Awaitable::JobUpdate {
                        computer: computer_name,
                        job_id,
                    },
                    then: None,
                })
            }
            Err(e) => {
                calc.job_id = None;
                calc.retries.scheduler += 1;
                let attempt = calc.retries.scheduler;
                if attempt > self.env.max_resubmissions {
                    return Err(Failure::scheduler(&e).into());
                }
                warn!(
                    computer = %computer_name,
                    attempt,
                    max_resubmissions = self.env.max_resubmissions,
                    error = %e,
                    "Submission rejected, resubmitting"
                );
                ctx.warn(format!("submission rejected ({e}), resubmitting"));
                tokio::time::sleep(self.env.backoff.delay(attempt)).await;
                Ok(Step::Continue)
            }
        }
    }

    fn on_job_update(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let resume = ctx.take_resume();
        let calc = calc_state(ctx)?;
        match resume {
            Some(ResumeValue::Job(JobOutcome::Done { info })) => {
                let vanished = info.is_none();
                calc.job_state = Some(calcflow_environment::JobState::Done);
                calc.job_info = info;
                calc.stage = CalcStage::Retrieving;
                if vanished {
                    ctx.warn("job disappeared from the scheduler listing, retrieving anyway");
                }
                Ok(Step::Continue)
            }
            Some(ResumeValue::Job(JobOutcome::Failed { failure })) => Err(failure.into()),
            _ => {
                // No update recorded, e.g. replaying from an older checkpoint
                let job_id = calc
                    .job_id
                    .clone()
                    .ok_or_else(|| anyhow!("scheduled without a job id"))?;
                Ok(Step::Await {
                    on: crate::process::Awaitable::JobUpdate {
                        computer: calc.computer.clone(),
                        job_id,
                    },
                    then: None,
                })
            }
        }
    }

    async fn retrieve(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let key = ctx.process_id().as_uuid().simple().to_string();
        let (computer_name, remote_dir, names) = {
            let calc = calc_state(ctx)?;
            let dir = calc
                .remote_workdir
                .clone()
                .ok_or_else(|| anyhow!("retrieving before upload"))?;
            (calc.computer.clone(), dir, calc.retrieve_list.clone())
        };

        let local = self.retrieved_dir(&key);
        match tokio::fs::remove_dir_all(&local).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("clearing retrieved directory"),
        }
        tokio::fs::create_dir_all(&local)
            .await
            .context("creating retrieved directory")?;

        let (result, retries) = self
            .env
            .backoff
            .retry("retrieve", |_| {
                retrieve_once(self, &computer_name, &remote_dir, &names, &local)
            })
            .await;
        let calc = calc_state(ctx)?;
        calc.retries.transport += retries;
        let missing = result.map_err(|e| Failure::transport(&e))?;

        calc.missing_files = missing.clone();
        calc.stage = CalcStage::Parsing;
        if !missing.is_empty() {
            warn!(missing = ?missing, "Some files were not retrieved");
            ctx.warn(format!("files not found remotely: {}", missing.join(", ")));
        }
        debug!(local = %local.display(), "Retrieved calculation files");
        Ok(Step::Continue)
    }

    async fn parse(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let key = ctx.process_id().as_uuid().simple().to_string();
        let parser = self
            .env
            .parsers
            .get(self.logic.parser())
            .cloned()
            .ok_or_else(|| anyhow!("parser '{}' is not registered", self.logic.parser()))?;

        let files = {
            let calc = calc_state(ctx)?;
            RetrievedFiles {
                root: self.retrieved_dir(&key),
                missing: calc.missing_files.clone(),
                job_info: calc.job_info.clone(),
            }
        };
        let inputs = ctx.inputs().clone();

        let joined = tokio::task::spawn_blocking(move || parser.parse(&files, &inputs)).await;
        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(Failure::from_error(FailureKind::ParsingError, &e).into()),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                return Err(Failure::new(
                    FailureKind::ParsingError,
                    format!("parser panicked: {message}"),
                )
                .into());
            }
            Err(e) => {
                return Err(Failure::new(FailureKind::ParsingError, e.to_string()).into());
            }
        };

        calc_state(ctx)?.stage = CalcStage::Done;
        if outcome.exit_code == 0 {
            return Ok(Step::Finish {
                outputs: outcome.outputs.unwrap_or_else(|| json!({})),
            });
        }

        let spec = self.logic.spec();
        let message = outcome
            .message
            .or_else(|| {
                spec.exit_code_by_value(outcome.exit_code)
                    .map(|e| e.message.clone())
            })
            .unwrap_or_else(|| format!("parser returned exit code {}", outcome.exit_code));
        Ok(Step::Fail {
            exit_code: outcome.exit_code,
            message,
            outputs: outcome.outputs,
        })
    }
}

#[async_trait]
impl ProcessLogic for CalcJobProcess {
    fn spec(&self) -> Arc<ProcessSpec> {
        self.logic.spec()
    }

    fn kind(&self) -> ProcessKind {
        ProcessKind::Calculation
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step> {
        let stage = ctx
            .calc()
            .map(|c| c.stage)
            .ok_or_else(|| anyhow!("calculation state missing"))?;
        debug!(stage = %stage, "Calculation step");
        match stage {
            CalcStage::Uploading => self.upload(ctx).await,
            CalcStage::Submitting => self.submit(ctx).await,
            CalcStage::Scheduled => self.on_job_update(ctx),
            CalcStage::Retrieving => self.retrieve(ctx).await,
            CalcStage::Parsing => self.parse(ctx).await,
            CalcStage::Done => Err(anyhow!("calculation already parsed")),
        }
    }

    async fn on_kill(&self, ctx: &mut StepContext<'_>) {
        let Some(calc) = ctx.calc() else {
            return;
        };
        let (CalcStage::Scheduled, Some(job_id)) = (calc.stage, calc.job_id.clone()) else {
            return;
        };
        let Ok(computer) = self.computer(&calc.computer) else {
            return;
        };
        let command = computer.scheduler.render_cancel_command(&job_id);
        match exec_once(self, &calc.computer, &command, None).await {
            Ok(output) => match computer.scheduler.parse_cancel_output(&output) {
                Ok(true) => info!(job_id = %job_id, "Cancelled scheduler job"),
                Ok(false) | Err(_) => {
                    warn!(job_id = %job_id, stderr = %output.stderr.trim(), "Scheduler refused cancel")
                }
            },
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to cancel scheduler job"),
        }
    }
}

fn job_options(ctx: &StepContext<'_>) -> anyhow::Result<JobOptions> {
    ctx.options()
        .cloned()
        .ok_or_else(|| anyhow!("calculation has no job options"))
}

fn calc_state<'c>(ctx: &'c mut StepContext<'_>) -> anyhow::Result<&'c mut super::CalcJobState> {
    ctx.calc_mut()
        .ok_or_else(|| anyhow!("calculation state missing"))
}

/// Relative, non-escaping path inside the working directory.
fn check_relative(name: &str) -> anyhow::Result<()> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(anyhow!("'{name}' is not a relative path inside the working directory"))
    }
}

fn job_template(info: &CalcInfo, options: &JobOptions, remote_dir: &str, key: &str) -> JobTemplate {
    let name = options
        .job_name
        .clone()
        .unwrap_or_else(|| format!("calcflow-{}", &key[..key.len().min(8)]));
    let mut template = JobTemplate::new(name, remote_dir);
    template.prepend_text = info.prepend_text.clone();
    template.append_text = info.append_text.clone();
    template.environment = info.environment.clone();
    template.resources = options.resources.clone();
    template.max_wallclock_seconds = options.max_wallclock_seconds;
    template.queue_name = options.queue_name.clone();
    template.account = options.account.clone();
    template.commands = info.commands.clone();
    template
}

async fn upload_once(
    driver: &CalcJobProcess,
    computer: &str,
    sandbox: &Path,
    remote_dir: &str,
    files: &[String],
) -> Result<(), TransportError> {
    let conn = driver.env.pool.acquire(computer).await?;
    conn.mkdir(remote_dir, true).await?;
    for name in files {
        let remote = format!("{remote_dir}/{name}");
        if let Some((parent, _)) = name.rsplit_once('/') {
            conn.mkdir(&format!("{remote_dir}/{parent}"), true).await?;
        }
        conn.put(&sandbox.join(name), &remote).await?;
    }
    Ok(())
}

async fn exec_once(
    driver: &CalcJobProcess,
    computer: &str,
    command: &str,
    workdir: Option<&str>,
) -> Result<calcflow_environment::CommandOutput, TransportError> {
    let conn = driver.env.pool.acquire(computer).await?;
    conn.exec(command, workdir).await
}

/// Copy back every listed file; names that do not exist remotely are
/// returned instead of failing.
async fn retrieve_once(
    driver: &CalcJobProcess,
    computer: &str,
    remote_dir: &str,
    names: &[String],
    local: &Path,
) -> Result<Vec<String>, TransportError> {
    let conn = driver.env.pool.acquire(computer).await?;
    let mut missing = Vec::new();
    for name in names {
        let target = local.join(name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match conn.get(&format!("{remote_dir}/{name}"), &target).await {
            Ok(()) => {}
            Err(TransportError::NotFound(_)) => missing.push(name.clone()),
            Err(e) => return Err(e),
        }
    }
    Ok(missing)
}
