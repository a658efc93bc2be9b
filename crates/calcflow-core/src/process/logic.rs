// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process logic contract.
//!
//! A process is driven one step at a time. Instead of suspending a
//! coroutine, a step returns [`Step::Await`] naming what it waits for and the
//! label to continue at. Both are stored in the checkpoint, so a process can
//! be resumed by any runner.

use std::sync::Arc;

use async_trait::async_trait;
use calcflow_environment::JobInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{
    ExitStatus, Failure, ProcessId, ProcessKind, ProcessRecord, ProcessState, ReportLevel,
};
use super::spec::ProcessSpec;
use crate::calcjob::{CalcJobState, JobOptions};

/// A sub-process to launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub process_type: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JobOptions>,
    /// Name the parent uses to find this child's outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ChildRequest {
    pub fn new(process_type: impl Into<String>, inputs: Value) -> Self {
        Self {
            process_type: process_type.into(),
            inputs,
            options: None,
            key: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// What a step waits for.
#[derive(Debug, Clone, PartialEq)]
pub enum Awaitable {
    /// Launch sub-processes and wait until all of them are terminal.
    Children(Vec<ChildRequest>),
    /// Wake at an absolute time.
    Timer { wake_at: DateTime<Utc> },
    /// Wait for an external value delivered through `continue`.
    Signal { name: String },
    /// Wait for the scheduler to report a job as finished.
    JobUpdate { computer: String, job_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChild {
    pub id: ProcessId,
    pub request: ChildRequest,
}

/// Persisted form of an [`Awaitable`]; children already have their ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum Waiter {
    Children { children: Vec<PendingChild> },
    Timer { wake_at: DateTime<Utc> },
    Signal { name: String },
    JobUpdate { computer: String, job_id: String },
}

/// The continuation of a waiting process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Awaiting {
    pub on: Waiter,
    /// Label the next step continues at.
    #[serde(default)]
    pub then: Option<String>,
}

impl Awaiting {
    pub fn describe(&self) -> String {
        match &self.on {
            Waiter::Children { children } => format!("waiting on {} children", children.len()),
            Waiter::Timer { wake_at } => format!("sleeping until {}", wake_at.to_rfc3339()),
            Waiter::Signal { name } => format!("waiting for signal '{name}'"),
            Waiter::JobUpdate { computer, job_id } => {
                format!("waiting for job {job_id} on {computer}")
            }
        }
    }
}

/// Final state of an awaited child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub id: ProcessId,
    #[serde(default)]
    pub key: Option<String>,
    pub state: ProcessState,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub exit_status: Option<ExitStatus>,
}

impl ChildOutcome {
    pub fn is_success(&self) -> bool {
        self.state == ProcessState::Finished
            && self.exit_status.as_ref().is_some_and(ExitStatus::is_success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Reported done, or gone from the listing (`info` is then `None`).
    Done { info: Option<JobInfo> },
    /// Status polling gave up.
    Failed { failure: Failure },
}

/// Value handed to the step that follows a wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResumeValue {
    Children(Vec<ChildOutcome>),
    Timer,
    Signal(Value),
    Job(JobOutcome),
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Stay running and call `step` again.
    Continue,
    Await {
        on: Awaitable,
        then: Option<String>,
    },
    Finish {
        outputs: Value,
    },
    /// Finish with a non-zero exit code.
    Fail {
        exit_code: i32,
        message: String,
        outputs: Option<Value>,
    },
}

impl Step {
    pub fn await_children(children: Vec<ChildRequest>, then: impl Into<String>) -> Self {
        Self::Await {
            on: Awaitable::Children(children),
            then: Some(then.into()),
        }
    }

    pub fn await_signal(name: impl Into<String>, then: impl Into<String>) -> Self {
        Self::Await {
            on: Awaitable::Signal { name: name.into() },
            then: Some(then.into()),
        }
    }

    pub fn sleep_until(wake_at: DateTime<Utc>, then: impl Into<String>) -> Self {
        Self::Await {
            on: Awaitable::Timer { wake_at },
            then: Some(then.into()),
        }
    }

    pub fn finish(outputs: Value) -> Self {
        Self::Finish { outputs }
    }

    pub fn fail(exit_code: i32, message: impl Into<String>) -> Self {
        Self::Fail {
            exit_code,
            message: message.into(),
            outputs: None,
        }
    }
}

/// View of the process a step works on.
///
/// Changes made through the context become durable with the next
/// checkpoint.
pub struct StepContext<'a> {
    record: &'a mut ProcessRecord,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(record: &'a mut ProcessRecord) -> Self {
        Self { record }
    }

    pub fn process_id(&self) -> ProcessId {
        self.record.id
    }

    pub fn kind(&self) -> ProcessKind {
        self.record.kind
    }

    pub fn inputs(&self) -> &Value {
        &self.record.inputs
    }

    pub fn state(&self) -> &Value {
        &self.record.user_state
    }

    pub fn state_mut(&mut self) -> &mut Value {
        &mut self.record.user_state
    }

    /// Continuation label of this step, `None` on the first step.
    pub fn label(&self) -> Option<&str> {
        self.record.label.as_deref()
    }

    /// Set the label the next `Continue` step runs at.
    pub fn goto(&mut self, label: impl Into<String>) {
        self.record.label = Some(label.into());
    }

    /// Take the value delivered by the last wait.
    pub fn take_resume(&mut self) -> Option<ResumeValue> {
        self.record.resume.take()
    }

    pub fn children(&self) -> &[ProcessId] {
        &self.record.children
    }

    pub fn report(&mut self, message: impl Into<String>) {
        self.record.report(ReportLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record.report(ReportLevel::Warning, message);
    }

    pub fn options(&self) -> Option<&JobOptions> {
        self.record.options.as_ref()
    }

    pub(crate) fn calc(&self) -> Option<&CalcJobState> {
        self.record.calc.as_ref()
    }

    pub(crate) fn calc_mut(&mut self) -> Option<&mut CalcJobState> {
        self.record.calc.as_mut()
    }
}

/// Behavior of a process type.
#[async_trait]
pub trait ProcessLogic: Send + Sync {
    fn spec(&self) -> Arc<ProcessSpec>;

    fn kind(&self) -> ProcessKind {
        ProcessKind::Workflow
    }

    /// Run until the next suspension point or the end of the process.
    ///
    /// Errors and panics except the process with a `ProcessLogicError`,
    /// unless the error is a [`Failure`], which is recorded as is.
    async fn step(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Step>;

    /// Called once before a kill is committed.
    async fn on_kill(&self, _ctx: &mut StepContext<'_>) {}
}
