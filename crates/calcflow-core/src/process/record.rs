// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The serializable process record and its state transitions.
//!
//! Transitions are pure: they validate the current state, append to the
//! transition log and update fields. Persisting the result is the driver's
//! job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::logic::{Awaiting, ResumeValue};
use crate::calcjob::{CalcJobState, JobOptions};
use crate::error::{CoreError, Result};

/// Exit code of a killed process.
pub const EXIT_CODE_KILLED: i32 = -1;

/// Exit code of an excepted process.
pub const EXIT_CODE_EXCEPTED: i32 = -2;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ProcessId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::validation("process_id", e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Calculation,
    Workflow,
}

/// Life-cycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Waiting,
    Finished,
    Excepted,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Excepted | Self::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Excepted => "excepted",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "finished" => Ok(Self::Finished),
            "excepted" => Ok(Self::Excepted),
            "killed" => Ok(Self::Killed),
            other => Err(CoreError::validation(
                "state",
                format!("unknown process state '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ProcessState,
    pub to: ProcessState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Failure class captured in the exit status of an excepted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    TransportError,
    SchedulerError,
    ParsingError,
    ProcessLogicError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransportError => "TransportError",
            Self::SchedulerError => "SchedulerError",
            Self::ParsingError => "ParsingError",
            Self::ProcessLogicError => "ProcessLogicError",
        };
        f.write_str(s)
    }
}

/// Why a process ended up excepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Error source chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Capture an error together with its source chain.
    pub fn from_error(kind: FailureKind, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut context = Vec::new();
        let mut source = error.source();
        while let Some(e) = source {
            context.push(e.to_string());
            source = e.source();
        }
        Self {
            kind,
            message: error.to_string(),
            context,
        }
    }

    pub fn from_anyhow(kind: FailureKind, error: &anyhow::Error) -> Self {
        Self {
            kind,
            message: error.to_string(),
            context: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    pub fn transport(error: &calcflow_environment::TransportError) -> Self {
        Self::from_error(FailureKind::TransportError, error)
    }

    pub fn scheduler(error: &calcflow_environment::SchedulerError) -> Self {
        Self::from_error(FailureKind::SchedulerError, error)
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ProcessLogicError, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl ExitStatus {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: None,
            failure: None,
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    Info,
    Warning,
    Error,
}

/// One line of a process's report log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub at: DateTime<Utc>,
    pub level: ReportLevel,
    pub message: String,
}

/// Everything needed to reconstruct a process in another runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub process_type: String,
    pub kind: ProcessKind,
    pub state: ProcessState,
    pub transitions: Vec<StateTransition>,
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub exit_status: Option<ExitStatus>,
    #[serde(default)]
    pub parent: Option<ProcessId>,
    /// Version of the last persisted checkpoint, 0 before the first one.
    pub version: u64,
    #[serde(default)]
    pub paused: bool,
    /// Free-form state owned by the process logic.
    #[serde(default)]
    pub user_state: Value,
    /// Continuation label the next step resumes at.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub awaiting: Option<Awaiting>,
    /// Value delivered by the last resume, consumed by the next step.
    #[serde(default)]
    pub resume: Option<ResumeValue>,
    #[serde(default)]
    pub children: Vec<ProcessId>,
    #[serde(default)]
    pub options: Option<JobOptions>,
    #[serde(default)]
    pub calc: Option<CalcJobState>,
    #[serde(default)]
    pub provenance_id: Option<String>,
    #[serde(default)]
    pub reports: Vec<ReportEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(
        id: ProcessId,
        process_type: impl Into<String>,
        kind: ProcessKind,
        inputs: Value,
        parent: Option<ProcessId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            process_type: process_type.into(),
            kind,
            state: ProcessState::Created,
            transitions: Vec::new(),
            inputs,
            outputs: None,
            exit_status: None,
            parent,
            version: 0,
            paused: false,
            user_state: Value::Null,
            label: None,
            awaiting: None,
            resume: None,
            children: Vec::new(),
            options: None,
            calc: None,
            provenance_id: None,
            reports: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn invalid(&self, expected: &str) -> CoreError {
        CoreError::InvalidState {
            process_id: self.id.to_string(),
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }

    fn transition(&mut self, to: ProcessState, note: Option<String>) {
        let at = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at,
            note,
        });
        self.state = to;
        self.updated_at = at;
    }

    /// Created → Running.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ProcessState::Created {
            return Err(self.invalid("created"));
        }
        self.transition(ProcessState::Running, None);
        Ok(())
    }

    /// Running → Waiting on `awaiting`.
    pub fn wait(&mut self, awaiting: Awaiting) -> Result<()> {
        if self.state != ProcessState::Running {
            return Err(self.invalid("running"));
        }
        let note = Some(awaiting.describe());
        self.awaiting = Some(awaiting);
        self.transition(ProcessState::Waiting, note);
        Ok(())
    }

    /// Waiting → Running, handing `value` to the next step.
    pub fn resume(&mut self, value: ResumeValue) -> Result<()> {
        if self.state != ProcessState::Waiting {
            return Err(self.invalid("waiting"));
        }
        if let Some(awaiting) = self.awaiting.take() {
            self.label = awaiting.then;
        }
        self.resume = Some(value);
        self.transition(ProcessState::Running, None);
        Ok(())
    }

    /// Running → Finished with `exit_status`.
    pub fn finish(&mut self, outputs: Option<Value>, exit_status: ExitStatus) -> Result<()> {
        if self.state != ProcessState::Running {
            return Err(self.invalid("running"));
        }
        self.outputs = outputs;
        let note = exit_status.message.clone();
        self.exit_status = Some(exit_status);
        self.awaiting = None;
        self.transition(ProcessState::Finished, note);
        Ok(())
    }

    /// Any non-terminal state → Excepted.
    pub fn except(&mut self, failure: Failure) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("non-terminal"));
        }
        let note = Some(failure.to_string());
        self.exit_status = Some(ExitStatus {
            code: EXIT_CODE_EXCEPTED,
            message: Some(failure.message.clone()),
            failure: Some(failure),
        });
        self.awaiting = None;
        self.transition(ProcessState::Excepted, note);
        Ok(())
    }

    /// Any non-terminal state → Killed.
    pub fn kill(&mut self, message: Option<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("non-terminal"));
        }
        self.exit_status = Some(ExitStatus {
            code: EXIT_CODE_KILLED,
            message: message.clone(),
            failure: None,
        });
        self.awaiting = None;
        self.transition(ProcessState::Killed, message);
        Ok(())
    }

    /// Returns false if the process is already terminal.
    pub fn pause(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.paused = true;
        true
    }

    pub fn play(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.paused = false;
        true
    }

    pub fn report(&mut self, level: ReportLevel, message: impl Into<String>) {
        self.reports.push(ReportEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
    }
}
