// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Calculation jobs: processes that run a program on a computer.
//!
//! A calculation walks through `Uploading → Submitting → Scheduled →
//! Retrieving → Parsing → Done` while its process is running. The only
//! suspension is `Scheduled`, where the process waits for the computer's
//! [`JobManager`] to report the job as finished.

mod driver;
pub mod manager;

pub use self::manager::JobManager;
pub(crate) use self::driver::CalcJobProcess;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use calcflow_environment::scheduler::{CodeCommand, JobResources};
use calcflow_environment::{BackoffPolicy, ComputerConfig, JobInfo, JobState, Scheduler, TransportPool};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parser::Parser;
use crate::process::ProcessSpec;

/// Where and how a calculation runs. Supplied with the launch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub computer: String,
    #[serde(default)]
    pub resources: JobResources,
    #[serde(default)]
    pub max_wallclock_seconds: Option<u64>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
}

impl JobOptions {
    pub fn new(computer: impl Into<String>) -> Self {
        Self {
            computer: computer.into(),
            resources: JobResources::default(),
            max_wallclock_seconds: None,
            queue_name: None,
            account: None,
            job_name: None,
        }
    }

    pub fn with_resources(mut self, num_machines: u32, num_mpiprocs_per_machine: u32) -> Self {
        self.resources = JobResources {
            num_machines,
            num_mpiprocs_per_machine,
        };
        self
    }

    pub fn with_wallclock(mut self, seconds: u64) -> Self {
        self.max_wallclock_seconds = Some(seconds);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = Some(queue.into());
        self
    }
}

/// What to upload and run, produced by [`CalcJobLogic::prepare`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalcInfo {
    /// Files written into the working directory, by relative path.
    pub files: Vec<(String, Vec<u8>)>,
    pub commands: Vec<CodeCommand>,
    /// Relative paths copied back once the job is done.
    pub retrieve_list: Vec<String>,
    pub prepend_text: Option<String>,
    pub append_text: Option<String>,
    pub environment: Vec<(String, String)>,
}

impl CalcInfo {
    pub fn file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.into(), contents.into()));
        self
    }

    pub fn command(mut self, command: CodeCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn retrieve(mut self, name: impl Into<String>) -> Self {
        self.retrieve_list.push(name.into());
        self
    }
}

/// A calculation type.
pub trait CalcJobLogic: Send + Sync {
    fn spec(&self) -> Arc<ProcessSpec>;

    /// Registry key of the parser for this calculation's output.
    fn parser(&self) -> &str;

    /// Describe the files and commands of a job for `inputs`.
    fn prepare(&self, inputs: &Value, options: &JobOptions) -> anyhow::Result<CalcInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcStage {
    Uploading,
    Submitting,
    Scheduled,
    Retrieving,
    Parsing,
    Done,
}

impl fmt::Display for CalcStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uploading => "uploading",
            Self::Submitting => "submitting",
            Self::Scheduled => "scheduled",
            Self::Retrieving => "retrieving",
            Self::Parsing => "parsing",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Retries spent per failure class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub transport: u32,
    pub scheduler: u32,
}

/// Calculation part of a process record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcJobState {
    pub computer: String,
    pub stage: CalcStage,
    /// Scheduler job id of the current submission attempt.
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_state: Option<JobState>,
    #[serde(default)]
    pub job_info: Option<JobInfo>,
    #[serde(default)]
    pub remote_workdir: Option<String>,
    #[serde(default)]
    pub retrieve_list: Vec<String>,
    #[serde(default)]
    pub missing_files: Vec<String>,
    #[serde(default)]
    pub retries: RetryCounters,
    #[serde(default)]
    pub submit_attempts: u32,
}

impl CalcJobState {
    pub fn new(computer: impl Into<String>) -> Self {
        Self {
            computer: computer.into(),
            stage: CalcStage::Uploading,
            job_id: None,
            job_state: None,
            job_info: None,
            remote_workdir: None,
            retrieve_list: Vec::new(),
            missing_files: Vec::new(),
            retries: RetryCounters::default(),
            submit_attempts: 0,
        }
    }
}

pub(crate) struct ComputerEnv {
    pub config: ComputerConfig,
    pub scheduler: Arc<dyn Scheduler>,
    pub manager: JobManager,
}

/// Runner services used by calculations.
pub(crate) struct CalcEnv {
    pub pool: Arc<TransportPool>,
    pub computers: HashMap<String, ComputerEnv>,
    pub parsers: HashMap<String, Arc<dyn Parser>>,
    pub backoff: BackoffPolicy,
    pub max_resubmissions: u32,
    /// Local root for sandboxes and retrieved files.
    pub work_dir: PathBuf,
}

impl CalcEnv {
    pub fn computer(&self, name: &str) -> Option<&ComputerEnv> {
        self.computers.get(name)
    }
}
