// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler adapter trait definitions.
//!
//! An adapter translates between abstract job descriptions and states and
//! one batch scheduler's scripts, commands and output formats. Adapters are
//! stateless: they never touch a connection, they only render commands and
//! parse what the caller got back from running them.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::CommandOutput;

/// Errors from scheduler adapters.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum SchedulerError {
    /// The scheduler refused the submission.
    #[error("submission rejected (exit code {exit_code}): {stderr}")]
    SubmissionRejected { exit_code: i32, stderr: String },

    /// Output could not be interpreted.
    #[error("unparsable {what} output: {output}")]
    Unparsable { what: &'static str, output: String },

    /// A status or cancel command failed.
    #[error("{what} command failed (exit code {exit_code}): {stderr}")]
    CommandFailed {
        what: &'static str,
        exit_code: i32,
        stderr: String,
    },

    /// The job description cannot be expressed for this scheduler.
    #[error("invalid job template: {0}")]
    InvalidTemplate(String),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Abstract job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Undetermined,
    Queued,
    QueuedHeld,
    Running,
    Suspended,
    Done,
}

impl JobState {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Undetermined => "undetermined",
            Self::Queued => "queued",
            Self::QueuedHeld => "queued_held",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Scheduler-reported snapshot of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub state: JobState,
    /// State string exactly as the scheduler printed it.
    pub raw_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallclock_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_machines: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>, state: JobState, raw_state: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            raw_state: raw_state.into(),
            title: None,
            wallclock_seconds: None,
            num_machines: None,
            exit_code: None,
        }
    }
}

/// Machine resources requested for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    pub num_machines: u32,
    pub num_mpiprocs_per_machine: u32,
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            num_machines: 1,
            num_mpiprocs_per_machine: 1,
        }
    }
}

/// One command line of a job script.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeCommand {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl CodeCommand {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdout(mut self, file: impl Into<String>) -> Self {
        self.stdout = Some(file.into());
        self
    }

    /// Render as a single shell line with every word quoted.
    pub fn render(&self) -> String {
        let mut line = escape_for_bash(&self.executable);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&escape_for_bash(arg));
        }
        if let Some(stdin) = &self.stdin {
            let _ = write!(line, " < {}", escape_for_bash(stdin));
        }
        if let Some(stdout) = &self.stdout {
            let _ = write!(line, " > {}", escape_for_bash(stdout));
        }
        if let Some(stderr) = &self.stderr {
            let _ = write!(line, " 2> {}", escape_for_bash(stderr));
        }
        line
    }
}

/// Scheduler-independent job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub job_name: String,
    pub working_dir: String,
    pub shebang: String,
    #[serde(default)]
    pub prepend_text: Option<String>,
    #[serde(default)]
    pub append_text: Option<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    #[serde(default)]
    pub resources: JobResources,
    #[serde(default)]
    pub max_wallclock_seconds: Option<u64>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    pub stdout_filename: String,
    pub stderr_filename: String,
    pub commands: Vec<CodeCommand>,
}

/// Default file names used by every adapter.
pub const SUBMIT_SCRIPT_FILENAME: &str = "_submit.sh";
pub const SCHEDULER_STDOUT: &str = "_scheduler-stdout.txt";
pub const SCHEDULER_STDERR: &str = "_scheduler-stderr.txt";

impl JobTemplate {
    pub fn new(job_name: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            working_dir: working_dir.into(),
            shebang: "#!/bin/bash".to_string(),
            prepend_text: None,
            append_text: None,
            environment: Vec::new(),
            resources: JobResources::default(),
            max_wallclock_seconds: None,
            queue_name: None,
            account: None,
            stdout_filename: SCHEDULER_STDOUT.to_string(),
            stderr_filename: SCHEDULER_STDERR.to_string(),
            commands: Vec::new(),
        }
    }
}

/// Quote a word for bash. Plain words are left alone.
pub fn escape_for_bash(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

/// Format seconds as `HH:MM:SS`.
pub fn format_walltime(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Parse `[days-]HH:MM:SS`, `MM:SS` or plain seconds.
pub fn parse_walltime(text: &str) -> Option<u64> {
    let text = text.trim();
    let (days, rest) = match text.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, text),
    };
    let mut total = 0u64;
    for part in rest.split(':') {
        total = total * 60 + part.parse::<u64>().ok()?;
    }
    Some(days * 86_400 + total)
}

/// Contract every batch scheduler adapter satisfies.
pub trait Scheduler: Send + Sync {
    /// Registry name, e.g. "slurm".
    fn name(&self) -> &'static str;

    /// Scheduler directives placed right after the shebang.
    fn render_header(&self, job: &JobTemplate) -> Result<String>;

    /// Full submission script for `job`.
    fn render_submit_script(&self, job: &JobTemplate) -> Result<String> {
        if job.commands.is_empty() {
            return Err(SchedulerError::InvalidTemplate(
                "job has no commands".to_string(),
            ));
        }
        let mut script = String::new();
        let _ = writeln!(script, "{}", job.shebang);
        script.push_str(&self.render_header(job)?);
        script.push('\n');
        for (key, value) in &job.environment {
            let _ = writeln!(script, "export {}={}", key, escape_for_bash(value));
        }
        if let Some(text) = &job.prepend_text {
            let _ = writeln!(script, "{text}");
        }
        script.push('\n');
        for command in &job.commands {
            let _ = writeln!(script, "{}", command.render());
        }
        if let Some(text) = &job.append_text {
            script.push('\n');
            let _ = writeln!(script, "{text}");
        }
        Ok(script)
    }

    /// Command that submits `script_filename` from the job's working directory.
    fn render_submit_command(&self, script_filename: &str) -> String;

    /// Extract the job id from the output of the submit command.
    fn parse_submit_output(&self, output: &CommandOutput) -> Result<String>;

    /// Command that lists the state of `job_ids`.
    fn render_status_query(&self, job_ids: &[String]) -> String;

    /// Parse a status listing. Jobs missing from the map are no longer
    /// known to the scheduler.
    fn parse_status_output(&self, output: &CommandOutput) -> Result<HashMap<String, JobInfo>>;

    fn render_cancel_command(&self, job_id: &str) -> String;

    /// Whether the cancel request was accepted.
    fn parse_cancel_output(&self, output: &CommandOutput) -> Result<bool> {
        Ok(output.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_for_bash() {
        assert_eq!(escape_for_bash("input.txt"), "input.txt");
        assert_eq!(escape_for_bash("a b"), "'a b'");
        assert_eq!(escape_for_bash("it's"), r#"'it'"'"'s'"#);
        assert_eq!(escape_for_bash("$(rm)"), "'$(rm)'");
        assert_eq!(escape_for_bash(""), "''");
    }

    #[test]
    fn test_command_render() {
        let cmd = CodeCommand::new("pw.x")
            .arg("-in")
            .arg("job input.txt")
            .stdout("out.txt");
        assert_eq!(cmd.render(), "pw.x -in 'job input.txt' > out.txt");
    }

    #[test]
    fn test_walltime_formats() {
        assert_eq!(format_walltime(3725), "01:02:05");
        assert_eq!(parse_walltime("01:02:05"), Some(3725));
        assert_eq!(parse_walltime("1-00:00:10"), Some(86_410));
        assert_eq!(parse_walltime("5:07"), Some(307));
        assert_eq!(parse_walltime("n/a"), None);
    }
}
