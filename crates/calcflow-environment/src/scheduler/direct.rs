// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direct execution: the job is a background shell process and its PID is
//! the job id. The job is done when the process is gone.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::traits::*;
use crate::transport::CommandOutput;

#[derive(Debug, Default, Clone)]
pub struct DirectScheduler;

impl DirectScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// Map the first letter of a `ps` STAT column.
fn map_ps_state(stat: &str) -> JobState {
    match stat.chars().next() {
        Some('R' | 'S' | 'D' | 'I' | 'W') => JobState::Running,
        Some('T' | 't') => JobState::Suspended,
        Some('Z' | 'X') => JobState::Done,
        _ => JobState::Undetermined,
    }
}

impl Scheduler for DirectScheduler {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn render_header(&self, job: &JobTemplate) -> Result<String> {
        let mut header = String::new();
        let _ = writeln!(header, "exec > {}", escape_for_bash(&job.stdout_filename));
        let _ = writeln!(header, "exec 2> {}", escape_for_bash(&job.stderr_filename));
        if let Some(seconds) = job.max_wallclock_seconds {
            // ulimit takes CPU seconds; closest portable bound
            let _ = writeln!(header, "ulimit -t {seconds}");
        }
        Ok(header)
    }

    fn render_submit_command(&self, script_filename: &str) -> String {
        format!(
            "bash -e {} > /dev/null 2>&1 & echo $!",
            escape_for_bash(script_filename)
        )
    }

    fn parse_submit_output(&self, output: &CommandOutput) -> Result<String> {
        if !output.is_success() {
            return Err(SchedulerError::SubmissionRejected {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        let pid = output.stdout.trim();
        if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
            return Err(SchedulerError::Unparsable {
                what: "submit",
                output: output.stdout.clone(),
            });
        }
        Ok(pid.to_string())
    }

    fn render_status_query(&self, job_ids: &[String]) -> String {
        format!("ps -o pid= -o stat= -p {}", job_ids.join(","))
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<HashMap<String, JobInfo>> {
        // ps exits 1 when none of the PIDs exist
        if !output.is_success() && (output.exit_code != 1 || !output.stdout.trim().is_empty()) {
            return Err(SchedulerError::CommandFailed {
                what: "status",
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let mut jobs = HashMap::new();
        for line in output.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(pid), Some(stat)) = (fields.next(), fields.next()) else {
                continue;
            };
            if !pid.chars().all(|c| c.is_ascii_digit()) {
                // header line from a ps that ignores `pid=`
                continue;
            }
            jobs.insert(
                pid.to_string(),
                JobInfo::new(pid, map_ps_state(stat), stat),
            );
        }
        Ok(jobs)
    }

    fn render_cancel_command(&self, job_id: &str) -> String {
        format!("kill {job_id}")
    }
}
