// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PBS Pro adapter (`qsub`, `qstat -f`, `qdel`).

use std::collections::HashMap;
use std::fmt::Write as _;

use super::traits::*;
use crate::transport::CommandOutput;

#[derive(Debug, Default, Clone)]
pub struct PbsScheduler;

impl PbsScheduler {
    pub fn new() -> Self {
        Self
    }
}

fn map_pbs_state(code: &str) -> JobState {
    match code {
        "Q" | "W" | "T" => JobState::Queued,
        "H" => JobState::QueuedHeld,
        "R" | "E" | "B" | "M" => JobState::Running,
        "S" | "U" => JobState::Suspended,
        "F" | "X" => JobState::Done,
        _ => JobState::Undetermined,
    }
}

impl Scheduler for PbsScheduler {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn render_header(&self, job: &JobTemplate) -> Result<String> {
        if job.resources.num_machines == 0 || job.resources.num_mpiprocs_per_machine == 0 {
            return Err(SchedulerError::InvalidTemplate(
                "num_machines and num_mpiprocs_per_machine must be positive".to_string(),
            ));
        }
        // PBS job names are limited to 15 characters
        let name: String = job.job_name.chars().take(15).collect();
        let mut h = String::new();
        let _ = writeln!(h, "#PBS -r n");
        let _ = writeln!(h, "#PBS -N {name}");
        let _ = writeln!(h, "#PBS -o {}", job.stdout_filename);
        let _ = writeln!(h, "#PBS -e {}", job.stderr_filename);
        let _ = writeln!(
            h,
            "#PBS -l select={}:mpiprocs={}",
            job.resources.num_machines, job.resources.num_mpiprocs_per_machine
        );
        if let Some(seconds) = job.max_wallclock_seconds {
            let _ = writeln!(h, "#PBS -l walltime={}", format_walltime(seconds));
        }
        if let Some(queue) = &job.queue_name {
            let _ = writeln!(h, "#PBS -q {queue}");
        }
        if let Some(account) = &job.account {
            let _ = writeln!(h, "#PBS -A {account}");
        }
        // qsub starts jobs in $HOME
        let _ = writeln!(h, "cd \"$PBS_O_WORKDIR\"");
        Ok(h)
    }

    fn render_submit_command(&self, script_filename: &str) -> String {
        format!("qsub {}", escape_for_bash(script_filename))
    }

    fn parse_submit_output(&self, output: &CommandOutput) -> Result<String> {
        if !output.is_success() {
            return Err(SchedulerError::SubmissionRejected {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        let id = output.stdout.trim();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(SchedulerError::Unparsable {
                what: "submit",
                output: output.stdout.clone(),
            });
        }
        Ok(id.to_string())
    }

    fn render_status_query(&self, job_ids: &[String]) -> String {
        let mut cmd = "qstat -f".to_string();
        for id in job_ids {
            let _ = write!(cmd, " {id}");
        }
        cmd
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<HashMap<String, JobInfo>> {
        if !output.is_success() {
            // qstat reports forgotten jobs on stderr but still lists the rest
            let only_unknown = output
                .stderr
                .lines()
                .filter(|l| !l.trim().is_empty())
                .all(|l| l.contains("Unknown Job Id") || l.contains("Job has finished"));
            if !only_unknown {
                return Err(SchedulerError::CommandFailed {
                    what: "status",
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }

        let mut jobs = HashMap::new();
        let mut current: Option<JobInfo> = None;
        for line in output.stdout.lines() {
            if let Some(id) = line.strip_prefix("Job Id:") {
                if let Some(done) = current.take() {
                    jobs.insert(done.job_id.clone(), done);
                }
                current = Some(JobInfo::new(id.trim(), JobState::Undetermined, ""));
                continue;
            }
            let Some(info) = current.as_mut() else {
                continue;
            };
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "job_state" => {
                    info.state = map_pbs_state(value);
                    info.raw_state = value.to_string();
                }
                "Job_Name" => info.title = Some(value.to_string()),
                "resources_used.walltime" => info.wallclock_seconds = parse_walltime(value),
                "Exit_status" => info.exit_code = value.parse().ok(),
                _ => {}
            }
        }
        if let Some(done) = current.take() {
            jobs.insert(done.job_id.clone(), done);
        }
        Ok(jobs)
    }

    fn render_cancel_command(&self, job_id: &str) -> String {
        format!("qdel {job_id}")
    }
}
