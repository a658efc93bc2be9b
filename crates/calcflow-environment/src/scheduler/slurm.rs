// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SLURM adapter (`sbatch`, `squeue`, `scancel`).

use std::collections::HashMap;
use std::fmt::Write as _;

use super::traits::*;
use crate::transport::CommandOutput;

/// Output format for squeue: id, compact state, elapsed time, name.
const SQUEUE_FORMAT: &str = "%i|%t|%M|%j";

#[derive(Debug, Default, Clone)]
pub struct SlurmScheduler;

impl SlurmScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// Map a compact squeue state code.
fn map_slurm_state(code: &str) -> JobState {
    match code {
        "PD" | "CF" | "RQ" | "RF" | "RS" => JobState::Queued,
        "RH" | "RD" => JobState::QueuedHeld,
        "R" | "CG" | "SI" | "SO" | "ST" => JobState::Running,
        "S" => JobState::Suspended,
        "CD" | "CA" | "F" | "TO" | "NF" | "PR" | "BF" | "DL" | "OOM" | "RV" | "SE" => {
            JobState::Done
        }
        _ => JobState::Undetermined,
    }
}

impl Scheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn render_header(&self, job: &JobTemplate) -> Result<String> {
        if job.resources.num_machines == 0 || job.resources.num_mpiprocs_per_machine == 0 {
            return Err(SchedulerError::InvalidTemplate(
                "num_machines and num_mpiprocs_per_machine must be positive".to_string(),
            ));
        }
        let mut h = String::new();
        let _ = writeln!(h, "#SBATCH --no-requeue");
        let _ = writeln!(h, "#SBATCH --job-name=\"{}\"", job.job_name);
        let _ = writeln!(h, "#SBATCH --output={}", job.stdout_filename);
        let _ = writeln!(h, "#SBATCH --error={}", job.stderr_filename);
        let _ = writeln!(h, "#SBATCH --nodes={}", job.resources.num_machines);
        let _ = writeln!(
            h,
            "#SBATCH --ntasks-per-node={}",
            job.resources.num_mpiprocs_per_machine
        );
        if let Some(seconds) = job.max_wallclock_seconds {
            let _ = writeln!(h, "#SBATCH --time={}", format_walltime(seconds));
        }
        if let Some(queue) = &job.queue_name {
            let _ = writeln!(h, "#SBATCH --partition={queue}");
        }
        if let Some(account) = &job.account {
            let _ = writeln!(h, "#SBATCH --account={account}");
        }
        Ok(h)
    }

    fn render_submit_command(&self, script_filename: &str) -> String {
        format!("sbatch {}", escape_for_bash(script_filename))
    }

    fn parse_submit_output(&self, output: &CommandOutput) -> Result<String> {
        if !output.is_success() {
            return Err(SchedulerError::SubmissionRejected {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SchedulerError::Unparsable {
                what: "submit",
                output: output.stdout.clone(),
            })
    }

    fn render_status_query(&self, job_ids: &[String]) -> String {
        let mut cmd = format!("squeue --noheader -o '{SQUEUE_FORMAT}'");
        if !job_ids.is_empty() {
            // A single id must still be passed as a list for squeue to accept it
            let _ = write!(cmd, " --jobs={}", job_ids.join(","));
        }
        cmd
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<HashMap<String, JobInfo>> {
        if !output.is_success() {
            // squeue fails instead of printing nothing when asked about
            // jobs it already forgot
            if output.stderr.contains("Invalid job id specified") {
                return Ok(HashMap::new());
            }
            return Err(SchedulerError::CommandFailed {
                what: "status",
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let mut jobs = HashMap::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.trim().splitn(4, '|').collect();
            if fields.len() < 2 {
                return Err(SchedulerError::Unparsable {
                    what: "status",
                    output: line.to_string(),
                });
            }
            let job_id = fields[0].trim();
            let raw = fields[1].trim();
            let mut info = JobInfo::new(job_id, map_slurm_state(raw), raw);
            info.wallclock_seconds = fields.get(2).and_then(|t| parse_walltime(t));
            info.title = fields.get(3).map(|t| t.trim().to_string());
            jobs.insert(job_id.to_string(), info);
        }
        Ok(jobs)
    }

    fn render_cancel_command(&self, job_id: &str) -> String {
        format!("scancel {job_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_contains_resources() {
        let mut job = JobTemplate::new("relax", "/scratch/x");
        job.resources = JobResources {
            num_machines: 2,
            num_mpiprocs_per_machine: 16,
        };
        job.max_wallclock_seconds = Some(1800);
        job.queue_name = Some("debug".into());
        job.commands.push(CodeCommand::new("pw.x"));

        let script = SlurmScheduler::new().render_submit_script(&job).unwrap();
        assert!(script.contains("#SBATCH --job-name=\"relax\"\n"));
        assert!(script.contains("#SBATCH --nodes=2\n"));
        assert!(script.contains("#SBATCH --ntasks-per-node=16\n"));
        assert!(script.contains("#SBATCH --time=00:30:00\n"));
        assert!(script.contains("#SBATCH --partition=debug\n"));
        assert!(!script.contains("--account"));
    }

    #[test]
    fn test_zero_resources_rejected() {
        let mut job = JobTemplate::new("x", "/tmp");
        job.resources.num_machines = 0;
        job.commands.push(CodeCommand::new("true"));
        assert!(SlurmScheduler::new().render_submit_script(&job).is_err());
    }

    #[test]
    fn test_parse_submit_output() {
        let s = SlurmScheduler::new();
        let id = s
            .parse_submit_output(&CommandOutput::success("Submitted batch job 123456\n"))
            .unwrap();
        assert_eq!(id, "123456");

        assert!(matches!(
            s.parse_submit_output(&CommandOutput::success("something else")),
            Err(SchedulerError::Unparsable { .. })
        ));
        assert!(matches!(
            s.parse_submit_output(&CommandOutput::failure(1, "sbatch: error: invalid partition")),
            Err(SchedulerError::SubmissionRejected { .. })
        ));
    }

    #[test]
    fn test_parse_status_output() {
        let out = CommandOutput::success(
            "101|PD|0:00|queued job\n102|R|1-02:03:04|running\n103|CD|5:00|done\n104|XX|0:00|odd\n",
        );
        let jobs = SlurmScheduler::new().parse_status_output(&out).unwrap();

        assert_eq!(jobs["101"].state, JobState::Queued);
        assert_eq!(jobs["101"].title.as_deref(), Some("queued job"));
        assert_eq!(jobs["102"].state, JobState::Running);
        assert_eq!(jobs["102"].wallclock_seconds, Some(93_784));
        assert_eq!(jobs["103"].state, JobState::Done);
        assert_eq!(jobs["104"].state, JobState::Undetermined);
        assert_eq!(jobs["104"].raw_state, "XX");
    }

    #[test]
    fn test_invalid_job_id_means_vanished() {
        let out = CommandOutput::failure(1, "slurm_load_jobs error: Invalid job id specified");
        let jobs = SlurmScheduler::new().parse_status_output(&out).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_other_failures_are_errors() {
        let out = CommandOutput::failure(1, "slurm_load_jobs error: Socket timed out");
        assert!(matches!(
            SlurmScheduler::new().parse_status_output(&out),
            Err(SchedulerError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_status_query() {
        assert_eq!(
            SlurmScheduler::new().render_status_query(&["7".into()]),
            "squeue --noheader -o '%i|%t|%M|%j' --jobs=7"
        );
    }
}
