// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status views returned by the `status` RPC and the runner API.

use calcflow_environment::{JobInfo, JobState};
use serde::{Deserialize, Serialize};

use crate::calcjob::{CalcStage, RetryCounters};
use crate::process::{ExitStatus, ProcessId, ProcessKind, ProcessRecord, ProcessState, ReportEntry};

/// Calculation part of a [`ProcessStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcStatus {
    pub computer: String,
    pub stage: CalcStage,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_state: Option<JobState>,
    /// Latest scheduler report while the job is active.
    #[serde(default)]
    pub job_info: Option<JobInfo>,
    #[serde(default)]
    pub retries: RetryCounters,
}

/// Snapshot of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub id: ProcessId,
    pub process_type: String,
    pub kind: ProcessKind,
    pub state: ProcessState,
    pub paused: bool,
    #[serde(default)]
    pub label: Option<String>,
    /// Human readable description of the wait, if waiting.
    #[serde(default)]
    pub waiting_on: Option<String>,
    #[serde(default)]
    pub calc: Option<CalcStatus>,
    #[serde(default)]
    pub exit_status: Option<ExitStatus>,
    #[serde(default)]
    pub children: Vec<ProcessId>,
    #[serde(default)]
    pub reports: Vec<ReportEntry>,
    pub version: u64,
    /// Whether the status came from a live process rather than its last
    /// checkpoint.
    #[serde(default)]
    pub live: bool,
}

impl ProcessStatus {
    pub fn from_record(record: &ProcessRecord, live: bool) -> Self {
        Self {
            id: record.id,
            process_type: record.process_type.clone(),
            kind: record.kind,
            state: record.state,
            paused: record.paused,
            label: record.label.clone(),
            waiting_on: record.awaiting.as_ref().map(|a| a.describe()),
            calc: record.calc.as_ref().map(|calc| CalcStatus {
                computer: calc.computer.clone(),
                stage: calc.stage,
                job_id: calc.job_id.clone(),
                job_state: calc.job_state,
                job_info: calc.job_info.clone(),
                retries: calc.retries,
            }),
            exit_status: record.exit_status.clone(),
            children: record.children.clone(),
            reports: record.reports.clone(),
            version: record.version,
            live,
        }
    }
}

/// A process status with the statuses of its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNode {
    pub status: ProcessStatus,
    #[serde(default)]
    pub children: Vec<StatusNode>,
}

impl StatusNode {
    /// Number of processes in the tree, including this one.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(StatusNode::count).sum::<usize>()
    }

    /// Depth-first search by id.
    pub fn find(&self, id: &ProcessId) -> Option<&StatusNode> {
        if &self.status.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcjob::CalcJobState;
    use serde_json::json;

    #[test]
    fn test_status_from_calc_record() {
        let mut record = ProcessRecord::new(
            ProcessId::new(),
            "double",
            ProcessKind::Calculation,
            json!({"x": 1}),
            None,
        );
        let mut calc = CalcJobState::new("local");
        calc.job_id = Some("42".into());
        record.calc = Some(calc);
        record.version = 3;

        let status = ProcessStatus::from_record(&record, true);
        assert_eq!(status.state, ProcessState::Created);
        assert_eq!(status.version, 3);
        let calc = status.calc.unwrap();
        assert_eq!(calc.stage, CalcStage::Uploading);
        assert_eq!(calc.job_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_status_tree_find() {
        let root_record = ProcessRecord::new(ProcessId::new(), "wf", ProcessKind::Workflow, json!({}), None);
        let child_record = ProcessRecord::new(
            ProcessId::new(),
            "calc",
            ProcessKind::Calculation,
            json!({}),
            Some(root_record.id),
        );
        let tree = StatusNode {
            status: ProcessStatus::from_record(&root_record, false),
            children: vec![StatusNode {
                status: ProcessStatus::from_record(&child_record, false),
                children: Vec::new(),
            }],
        };

        assert_eq!(tree.count(), 2);
        assert_eq!(tree.find(&child_record.id).unwrap().status.process_type, "calc");
        assert!(tree.find(&ProcessId::new()).is_none());
    }
}
