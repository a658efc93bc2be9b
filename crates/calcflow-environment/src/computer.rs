// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Computer definitions: which transport and scheduler reach a host.

use serde::{Deserialize, Serialize};

fn default_max_connections() -> usize {
    4
}

/// An execution host as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerConfig {
    /// Unique name used by launch requests.
    pub name: String,
    pub hostname: String,
    /// Transport registry key, e.g. "local".
    pub transport: String,
    /// Scheduler registry key, e.g. "slurm".
    pub scheduler: String,
    /// Root under which job working directories are created.
    pub work_dir: String,
    /// Maximum concurrent connections to this host.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ComputerConfig {
    pub fn new(
        name: impl Into<String>,
        transport: impl Into<String>,
        scheduler: impl Into<String>,
        work_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            hostname: "localhost".to_string(),
            transport: transport.into(),
            scheduler: scheduler.into(),
            work_dir: work_dir.into(),
            max_connections: default_max_connections(),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Working directory of a job, sharded to keep directories small:
    /// `<work_dir>/ab/cd/efgh...`.
    pub fn job_workdir(&self, job_key: &str) -> String {
        let root = self.work_dir.trim_end_matches('/');
        if job_key.len() <= 4 {
            return format!("{root}/{job_key}");
        }
        format!(
            "{root}/{}/{}/{}",
            &job_key[..2],
            &job_key[2..4],
            &job_key[4..]
        )
    }
}
