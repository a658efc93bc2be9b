// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint storage.
//!
//! The store is the sole durable owner of process state. Every committed
//! transition appends a new [`Bundle`] at a strictly increasing version; a
//! writer that loses the race for a version gets
//! [`CoreError::VersionConflict`] and must give the process up.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryCheckpointStore;
pub use self::sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::process::{ProcessId, ProcessRecord, ProcessState};

/// Serializable snapshot of a process, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub process: ProcessRecord,
    /// Runner that owns the live state machine, `None` when released.
    pub owner: Option<String>,
    /// Consecutive failed attempts to resume this process.
    #[serde(default)]
    pub resume_failures: u32,
    pub saved_at: DateTime<Utc>,
}

impl Bundle {
    pub fn new(process: ProcessRecord, owner: Option<String>) -> Self {
        Self {
            process,
            owner,
            resume_failures: 0,
            saved_at: Utc::now(),
        }
    }

    pub fn version(&self) -> u64 {
        self.process.version
    }

    pub fn summary(&self) -> BundleSummary {
        BundleSummary {
            process_id: self.process.id,
            process_type: self.process.process_type.clone(),
            state: self.process.state,
            version: self.process.version,
            owner: self.owner.clone(),
            parent: self.process.parent,
            saved_at: self.saved_at,
        }
    }
}

/// Latest checkpoint of a process, without the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSummary {
    pub process_id: ProcessId,
    pub process_type: String,
    pub state: ProcessState,
    pub version: u64,
    pub owner: Option<String>,
    pub parent: Option<ProcessId>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OwnerFilter {
    #[default]
    Any,
    /// Processes owned by the given runner or by nobody.
    OwnedByOrUnowned(String),
}

/// Filter for [`CheckpointStore::list`]. Results are ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    /// Skip processes whose latest state is terminal.
    pub active_only: bool,
    pub process_type: Option<String>,
    pub parent: Option<ProcessId>,
    pub owner: OwnerFilter,
    pub limit: Option<usize>,
}

impl ProcessFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, process_type: impl Into<String>) -> Self {
        self.process_type = Some(process_type.into());
        self
    }

    pub fn with_parent(mut self, parent: ProcessId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn owned_by_or_unowned(mut self, runner_id: impl Into<String>) -> Self {
        self.owner = OwnerFilter::OwnedByOrUnowned(runner_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, summary: &BundleSummary) -> bool {
        if self.active_only && summary.state.is_terminal() {
            return false;
        }
        if let Some(t) = &self.process_type
            && &summary.process_type != t
        {
            return false;
        }
        if let Some(p) = &self.parent
            && summary.parent.as_ref() != Some(p)
        {
            return false;
        }
        match &self.owner {
            OwnerFilter::Any => true,
            OwnerFilter::OwnedByOrUnowned(runner) => summary
                .owner
                .as_ref()
                .is_none_or(|owner| owner == runner),
        }
    }
}

/// Durable checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append `bundle` as `version` of `process_id`.
    ///
    /// Fails with [`CoreError::VersionConflict`] if a version greater than or
    /// equal to `version` is already stored.
    async fn save(
        &self,
        process_id: &ProcessId,
        version: u64,
        bundle: &Bundle,
    ) -> Result<(), CoreError>;

    /// Latest bundle of a process.
    async fn load(&self, process_id: &ProcessId) -> Result<Bundle, CoreError>;

    /// Summaries of the latest bundle of each matching process.
    async fn list(&self, filter: &ProcessFilter) -> Result<Vec<BundleSummary>, CoreError>;

    /// All stored versions of a process, ascending.
    async fn history(&self, process_id: &ProcessId) -> Result<Vec<u64>, CoreError>;

    /// Delete all but the newest `keep` versions of a process and return
    /// how many were removed. `keep` is at least one.
    async fn prune(&self, process_id: &ProcessId, keep: usize) -> Result<u64, CoreError>;
}

pub(crate) fn check_version(
    process_id: &ProcessId,
    version: u64,
    bundle: &Bundle,
) -> Result<(), CoreError> {
    if bundle.process.id != *process_id || bundle.version() != version {
        return Err(CoreError::validation(
            "version",
            format!(
                "bundle of {} at version {} saved as {} version {}",
                bundle.process.id,
                bundle.version(),
                process_id,
                version
            ),
        ));
    }
    Ok(())
}
