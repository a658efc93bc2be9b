// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provenance records.
//!
//! The runner creates one record per process when it is submitted and
//! finalizes it at the terminal transition. Nothing else is written.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::process::{ExitStatus, ProcessKind, ProcessSpec};

/// Store for the provenance graph of processes.
#[async_trait]
pub trait Provenance: Send + Sync {
    /// Create the record of a new process and return its id.
    async fn create_record(
        &self,
        kind: ProcessKind,
        spec: &ProcessSpec,
        inputs: &Value,
    ) -> Result<String>;

    async fn attach_output(&self, record_id: &str, outputs: &Value) -> Result<()>;

    async fn finalize(&self, record_id: &str, exit_status: &ExitStatus) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub kind: ProcessKind,
    pub process_type: String,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub exit_status: Option<ExitStatus>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// In-memory [`Provenance`].
#[derive(Debug, Clone, Default)]
pub struct MemoryProvenance {
    records: Arc<Mutex<HashMap<String, ProvenanceRecord>>>,
}

impl MemoryProvenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, record_id: &str) -> Option<ProvenanceRecord> {
        self.records.lock().await.get(record_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl Provenance for MemoryProvenance {
    async fn create_record(
        &self,
        kind: ProcessKind,
        spec: &ProcessSpec,
        inputs: &Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.records.lock().await.insert(
            id.clone(),
            ProvenanceRecord {
                kind,
                process_type: spec.name.clone(),
                inputs: inputs.clone(),
                outputs: None,
                exit_status: None,
                created_at: Utc::now(),
                finalized_at: None,
            },
        );
        Ok(id)
    }

    async fn attach_output(&self, record_id: &str, outputs: &Value) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| CoreError::not_found(record_id))?;
        record.outputs = Some(outputs.clone());
        Ok(())
    }

    async fn finalize(&self, record_id: &str, exit_status: &ExitStatus) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| CoreError::not_found(record_id))?;
        if record.finalized_at.is_some() {
            return Err(CoreError::InvalidState {
                process_id: record_id.to_string(),
                expected: "open record".to_string(),
                actual: "finalized".to_string(),
            });
        }
        record.exit_status = Some(exit_status.clone());
        record.finalized_at = Some(Utc::now());
        Ok(())
    }
}
