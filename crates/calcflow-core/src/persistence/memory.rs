// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory checkpoint store for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Bundle, BundleSummary, CheckpointStore, ProcessFilter, check_version};
use crate::error::CoreError;
use crate::process::ProcessId;

/// Keeps the version history of every process until pruned.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    bundles: Arc<RwLock<HashMap<ProcessId, Vec<Bundle>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored bundle of a process, oldest first.
    pub async fn bundles(&self, process_id: &ProcessId) -> Vec<Bundle> {
        self.bundles
            .read()
            .await
            .get(process_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        process_id: &ProcessId,
        version: u64,
        bundle: &Bundle,
    ) -> Result<(), CoreError> {
        check_version(process_id, version, bundle)?;
        let mut bundles = self.bundles.write().await;
        let history = bundles.entry(*process_id).or_default();
        if let Some(latest) = history.last()
            && latest.version() >= version
        {
            return Err(CoreError::VersionConflict {
                process_id: process_id.to_string(),
                version,
            });
        }
        history.push(bundle.clone());
        Ok(())
    }

    async fn load(&self, process_id: &ProcessId) -> Result<Bundle, CoreError> {
        self.bundles
            .read()
            .await
            .get(process_id)
            .and_then(|h| h.last().cloned())
            .ok_or_else(|| CoreError::not_found(process_id))
    }

    async fn list(&self, filter: &ProcessFilter) -> Result<Vec<BundleSummary>, CoreError> {
        let bundles = self.bundles.read().await;
        let mut summaries: Vec<_> = bundles
            .values()
            .filter_map(|h| h.last())
            .map(Bundle::summary)
            .filter(|s| filter.matches(s))
            .collect();
        summaries.sort_by(|a, b| {
            a.saved_at
                .cmp(&b.saved_at)
                .then_with(|| a.process_id.cmp(&b.process_id))
        });
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    async fn history(&self, process_id: &ProcessId) -> Result<Vec<u64>, CoreError> {
        Ok(self
            .bundles
            .read()
            .await
            .get(process_id)
            .map(|h| h.iter().map(Bundle::version).collect())
            .unwrap_or_default())
    }

    async fn prune(&self, process_id: &ProcessId, keep: usize) -> Result<u64, CoreError> {
        let mut bundles = self.bundles.write().await;
        let Some(history) = bundles.get_mut(process_id) else {
            return Ok(0);
        };
        let excess = history.len().saturating_sub(keep.max(1));
        history.drain(..excess);
        Ok(excess as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessKind, ProcessRecord};
    use serde_json::json;

    fn bundle_at(record: &ProcessRecord, version: u64) -> Bundle {
        let mut process = record.clone();
        process.version = version;
        Bundle::new(process, Some("runner-a".into()))
    }

    #[tokio::test]
    async fn test_save_rejects_stale_versions() {
        let store = MemoryCheckpointStore::new();
        let record = ProcessRecord::new(
            ProcessId::new(),
            "demo",
            ProcessKind::Workflow,
            json!({}),
            None,
        );

        store.save(&record.id, 1, &bundle_at(&record, 1)).await.unwrap();
        store.save(&record.id, 2, &bundle_at(&record, 2)).await.unwrap();

        let err = store
            .save(&record.id, 2, &bundle_at(&record, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::VersionConflict { version: 2, .. }));
        assert!(store.save(&record.id, 1, &bundle_at(&record, 1)).await.is_err());

        assert_eq!(store.history(&record.id).await.unwrap(), vec![1, 2]);
        assert_eq!(store.load(&record.id).await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_save_rejects_mismatched_version() {
        let store = MemoryCheckpointStore::new();
        let record = ProcessRecord::new(
            ProcessId::new(),
            "demo",
            ProcessKind::Workflow,
            json!({}),
            None,
        );
        let err = store
            .save(&record.id, 3, &bundle_at(&record, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_versions() {
        let store = MemoryCheckpointStore::new();
        let record = ProcessRecord::new(
            ProcessId::new(),
            "demo",
            ProcessKind::Workflow,
            json!({}),
            None,
        );
        for version in 1..=4 {
            store
                .save(&record.id, version, &bundle_at(&record, version))
                .await
                .unwrap();
        }

        assert_eq!(store.prune(&record.id, 1).await.unwrap(), 3);
        assert_eq!(store.history(&record.id).await.unwrap(), vec![4]);
        assert_eq!(store.prune(&record.id, 1).await.unwrap(), 0);
        assert_eq!(store.prune(&ProcessId::new(), 1).await.unwrap(), 0);
        assert!(store.save(&record.id, 3, &bundle_at(&record, 3)).await.is_err());
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = MemoryCheckpointStore::new();
        let err = store.load(&ProcessId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::ProcessNotFound { .. }));
    }
}
