//! In-memory reference implementation of the gatehouse storage traits.
//!
//! This adapter is deterministic and test-friendly. Production deployments
//! should use a transactional backend (e.g. PostgreSQL) so checkpoints
//! survive a restart.

use crate::hash::compute_audit_hash;
use crate::model::{AuditAppend, AuditRecord, Checkpoint};
use crate::traits::{AuditSink, CheckpointStore, QueryWindow};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use gatehouse_types::WorkflowInstanceId;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory gatehouse storage adapter.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: RwLock<BTreeMap<WorkflowInstanceId, Vec<Checkpoint>>>,
    audits: RwLock<AuditLog>,
}

#[derive(Default)]
struct AuditLog {
    records: Vec<AuditRecord>,
    by_key: HashMap<String, usize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn save(
        &self,
        instance_id: &WorkflowInstanceId,
        state: Value,
        expected_version: u64,
    ) -> StorageResult<u64> {
        let mut guard = self
            .checkpoints
            .write()
            .map_err(|_| StorageError::Backend("checkpoint lock poisoned".to_string()))?;

        let versions = guard.entry(instance_id.clone()).or_default();
        let current = versions.last().map(|c| c.version).unwrap_or(0);
        if current != expected_version {
            return Err(StorageError::VersionConflict {
                instance_id: instance_id.clone(),
                expected: expected_version,
                actual: current,
            });
        }

        let version = current + 1;
        versions.push(Checkpoint {
            instance_id: instance_id.clone(),
            version,
            state,
            saved_at: Utc::now(),
        });
        tracing::trace!(instance_id = %instance_id, version, "checkpoint stored");
        Ok(version)
    }

    async fn load(&self, instance_id: &WorkflowInstanceId) -> StorageResult<Checkpoint> {
        let guard = self
            .checkpoints
            .read()
            .map_err(|_| StorageError::Backend("checkpoint lock poisoned".to_string()))?;
        guard
            .get(instance_id)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("instance {instance_id}")))
    }

    async fn history(&self, instance_id: &WorkflowInstanceId) -> StorageResult<Vec<Checkpoint>> {
        let guard = self
            .checkpoints
            .read()
            .map_err(|_| StorageError::Backend("checkpoint lock poisoned".to_string()))?;
        Ok(guard.get(instance_id).cloned().unwrap_or_default())
    }

    async fn list_instances(&self) -> StorageResult<Vec<WorkflowInstanceId>> {
        let guard = self
            .checkpoints
            .read()
            .map_err(|_| StorageError::Backend("checkpoint lock poisoned".to_string()))?;
        Ok(guard
            .iter()
            .filter(|(_, versions)| !versions.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[async_trait]
impl AuditSink for InMemoryStorage {
    async fn append(&self, mut event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut guard = self
            .audits
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;

        if guard.by_key.contains_key(&event.idempotency_key) {
            return Err(StorageError::Duplicate(event.idempotency_key));
        }

        // Same precision as the PostgreSQL adapter so chains verify alike.
        event.timestamp = event.timestamp.trunc_subsecs(6);
        let previous_hash = guard.records.last().map(|e| e.hash.clone());
        let sequence = guard.records.len() as u64 + 1;
        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence)?;

        let key = event.idempotency_key.clone();
        let record = AuditRecord::from_append(
            event,
            format!("audit-{}", Uuid::new_v4()),
            sequence,
            previous_hash,
            hash,
        );

        let index = guard.records.len();
        guard.records.push(record.clone());
        guard.by_key.insert(key, index);
        Ok(record)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard
            .by_key
            .get(key)
            .and_then(|&index| guard.records.get(index))
            .cloned())
    }

    async fn for_instance(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> StorageResult<Vec<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard
            .records
            .iter()
            .filter(|r| &r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        let mut values = guard.records.clone();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }

    async fn latest_hash(&self) -> StorageResult<Option<String>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard.records.last().map(|e| e.hash.clone()))
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
