use crate::model::{AuditAppend, AuditRecord, Checkpoint};
use crate::StorageResult;
use async_trait::async_trait;
use gatehouse_types::WorkflowInstanceId;
use serde_json::Value;

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Versioned persistence of workflow instance state.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store `state` as the next version.
    ///
    /// `expected_version` is the version the caller loaded, or 0 for an
    /// instance with no checkpoint yet. Returns the new version, or
    /// `VersionConflict` if another writer got there first.
    async fn save(
        &self,
        instance_id: &WorkflowInstanceId,
        state: Value,
        expected_version: u64,
    ) -> StorageResult<u64>;

    /// Highest stored version.
    async fn load(&self, instance_id: &WorkflowInstanceId) -> StorageResult<Checkpoint>;

    /// Every stored version, oldest first.
    async fn history(&self, instance_id: &WorkflowInstanceId) -> StorageResult<Vec<Checkpoint>>;

    async fn list_instances(&self) -> StorageResult<Vec<WorkflowInstanceId>>;
}

/// Append-only audit of state-changing actions.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an event and return the canonical, hash-linked stored record.
    ///
    /// Fails with `Duplicate` if a record already exists for the event's
    /// idempotency key.
    async fn append(&self, event: AuditAppend) -> StorageResult<AuditRecord>;

    async fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<AuditRecord>>;

    /// Records for one instance, oldest first.
    async fn for_instance(&self, instance_id: &WorkflowInstanceId)
        -> StorageResult<Vec<AuditRecord>>;

    /// Read records newest-first.
    async fn list(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>>;

    /// Get the latest audit hash anchor.
    async fn latest_hash(&self) -> StorageResult<Option<String>>;
}

/// Composite storage contract for one backend serving both concerns.
pub trait GatehouseStorage: CheckpointStore + AuditSink {}

impl<T> GatehouseStorage for T where T: CheckpointStore + AuditSink {}
