//! PostgreSQL adapter for gatehouse storage.
//!
//! This adapter is the transactional source-of-truth backend. Checkpoint
//! compare-and-swap is enforced by the `(instance_id, version)` primary key:
//! two writers racing from the same expected version both try to insert
//! `expected + 1`, and the loser hits a unique violation.

use crate::hash::compute_audit_hash;
use crate::model::{AuditAppend, AuditOutcome, AuditRecord, Checkpoint};
use crate::traits::{AuditSink, CheckpointStore, QueryWindow};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use gatehouse_types::{ActorId, WorkflowInstanceId};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Row};
use uuid::Uuid;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS gatehouse_checkpoints (
                instance_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                state JSONB NOT NULL,
                saved_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gatehouse_audit_records (
                event_id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                timestamp TIMESTAMPTZ NOT NULL,
                instance_id TEXT NOT NULL,
                token_nonce TEXT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                parameters JSONB NOT NULL,
                outcome JSONB NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                usage_units BIGINT NOT NULL,
                previous_hash TEXT,
                hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS gatehouse_audit_records_instance_idx
                ON gatehouse_audit_records (instance_id, sequence)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn current_version(&self, instance_id: &WorkflowInstanceId) -> StorageResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS version FROM gatehouse_checkpoints WHERE instance_id = $1",
        )
        .bind(instance_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        let version: i64 = row
            .try_get("version")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(version as u64)
    }
}

#[async_trait]
impl CheckpointStore for PostgresStorage {
    async fn save(
        &self,
        instance_id: &WorkflowInstanceId,
        state: Value,
        expected_version: u64,
    ) -> StorageResult<u64> {
        let version = expected_version + 1;
        // Insert only when the stored head is exactly `expected_version`.
        let inserted = sqlx::query(
            r#"
            INSERT INTO gatehouse_checkpoints (instance_id, version, state, saved_at)
            SELECT $1, $2, $3, $4
             WHERE (SELECT COALESCE(MAX(version), 0) FROM gatehouse_checkpoints WHERE instance_id = $1) = $5
            "#,
        )
        .bind(instance_id.as_str())
        .bind(to_i64(version)?)
        .bind(state)
        .bind(Utc::now())
        .bind(to_i64(expected_version)?)
        .execute(&self.pool)
        .await;

        let conflict = match inserted {
            Ok(result) => result.rows_affected() == 0,
            Err(err) if is_unique_violation(&err) => true,
            Err(err) => return Err(StorageError::Backend(err.to_string())),
        };

        if conflict {
            let actual = self.current_version(instance_id).await?;
            tracing::debug!(
                instance_id = %instance_id,
                expected = expected_version,
                actual,
                "checkpoint compare-and-swap lost"
            );
            return Err(StorageError::VersionConflict {
                instance_id: instance_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        Ok(version)
    }

    async fn load(&self, instance_id: &WorkflowInstanceId) -> StorageResult<Checkpoint> {
        let row = sqlx::query(
            r#"
            SELECT instance_id, version, state, saved_at
              FROM gatehouse_checkpoints
             WHERE instance_id = $1
             ORDER BY version DESC
             LIMIT 1
            "#,
        )
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(checkpoint_row_to_model)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("instance {instance_id}")))
    }

    async fn history(&self, instance_id: &WorkflowInstanceId) -> StorageResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, version, state, saved_at
              FROM gatehouse_checkpoints
             WHERE instance_id = $1
             ORDER BY version ASC
            "#,
        )
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(checkpoint_row_to_model).collect()
    }

    async fn list_instances(&self) -> StorageResult<Vec<WorkflowInstanceId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT instance_id FROM gatehouse_checkpoints ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("instance_id")
                    .map(WorkflowInstanceId::new)
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for PostgresStorage {
    async fn append(&self, mut event: AuditAppend) -> StorageResult<AuditRecord> {
        event.timestamp = event.timestamp.trunc_subsecs(6);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query("LOCK TABLE gatehouse_audit_records IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let existing = sqlx::query("SELECT 1 FROM gatehouse_audit_records WHERE idempotency_key = $1")
            .bind(event.idempotency_key.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if existing.is_some() {
            return Err(StorageError::Duplicate(event.idempotency_key));
        }

        let last = sqlx::query(
            "SELECT sequence, hash FROM gatehouse_audit_records ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, previous_hash) = if let Some(row) = last {
            let seq: i64 = row
                .try_get("sequence")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let prev: String = row
                .try_get("hash")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            (seq + 1, Some(prev))
        } else {
            (1_i64, None)
        };

        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence as u64)?;
        let event_id = format!("audit-{}", Uuid::new_v4());
        let outcome = serde_json::to_value(&event.outcome)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO gatehouse_audit_records
                (event_id, sequence, timestamp, instance_id, token_nonce, actor, action, parameters, outcome, idempotency_key, usage_units, previous_hash, hash)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event_id.clone())
        .bind(sequence)
        .bind(event.timestamp)
        .bind(event.instance_id.as_str())
        .bind(event.token_nonce.clone())
        .bind(event.actor.as_str())
        .bind(event.action.clone())
        .bind(event.parameters.clone())
        .bind(outcome)
        .bind(event.idempotency_key.clone())
        .bind(to_i64(event.usage_units)?)
        .bind(previous_hash.clone())
        .bind(hash.clone())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_duplicate(e, &event.idempotency_key))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(AuditRecord::from_append(
            event,
            event_id,
            sequence as u64,
            previous_hash,
            hash,
        ))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<AuditRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM gatehouse_audit_records WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(audit_row_to_record).transpose()
    }

    async fn for_instance(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> StorageResult<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM gatehouse_audit_records WHERE instance_id = $1 ORDER BY sequence ASC"
        ))
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn list(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        let rows = if window.limit == 0 {
            sqlx::query(&format!(
                "SELECT {AUDIT_COLUMNS} FROM gatehouse_audit_records ORDER BY sequence DESC OFFSET $1"
            ))
            .bind(to_i64(window.offset as u64)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(&format!(
                "SELECT {AUDIT_COLUMNS} FROM gatehouse_audit_records ORDER BY sequence DESC LIMIT $1 OFFSET $2"
            ))
            .bind(to_i64(window.limit as u64)?)
            .bind(to_i64(window.offset as u64)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn latest_hash(&self) -> StorageResult<Option<String>> {
        let row =
            sqlx::query("SELECT hash FROM gatehouse_audit_records ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|r| r.try_get::<String, _>("hash"))
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

const AUDIT_COLUMNS: &str = "event_id, sequence, timestamp, instance_id, token_nonce, actor, action, parameters, outcome, idempotency_key, usage_units, previous_hash, hash";

fn checkpoint_row_to_model(row: PgRow) -> StorageResult<Checkpoint> {
    let instance_id: String = row
        .try_get("instance_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let state: Value = row
        .try_get("state")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let saved_at: DateTime<Utc> = row
        .try_get("saved_at")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(Checkpoint {
        instance_id: WorkflowInstanceId::new(instance_id),
        version: version as u64,
        state,
        saved_at,
    })
}

fn audit_row_to_record(row: PgRow) -> StorageResult<AuditRecord> {
    let get_err = |e: sqlx::Error| StorageError::Backend(e.to_string());
    let outcome: Value = row.try_get("outcome").map_err(get_err)?;
    let outcome: AuditOutcome = serde_json::from_value(outcome)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let sequence: i64 = row.try_get("sequence").map_err(get_err)?;
    let usage_units: i64 = row.try_get("usage_units").map_err(get_err)?;

    Ok(AuditRecord {
        event_id: row.try_get("event_id").map_err(get_err)?,
        sequence: sequence as u64,
        timestamp: row.try_get("timestamp").map_err(get_err)?,
        instance_id: WorkflowInstanceId::new(
            row.try_get::<String, _>("instance_id").map_err(get_err)?,
        ),
        token_nonce: row.try_get("token_nonce").map_err(get_err)?,
        actor: ActorId::new(row.try_get::<String, _>("actor").map_err(get_err)?),
        action: row.try_get("action").map_err(get_err)?,
        parameters: row.try_get("parameters").map_err(get_err)?,
        outcome,
        idempotency_key: row.try_get("idempotency_key").map_err(get_err)?,
        usage_units: usage_units as u64,
        previous_hash: row.try_get("previous_hash").map_err(get_err)?,
        hash: row.try_get("hash").map_err(get_err)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn map_sqlx_duplicate(err: sqlx::Error, key: &str) -> StorageError {
    if is_unique_violation(&err) {
        return StorageError::Duplicate(key.to_string());
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::InvalidInput("value too large".to_string()))
}
