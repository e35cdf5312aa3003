use chrono::{DateTime, Utc};
use gatehouse_types::{ActorId, WorkflowInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stored version of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: WorkflowInstanceId,
    /// Starts at 1 and increases by one per save
    pub version: u64,
    /// Serialized `WorkflowInstance`
    pub state: Value,
    pub saved_at: DateTime<Utc>,
}

/// What happened when the action reached the governance backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
    },
    Failed {
        reason: String,
    },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Succeeded { .. })
    }
}

/// Input for appending an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub timestamp: DateTime<Utc>,
    pub instance_id: WorkflowInstanceId,
    /// Nonce of the confirmation that authorized the action
    pub token_nonce: Option<String>,
    pub actor: ActorId,
    pub action: String,
    pub parameters: Value,
    pub outcome: AuditOutcome,
    pub idempotency_key: String,
    /// Usage units charged to the instance when the record was written
    pub usage_units: u64,
}

/// Persistent tamper-evident audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub instance_id: WorkflowInstanceId,
    pub token_nonce: Option<String>,
    pub actor: ActorId,
    pub action: String,
    pub parameters: Value,
    pub outcome: AuditOutcome,
    pub idempotency_key: String,
    pub usage_units: u64,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl AuditRecord {
    pub(crate) fn from_append(
        event: AuditAppend,
        event_id: String,
        sequence: u64,
        previous_hash: Option<String>,
        hash: String,
    ) -> Self {
        Self {
            event_id,
            sequence,
            timestamp: event.timestamp,
            instance_id: event.instance_id,
            token_nonce: event.token_nonce,
            actor: event.actor,
            action: event.action,
            parameters: event.parameters,
            outcome: event.outcome,
            idempotency_key: event.idempotency_key,
            usage_units: event.usage_units,
            previous_hash,
            hash,
        }
    }

    /// The append input this record was created from.
    pub fn to_append(&self) -> AuditAppend {
        AuditAppend {
            timestamp: self.timestamp,
            instance_id: self.instance_id.clone(),
            token_nonce: self.token_nonce.clone(),
            actor: self.actor.clone(),
            action: self.action.clone(),
            parameters: self.parameters.clone(),
            outcome: self.outcome.clone(),
            idempotency_key: self.idempotency_key.clone(),
            usage_units: self.usage_units,
        }
    }
}
