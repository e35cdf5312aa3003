//! Workflow instances: running executions of workflow definitions
//!
//! A WorkflowInstance is the whole durable state of one operation. It is
//! serialized into every checkpoint, so anything needed to resume after a
//! restart lives here: the step cursor, step outputs, the items under
//! review, the outstanding prompts and the nonces already spent.

use crate::{
    ActorId, GovernanceItem, IdempotencyKey, ItemId, PromptOption, WorkflowDefinition,
    WorkflowDefinitionId, WorkflowInstanceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

// ── Status ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Running,
    /// Waiting at a confirmation gate
    Suspended,
    /// A validated confirmation has been applied; about to run again
    Resuming,
    Completed,
    Cancelled,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled | WorkflowStatus::Failed
        )
    }

    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Created, Cancelled)
                | (Created, Failed)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
                | (Suspended, Resuming)
                | (Suspended, Cancelled)
                | (Resuming, Running)
                | (Resuming, Cancelled)
                | (Resuming, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "CREATED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Suspended => "SUSPENDED",
            WorkflowStatus::Resuming => "RESUMING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Cancelled => "CANCELLED",
            WorkflowStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
}

// ── Supporting records ───────────────────────────────────────────────

/// One outstanding confirmation prompt and the token issued for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingPrompt {
    pub nonce: String,
    pub token: String,
    pub action: String,
    /// The exact parameters the token's digest was computed over
    pub params: Value,
    pub prompt_text: String,
    pub options: Vec<PromptOption>,
    /// Set for per-item prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// An accepted confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub step: String,
    pub action: String,
    pub option: String,
    pub actor: ActorId,
    pub token_nonce: String,
    pub confirmed_at: DateTime<Utc>,
}

/// Marker written before the terminal action reaches the gateway.
///
/// If the process dies while this is set, recovery asks the gateway for the
/// outcome by idempotency key instead of invoking the action again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionAttempt {
    pub step: String,
    pub action: String,
    pub idempotency_key: IdempotencyKey,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_nonce: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    pub at: DateTime<Utc>,
    pub note: String,
}

// ── Workflow Instance ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub definition_id: WorkflowDefinitionId,
    /// Definition version the instance was started with; it runs to the end on it
    pub definition_version: u32,
    /// The initiating actor; every token is bound to them
    pub actor: ActorId,
    pub parameters: Value,
    /// Index of the current step. Only ever increases.
    pub step_index: usize,
    pub status: WorkflowStatus,
    /// Output of each completed automatic step, by step name
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Items under review (review definitions only)
    #[serde(default)]
    pub items: Vec<GovernanceItem>,
    #[serde(default)]
    pub pending: Vec<PendingPrompt>,
    /// Nonces of tokens that were used or retired
    #[serde(default)]
    pub consumed_nonces: BTreeSet<String>,
    #[serde(default)]
    pub confirmations: Vec<ConfirmationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_attempt: Option<ActionAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        id: WorkflowInstanceId,
        definition: &WorkflowDefinition,
        actor: ActorId,
        parameters: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            definition_id: definition.id.clone(),
            definition_version: definition.version,
            actor,
            parameters,
            step_index: 0,
            status: WorkflowStatus::Created,
            outputs: BTreeMap::new(),
            completed_steps: Vec::new(),
            items: Vec::new(),
            pending: Vec::new(),
            consumed_nonces: BTreeSet::new(),
            confirmations: Vec::new(),
            action_attempt: None,
            external_id: None,
            failure: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_items(mut self, items: Vec<GovernanceItem>) -> Self {
        self.items = items;
        self
    }

    /// Move to `to`, recording the transition.
    pub fn transition(
        &mut self,
        to: WorkflowStatus,
        now: DateTime<Utc>,
        note: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.transitions.push(StatusTransition {
            from: self.status,
            to,
            at: now,
            note: note.into(),
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Mark the current step done and move the cursor forward.
    pub fn complete_step(&mut self, step: &str) {
        self.completed_steps.push(step.to_string());
        self.step_index += 1;
    }

    pub fn prompt(&self, nonce: &str) -> Option<&PendingPrompt> {
        self.pending.iter().find(|p| p.nonce == nonce)
    }

    /// Retire every outstanding prompt; their tokens will report `Consumed`.
    pub fn retire_pending(&mut self) -> usize {
        let retired = self.pending.len();
        for prompt in self.pending.drain(..) {
            self.consumed_nonces.insert(prompt.nonce);
        }
        retired
    }

    pub fn item(&self, id: &ItemId) -> Option<&GovernanceItem> {
        self.items.iter().find(|i| &i.id == id)
    }

    pub fn item_mut(&mut self, id: &ItemId) -> Option<&mut GovernanceItem> {
        self.items.iter_mut().find(|i| &i.id == id)
    }

    pub fn pending_items(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|i| i.is_pending())
            .map(|i| i.id.clone())
            .collect()
    }

    pub fn last_confirmation(&self) -> Option<&ConfirmationRecord> {
        self.confirmations.last()
    }
}
