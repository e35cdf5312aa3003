//! Automatic step handlers.
//!
//! A handler runs without human involvement and returns a JSON output the
//! engine stores under the step's name. Handlers may read through the
//! gateway but never perform state-changing actions; those belong to the
//! terminal step.

use crate::gateway::{ActionGateway, GatewayError};
use async_trait::async_trait;
use gatehouse_risk::RiskClassifier;
use gatehouse_types::WorkflowInstance;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const PARTITION_HANDLER: &str = "review.partition";
pub const RESOLVE_ACCESS_HANDLER: &str = "access.resolve";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl From<GatewayError> for StepError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => StepError::Transient(msg),
            GatewayError::Permanent(msg) => StepError::Permanent(msg),
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step against a scratch copy of the instance.
    ///
    /// Changes to `instance` are kept only if the handler succeeds.
    async fn run(
        &self,
        instance: &mut WorkflowInstance,
        gateway: &dyn ActionGateway,
    ) -> Result<Value, StepError>;
}

/// Handlers by name, as referenced from `StepKind::Automatic`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the handlers the built-in definitions use.
    pub fn with_builtins(classifier: RiskClassifier) -> Self {
        let mut registry = Self::new();
        registry.register(PARTITION_HANDLER, Arc::new(PartitionHandler::new(classifier)));
        registry.register(RESOLVE_ACCESS_HANDLER, Arc::new(ResolveAccessHandler));
        registry
    }

    /// Register a handler, replacing any previous one under `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

// ── review.partition ─────────────────────────────────────────────────

/// Classifies every item under review and records the partition.
pub struct PartitionHandler {
    classifier: RiskClassifier,
}

impl PartitionHandler {
    pub fn new(classifier: RiskClassifier) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl StepHandler for PartitionHandler {
    async fn run(
        &self,
        instance: &mut WorkflowInstance,
        _gateway: &dyn ActionGateway,
    ) -> Result<Value, StepError> {
        let partition = self.classifier.partition(&mut instance.items);
        tracing::debug!(
            instance_id = %instance.id,
            auto_approve = partition.auto_approve.len(),
            escalate = partition.escalate.len(),
            auto_revoke = partition.auto_revoke.len(),
            "Items partitioned"
        );
        Ok(json!({
            "total": partition.len(),
            "auto_approve": partition.auto_approve,
            "escalate": partition.escalate,
            "auto_revoke": partition.auto_revoke,
        }))
    }
}

// ── access.resolve ───────────────────────────────────────────────────

/// Looks up the requested access items so the confirmation shows what will
/// actually be requested.
///
/// Expects `identity`, a non-empty `requested_items` array and an optional
/// `justification` in the start parameters.
pub struct ResolveAccessHandler;

#[async_trait]
impl StepHandler for ResolveAccessHandler {
    async fn run(
        &self,
        instance: &mut WorkflowInstance,
        gateway: &dyn ActionGateway,
    ) -> Result<Value, StepError> {
        let params = &instance.parameters;
        let identity = params
            .get("identity")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StepError::Permanent("identity is required".into()))?;
        let requested = params
            .get("requested_items")
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| StepError::Permanent("requested_items must be a non-empty list".into()))?;
        let justification = params
            .get("justification")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let found = gateway
            .fetch(
                "access.search",
                &json!({ "identity": identity, "items": requested }),
            )
            .await?;
        let items = found
            .as_array()
            .ok_or_else(|| StepError::Permanent("access.search returned a non-list".into()))?;
        if items.is_empty() {
            return Err(StepError::Permanent(
                "none of the requested items exist".into(),
            ));
        }

        Ok(json!({
            "identity": identity,
            "items": items,
            "item_count": items.len(),
            "justification": justification,
        }))
    }
}
