//! The governance action gateway boundary.
//!
//! The engine never talks to the identity-governance backend directly. It
//! calls an [`ActionGateway`]; deployments plug in the real client and tests
//! plug in [`crate::mocks::RecordingGateway`].

use crate::ledger::UsageLedger;
use async_trait::async_trait;
use gatehouse_types::IdempotencyKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Timeouts, 5xx, connection resets. Worth retrying.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// Validation failures, authorization denials. Never retried.
    #[error("gateway rejected request: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Outcome reported by the backend for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage_units: u64,
}

impl ActionResult {
    pub fn succeeded(external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id.into()),
            error: None,
            usage_units: 0,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(error.into()),
            usage_units: 0,
        }
    }

    pub fn with_usage(mut self, units: u64) -> Self {
        self.usage_units = units;
        self
    }
}

#[async_trait]
pub trait ActionGateway: Send + Sync {
    /// Perform a state-changing action.
    ///
    /// Implementations must deduplicate on `key`: a second call with the
    /// same key returns the first call's result without a second effect.
    async fn execute(
        &self,
        action: &str,
        params: &Value,
        key: &IdempotencyKey,
    ) -> Result<ActionResult, GatewayError>;

    /// Outcome of an earlier `execute` with this key, if the backend saw it.
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ActionResult>, GatewayError>;

    /// Read-only query used by automatic steps.
    async fn fetch(&self, query: &str, _params: &Value) -> Result<Value, GatewayError> {
        Err(GatewayError::Permanent(format!(
            "query {query} is not supported by this gateway"
        )))
    }
}

/// Wraps a gateway and charges every executed action's usage to the
/// instance in a [`UsageLedger`].
pub struct MeteredGateway {
    inner: Arc<dyn ActionGateway>,
    ledger: Arc<UsageLedger>,
}

impl MeteredGateway {
    pub fn new(inner: Arc<dyn ActionGateway>, ledger: Arc<UsageLedger>) -> Self {
        Self { inner, ledger }
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }
}

#[async_trait]
impl ActionGateway for MeteredGateway {
    async fn execute(
        &self,
        action: &str,
        params: &Value,
        key: &IdempotencyKey,
    ) -> Result<ActionResult, GatewayError> {
        let result = self.inner.execute(action, params, key).await?;
        self.ledger
            .record(&key.instance_id, action, result.usage_units);
        Ok(result)
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ActionResult>, GatewayError> {
        self.inner.lookup(key).await
    }

    async fn fetch(&self, query: &str, params: &Value) -> Result<Value, GatewayError> {
        self.inner.fetch(query, params).await
    }
}
