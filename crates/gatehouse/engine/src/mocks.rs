//! Test doubles for the action gateway.

use crate::gateway::{ActionGateway, ActionResult, GatewayError};
use async_trait::async_trait;
use gatehouse_types::IdempotencyKey;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// One call observed by [`RecordingGateway`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub action: String,
    pub params: Value,
    pub key: String,
}

#[derive(Default)]
struct State {
    calls: Vec<RecordedCall>,
    /// Result per idempotency key; the first successful call wins
    results: HashMap<String, ActionResult>,
    /// Keys that produced an external effect
    effects: HashSet<String>,
    scripted: VecDeque<GatewayError>,
    rejected_actions: HashMap<String, String>,
    fetches: HashMap<String, Value>,
    fetch_failures: VecDeque<GatewayError>,
    next_id: u64,
}

/// In-memory governance backend.
///
/// Deduplicates by idempotency key like a well-behaved backend, counts the
/// distinct external effects it produced, and can be told to fail.
#[derive(Default)]
pub struct RecordingGateway {
    state: Mutex<State>,
    usage_per_action: u64,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage_per_action(mut self, units: u64) -> Self {
        self.usage_per_action = units;
        self
    }

    /// Serve `response` for `fetch(query, ..)`.
    pub fn with_fetch(self, query: impl Into<String>, response: Value) -> Self {
        self.lock().fetches.insert(query.into(), response);
        self
    }

    /// The backend will refuse `action` with `reason` (a well-formed
    /// unsuccessful result, not an error).
    pub fn reject_action(&self, action: impl Into<String>, reason: impl Into<String>) {
        self.lock()
            .rejected_actions
            .insert(action.into(), reason.into());
    }

    /// The next `count` executes fail with `error` before touching anything.
    pub fn fail_next(&self, count: usize, error: GatewayError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.scripted.push_back(error.clone());
        }
    }

    pub fn fail_next_fetch(&self, count: usize, error: GatewayError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.fetch_failures.push_back(error.clone());
        }
    }

    /// Number of distinct external effects produced.
    pub fn effect_count(&self) -> usize {
        self.lock().effects.len()
    }

    pub fn has_effect(&self, key: &str) -> bool {
        self.lock().effects.contains(key)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, action: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ActionGateway for RecordingGateway {
    async fn execute(
        &self,
        action: &str,
        params: &Value,
        key: &IdempotencyKey,
    ) -> Result<ActionResult, GatewayError> {
        let mut state = self.lock();
        let key = key.to_string();
        state.calls.push(RecordedCall {
            action: action.to_string(),
            params: params.clone(),
            key: key.clone(),
        });

        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if let Some(previous) = state.results.get(&key) {
            return Ok(previous.clone());
        }

        let rejection = state.rejected_actions.get(action).cloned();
        let result = match rejection {
            Some(reason) => ActionResult::rejected(reason),
            None => {
                state.next_id += 1;
                state.effects.insert(key.clone());
                ActionResult::succeeded(format!("EXT-{}", state.next_id))
                    .with_usage(self.usage_per_action)
            }
        };
        state.results.insert(key, result.clone());
        Ok(result)
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ActionResult>, GatewayError> {
        Ok(self.lock().results.get(&key.to_string()).cloned())
    }

    async fn fetch(&self, query: &str, params: &Value) -> Result<Value, GatewayError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            action: query.to_string(),
            params: params.clone(),
            key: String::new(),
        });
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }
        state
            .fetches
            .get(query)
            .cloned()
            .ok_or_else(|| GatewayError::Permanent(format!("no fixture for query {query}")))
    }
}
