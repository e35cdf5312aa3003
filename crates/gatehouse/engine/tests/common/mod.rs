//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use gatehouse_engine::mocks::RecordingGateway;
use gatehouse_engine::{
    builtin, Advance, EngineBuilder, RetryPolicy, StartRequest, Started, Suspension,
    WorkflowEngine,
};
use gatehouse_storage::InMemoryStorage;
use gatehouse_token::TokenSecret;
use gatehouse_types::{Actor, ActorId, ManualClock};
use serde_json::{json, Value};
use std::sync::Arc;

pub const REVIEWER: &str = "rev-042";
pub const REQUESTER: &str = "alice";

pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub storage: Arc<InMemoryStorage>,
    pub gateway: Arc<RecordingGateway>,
    pub clock: ManualClock,
}

pub fn harness() -> Harness {
    harness_with(|builder| builder)
}

/// Engine over fresh in-memory storage, a recording gateway and a pinned
/// clock, with millisecond backoff.
pub fn harness_with(configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let gateway = Arc::new(
        RecordingGateway::new()
            .with_usage_per_action(2)
            .with_fetch(
                "access.search",
                json!([
                    {"id": "ent-payroll-view", "name": "Payroll viewer"},
                    {"id": "ent-ledger-read", "name": "Ledger read"},
                ]),
            ),
    );
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());

    let builder = EngineBuilder::with_storage(storage.clone(), gateway.clone())
        .with_builtin_definitions()
        .clock(Arc::new(clock.clone()))
        .secret(TokenSecret::from_bytes([7u8; 32]))
        .retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        });
    let engine = configure(builder).build().unwrap();

    Harness {
        engine: Arc::new(engine),
        storage,
        gateway,
        clock,
    }
}

pub fn reviewer() -> Actor {
    Actor::new(REVIEWER).with_role("certifier")
}

pub fn reviewer_id() -> ActorId {
    ActorId::new(REVIEWER)
}

pub fn requester() -> Actor {
    Actor::new(REQUESTER).with_role("employee")
}

pub fn requester_id() -> ActorId {
    ActorId::new(REQUESTER)
}

/// 47 items: 38 low-risk with an approve recommendation, 6 privileged and
/// half-stale, 3 privileged, long unused and far from their peers.
pub fn review_items() -> Value {
    let mut items = Vec::new();
    for i in 0..38 {
        items.push(json!({
            "id": format!("low-{i:02}"),
            "name": format!("Wiki reader {i}"),
            "signals": {"privilege_level": 0.2, "peer_deviation": 0.1},
            "recommendation": "approve",
        }));
    }
    for i in 0..6 {
        items.push(json!({
            "id": format!("mid-{i}"),
            "name": format!("Billing admin {i}"),
            "signals": {"privilege_level": 1.0, "days_unused": 90},
        }));
    }
    for i in 0..3 {
        items.push(json!({
            "id": format!("high-{i}"),
            "name": format!("Domain admin {i}"),
            "signals": {"privilege_level": 1.0, "days_unused": 400, "peer_deviation": 1.0},
            "recommendation": "revoke",
        }));
    }
    Value::Array(items)
}

pub fn review_params(items: Value) -> Value {
    json!({"campaign": "Q1 finance", "items": items})
}

pub fn access_params() -> Value {
    json!({
        "identity": REQUESTER,
        "requested_items": ["Payroll viewer", "Ledger read"],
        "justification": "quarter close",
    })
}

pub async fn start_review(h: &Harness, items: Value) -> Started {
    h.engine
        .start(StartRequest::new(
            builtin::CERTIFICATION_REVIEW,
            review_params(items),
            reviewer(),
            "thread-review",
        ))
        .await
        .unwrap()
}

pub async fn start_access(h: &Harness) -> Started {
    h.engine
        .start(StartRequest::new(
            builtin::ACCESS_REQUEST,
            access_params(),
            requester(),
            "thread-access",
        ))
        .await
        .unwrap()
}

pub fn suspended(advance: &Advance) -> &Suspension {
    advance
        .suspension()
        .unwrap_or_else(|| panic!("expected a suspension, got {advance:?}"))
}

/// Token of the gate's own prompt.
pub fn gate_token(advance: &Advance) -> String {
    suspended(advance)
        .single()
        .expect("gate prompt")
        .token
        .clone()
}
