//! Confirmation token handling at the engine boundary: expiry, replay,
//! binding mismatches, cancellation and reissue.

mod common;

use chrono::Duration;
use common::*;
use gatehouse_engine::mocks::RecordingGateway;
use gatehouse_engine::{
    Advance, ConfirmationRejection, EngineBuilder, EngineError, TokenRejection,
};
use gatehouse_token::TokenSecret;
use gatehouse_types::{ActorId, WorkflowStatus};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn token_valid_at_29_seconds() {
    let h = harness();
    let started = start_access(&h).await;
    let token = gate_token(&started.advance);

    h.clock.advance(Duration::seconds(29));
    let advance = h
        .engine
        .resume(&started.instance_id, &token, &requester_id(), "submit")
        .await
        .unwrap();

    assert!(matches!(advance, Advance::Completed { .. }));
    assert_eq!(h.gateway.effect_count(), 1);
    assert_eq!(h.gateway.calls_for("access.submit_request").len(), 1);
}

#[tokio::test]
async fn token_expired_at_31_seconds_then_reissued() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    h.clock.advance(Duration::seconds(31));
    let err = h
        .engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::Expired));
    assert_eq!(
        h.engine.instance(&id).await.unwrap().status,
        WorkflowStatus::Suspended
    );
    assert_eq!(h.gateway.effect_count(), 0);

    let suspension = h.engine.reissue(&id, &requester_id()).await.unwrap();
    let fresh = suspension.single().unwrap();
    assert_ne!(fresh.token, token);
    assert_eq!(fresh.prompt_text, suspended(&started.advance).prompts[0].prompt_text);

    // The superseded token now reports Consumed rather than Expired.
    let err = h
        .engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::Consumed));

    let advance = h
        .engine
        .resume(&id, &fresh.token, &requester_id(), "submit")
        .await
        .unwrap();
    assert!(matches!(advance, Advance::Completed { .. }));
}

// ---------------------------------------------------------------------------
// Replay and binding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_resume_with_same_token_is_consumed() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    h.engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap();
    let err = h
        .engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::Consumed));
    assert_eq!(h.gateway.effect_count(), 1);
}

#[tokio::test]
async fn replay_after_cancel_option_is_consumed() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    let advance = h
        .engine
        .resume(&id, &token, &requester_id(), "cancel")
        .await
        .unwrap();
    assert!(matches!(advance, Advance::Cancelled { .. }));

    let err = h
        .engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::Consumed));
    assert_eq!(h.gateway.effect_count(), 0);
}

#[tokio::test]
async fn other_actor_cannot_use_token() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    let err = h
        .engine
        .resume(&id, &token, &ActorId::new("mallory"), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::ActorMismatch));

    // Rejection left the token usable by its owner.
    h.engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap();
}

#[tokio::test]
async fn token_for_another_instance_is_rejected() {
    let h = harness();
    let first = start_access(&h).await;
    let second = start_access(&h).await;

    let err = h
        .engine
        .resume(
            &second.instance_id,
            &gate_token(&first.advance),
            &requester_id(),
            "submit",
        )
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::InstanceMismatch));
}

#[tokio::test]
async fn tampered_or_foreign_tokens_fail_signature() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    let mut tampered = token.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == '0' { '1' } else { '0' });
    let err = h
        .engine
        .resume(&id, &tampered, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::SignatureMismatch));

    // Same storage, different signing secret.
    let other = EngineBuilder::with_storage(h.storage.clone(), Arc::new(RecordingGateway::new()))
        .with_builtin_definitions()
        .secret(TokenSecret::from_bytes([9u8; 32]))
        .build()
        .unwrap();
    let err = other
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::SignatureMismatch));

    let err = h
        .engine
        .resume(&id, "garbage", &requester_id(), "submit")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::SignatureMismatch));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_then_resume_is_rejected() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    let status = h.engine.cancel(&id, &requester()).await.unwrap();
    assert_eq!(status, WorkflowStatus::Cancelled);

    let err = h
        .engine
        .resume(&id, &token, &requester_id(), "submit")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidConfirmation(ConfirmationRejection::InstanceCancelled)
    ));
    assert_eq!(h.gateway.effect_count(), 0);
    assert!(h.engine.audit_trail(&id).await.unwrap().is_empty());

    // Idempotent on a terminal instance.
    assert_eq!(
        h.engine.cancel(&id, &requester()).await.unwrap(),
        WorkflowStatus::Cancelled
    );
}

#[tokio::test]
async fn only_initiator_or_admin_may_cancel() {
    let h = harness_with(|b| {
        b.authorization(
            gatehouse_engine::AuthorizationTable::new()
                .grant("employee", gatehouse_engine::builtin::ACCESS_REQUEST)
                .allow_cancel_any("governance-admin"),
        )
    });
    let started = start_access(&h).await;
    let id = started.instance_id.clone();

    let err = h
        .engine
        .cancel(&id, &gatehouse_types::Actor::new("bob").with_role("employee"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));

    let admin = gatehouse_types::Actor::new("root").with_role("governance-admin");
    assert_eq!(
        h.engine.cancel(&id, &admin).await.unwrap(),
        WorkflowStatus::Cancelled
    );
}

#[tokio::test]
async fn reissue_is_refused_for_others_and_unsuspended_instances() {
    let h = harness();
    let started = start_access(&h).await;
    let id = started.instance_id.clone();

    let err = h
        .engine
        .reissue(&id, &ActorId::new("mallory"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));

    h.engine
        .resume(&id, &gate_token(&started.advance), &requester_id(), "submit")
        .await
        .unwrap();
    let err = h.engine.reissue(&id, &requester_id()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: WorkflowStatus::Completed,
            ..
        }
    ));
}
