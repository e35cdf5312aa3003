//! Certification review: partition, bulk approval, per-item decisions and
//! sign-off of a 47-item batch.

mod common;

use common::*;
use gatehouse_engine::{builtin, Advance, EngineError, StartRequest, TokenRejection};
use gatehouse_risk::{AutoRevokeRule, RiskConfig};
use gatehouse_storage::verify_chain;
use gatehouse_types::{Decision, ItemId, RiskBucket, WorkflowStatus};
use serde_json::json;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_of_47_items_end_to_end() {
    let h = harness();
    let started = start_review(&h, review_items()).await;
    let id = started.instance_id.clone();

    // Partition: 38 auto-approve, 9 escalate.
    let instance = h.engine.instance(&id).await.unwrap();
    let partition = &instance.outputs["partition"];
    assert_eq!(partition["total"], 47);
    assert_eq!(partition["auto_approve"].as_array().unwrap().len(), 38);
    assert_eq!(partition["escalate"].as_array().unwrap().len(), 9);
    assert!(partition["auto_revoke"].as_array().unwrap().is_empty());

    // Bulk approval gate binds exactly the 38 low-risk items.
    let bulk = suspended(&started.advance);
    assert_eq!(bulk.prompts.len(), 1);
    assert_eq!(bulk.prompts[0].action, "review.bulk_approve");
    assert_eq!(bulk.prompts[0].prompt_text, "Approve all 38 low-risk item(s)?");
    let bulk_token = bulk.prompts[0].token.clone();

    let advance = h
        .engine
        .resume(&id, &bulk_token, &reviewer_id(), "approve_all")
        .await
        .unwrap();

    // The empty bulk-revoke gate is skipped; one prompt per escalated item
    // plus the sign-off.
    let review = suspended(&advance).clone();
    assert_eq!(review.item_prompts().count(), 9);
    assert_eq!(review.prompts.len(), 10);
    assert_eq!(review.sign_off().unwrap().action, "review.sign_off");

    let instance = h.engine.instance(&id).await.unwrap();
    let approved = instance
        .items
        .iter()
        .filter(|i| i.decision == Decision::Approved)
        .count();
    assert_eq!(approved, 38);
    assert!(instance
        .completed_steps
        .contains(&"confirm_bulk_revoke".to_string()));

    // Early sign-off is refused and changes nothing.
    let sign_off = review.sign_off().unwrap().token.clone();
    let version_before = h.engine.history(&id).await.unwrap().len();
    let err = h
        .engine
        .resume(&id, &sign_off, &reviewer_id(), "sign_off")
        .await
        .unwrap_err();
    match err {
        EngineError::IncompleteDecisions { pending } => assert_eq!(pending.len(), 9),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.engine.history(&id).await.unwrap().len(), version_before);
    assert_eq!(
        h.engine.instance(&id).await.unwrap().status,
        WorkflowStatus::Suspended
    );

    // Decide each escalated item with its own token.
    let mut last = advance;
    for prompt in review.item_prompts() {
        let item = prompt.item_id.clone().unwrap();
        let option = if item.as_str().starts_with("high") {
            "revoke"
        } else {
            "approve"
        };
        last = h
            .engine
            .resume(&id, &prompt.token, &reviewer_id(), option)
            .await
            .unwrap();
    }
    let remaining = suspended(&last);
    assert_eq!(remaining.prompts.len(), 1);
    assert_eq!(remaining.sign_off().unwrap().token, sign_off);

    // The earlier sign-off token is still valid.
    let done = h
        .engine
        .resume(&id, &sign_off, &reviewer_id(), "sign_off")
        .await
        .unwrap();
    assert!(matches!(done, Advance::Completed { .. }));

    // One audit record carrying all 47 attributed decisions.
    let trail = h.engine.audit_trail(&id).await.unwrap();
    assert_eq!(trail.len(), 1);
    let record = &trail[0];
    assert_eq!(record.action, "certification.sign_off");
    assert!(record.outcome.is_success());
    assert_eq!(record.idempotency_key, format!("{id}:sign_off"));

    let decisions = record.parameters["decisions"].as_array().unwrap();
    assert_eq!(decisions.len(), 47);
    assert_eq!(record.parameters["item_count"], 47);
    assert!(record.parameters.get("items").is_none());
    assert!(decisions.iter().all(|d| d["decided_by"] == REVIEWER));

    let bulk_nonce = decisions[0]["token_nonce"].as_str().unwrap();
    let by_bulk = decisions
        .iter()
        .filter(|d| d["token_nonce"] == bulk_nonce)
        .count();
    assert_eq!(by_bulk, 38);
    let revoked = decisions
        .iter()
        .filter(|d| d["decision"] == "revoked")
        .count();
    assert_eq!(revoked, 3);

    verify_chain(&trail).unwrap();
    assert_eq!(h.gateway.calls_for("certification.sign_off").len(), 1);
}

#[tokio::test]
async fn declining_bulk_approval_moves_items_to_individual_review() {
    let h = harness();
    let started = start_review(&h, review_items()).await;
    let id = started.instance_id.clone();

    let advance = h
        .engine
        .resume(
            &id,
            &gate_token(&started.advance),
            &reviewer_id(),
            "review_individually",
        )
        .await
        .unwrap();

    let review = suspended(&advance);
    assert_eq!(review.item_prompts().count(), 47);
    assert!(review.for_item(&ItemId::new("low-07")).is_some());
}

#[tokio::test]
async fn item_tokens_survive_other_decisions() {
    let h = harness();
    let started = start_review(&h, review_items()).await;
    let id = started.instance_id.clone();
    let advance = h
        .engine
        .resume(&id, &gate_token(&started.advance), &reviewer_id(), "approve_all")
        .await
        .unwrap();
    let review = suspended(&advance).clone();

    let first = review.for_item(&ItemId::new("mid-0")).unwrap();
    let second = review.for_item(&ItemId::new("mid-1")).unwrap();

    h.engine
        .resume(&id, &first.token, &reviewer_id(), "approve")
        .await
        .unwrap();
    // Replaying the spent item token is refused.
    let err = h
        .engine
        .resume(&id, &first.token, &reviewer_id(), "approve")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Some(TokenRejection::Consumed));

    // The other item's token still works.
    h.engine
        .resume(&id, &second.token, &reviewer_id(), "revoke")
        .await
        .unwrap();

    let instance = h.engine.instance(&id).await.unwrap();
    let item = instance.item(&ItemId::new("mid-1")).unwrap();
    assert_eq!(item.decision, Decision::Revoked);
    assert_eq!(item.attribution.as_ref().unwrap().actor.as_str(), REVIEWER);
}

#[tokio::test]
async fn auto_revoke_bucket_when_enabled() {
    let risk = RiskConfig::default().with_auto_revoke(AutoRevokeRule {
        min_score: 0.4,
        min_days_unused: 365,
        require_revoke_recommendation: true,
    });
    let h = harness_with(|b| b.risk(risk));

    // Moderate privilege, a year unused, revoke recommended: score 0.5.
    let mut items = review_items().as_array().unwrap().clone();
    items.push(json!({
        "id": "stale-0",
        "name": "Old report writer",
        "signals": {"privilege_level": 0.5, "days_unused": 400, "peer_deviation": 0.5},
        "recommendation": "revoke",
    }));
    let started = start_review(&h, json!(items)).await;
    let id = started.instance_id.clone();

    let advance = h
        .engine
        .resume(&id, &gate_token(&started.advance), &reviewer_id(), "approve_all")
        .await
        .unwrap();

    let revoke_gate = suspended(&advance).single().unwrap().clone();
    assert_eq!(revoke_gate.action, "review.bulk_revoke");
    assert_eq!(revoke_gate.prompt_text, "Revoke all 1 stale item(s)?");

    let advance = h
        .engine
        .resume(&id, &revoke_gate.token, &reviewer_id(), "revoke_all")
        .await
        .unwrap();
    assert_eq!(suspended(&advance).item_prompts().count(), 9);

    let instance = h.engine.instance(&id).await.unwrap();
    let stale = instance.item(&ItemId::new("stale-0")).unwrap();
    assert_eq!(stale.bucket(), Some(RiskBucket::AutoRevoke));
    assert_eq!(stale.decision, Decision::Revoked);
}

#[tokio::test]
async fn undecodable_items_are_invalid_parameters() {
    let h = harness();
    let err = h
        .engine
        .start(StartRequest::new(
            builtin::CERTIFICATION_REVIEW,
            json!({"items": [{"name": "no id"}]}),
            reviewer(),
            "thread",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidParameters(_)));
    assert!(h.engine.recover_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_option_is_rejected_without_change() {
    let h = harness();
    let started = start_review(&h, review_items()).await;
    let id = started.instance_id.clone();
    let token = gate_token(&started.advance);

    let err = h
        .engine
        .resume(&id, &token, &reviewer_id(), "approve_everything")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfirmation(_)));

    // The token was not consumed.
    h.engine
        .resume(&id, &token, &reviewer_id(), "approve_all")
        .await
        .unwrap();
}
