//! Built-in workflow definitions.

use crate::handlers::{PARTITION_HANDLER, RESOLVE_ACCESS_HANDLER};
use gatehouse_types::{
    Decision, GateScope, GateSpec, OptionEffect, ParamSource, PromptOption, RiskBucket,
    StepDefinition, WorkflowDefinition,
};

pub const ACCESS_REQUEST: &str = "access.request";
pub const CERTIFICATION_REVIEW: &str = "certification.review";

/// Resolve the requested items, confirm, submit the request.
pub fn access_request() -> WorkflowDefinition {
    let resolved = || ParamSource::Output {
        step: "resolve".into(),
    };

    WorkflowDefinition::new(ACCESS_REQUEST, "Request access")
        .with_description("Request one or more access items for an identity")
        .with_step(StepDefinition::automatic("resolve", RESOLVE_ACCESS_HANDLER))
        .with_step(StepDefinition::gate(
            "confirm_submit",
            GateSpec::new(
                "access.submit_request",
                "Submit an access request for {identity} covering {item_count} item(s)?",
            )
            .with_params(resolved())
            .with_option(PromptOption::new("submit", "Submit request", OptionEffect::Proceed))
            .with_option(PromptOption::new("cancel", "Cancel", OptionEffect::Cancel)),
        ))
        .with_step(StepDefinition::terminal(
            "submit",
            "access.submit_request",
            resolved(),
        ))
}

/// Partition a certification batch by risk, bulk-decide the clear cases,
/// review the rest one by one, then sign off.
pub fn certification_review() -> WorkflowDefinition {
    let review_individually =
        || PromptOption::new("review_individually", "Review individually", OptionEffect::Defer);

    WorkflowDefinition::new(CERTIFICATION_REVIEW, "Certification review")
        .with_description("Review a certification batch and sign it off")
        .with_items_param("items")
        .with_step(StepDefinition::automatic("partition", PARTITION_HANDLER))
        .with_step(StepDefinition::gate(
            "confirm_bulk_approve",
            GateSpec::new(
                "review.bulk_approve",
                "Approve all {count} low-risk item(s)?",
            )
            .with_params(ParamSource::Bucket {
                bucket: RiskBucket::AutoApprove,
            })
            .with_option(PromptOption::new(
                "approve_all",
                "Approve all",
                OptionEffect::DecideBucket {
                    decision: Decision::Approved,
                },
            ))
            .with_option(review_individually())
            .skip_when_empty(),
        ))
        .with_step(StepDefinition::gate(
            "confirm_bulk_revoke",
            GateSpec::new(
                "review.bulk_revoke",
                "Revoke all {count} stale item(s)?",
            )
            .with_params(ParamSource::Bucket {
                bucket: RiskBucket::AutoRevoke,
            })
            .with_option(PromptOption::new(
                "revoke_all",
                "Revoke all",
                OptionEffect::DecideBucket {
                    decision: Decision::Revoked,
                },
            ))
            .with_option(review_individually())
            .skip_when_empty(),
        ))
        .with_step(StepDefinition::gate(
            "decide_items",
            GateSpec::new(
                "review.sign_off",
                "Sign off the review of {item_count} item(s)?",
            )
            .with_params(ParamSource::Batch)
            .with_option(PromptOption::new("sign_off", "Sign off", OptionEffect::SignOff))
            .with_scope(GateScope::PerPendingItem {
                item_action: "review.decide_item".into(),
                item_prompt: "{item_name}: risk {score} ({bucket}). Keep this access?".into(),
                item_options: vec![
                    PromptOption::new(
                        "approve",
                        "Approve",
                        OptionEffect::DecideItem {
                            decision: Decision::Approved,
                        },
                    ),
                    PromptOption::new(
                        "revoke",
                        "Revoke",
                        OptionEffect::DecideItem {
                            decision: Decision::Revoked,
                        },
                    ),
                ],
            }),
        ))
        .with_step(
            StepDefinition::terminal("sign_off", "certification.sign_off", ParamSource::Decisions)
                .requiring_decisions(),
        )
}

/// Every built-in definition.
pub fn all() -> Vec<WorkflowDefinition> {
    vec![access_request(), certification_review()]
}
