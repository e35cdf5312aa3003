//! Gatehouse domain types
//!
//! Shared vocabulary for every gatehouse crate: identifiers, workflow
//! definitions (steps, gates, terminal actions), workflow instances and
//! their lifecycle, governance items under review, and the clock
//! abstraction used for token expiry.
//!
//! Nothing in this crate performs I/O. The engine owns behaviour; these
//! types only carry state and enforce local invariants such as legal
//! status transitions and definition well-formedness.

#![deny(unsafe_code)]

pub mod actor;
pub mod clock;
pub mod definition;
pub mod ids;
pub mod instance;
pub mod item;

pub use actor::Actor;
pub use clock::{Clock, ManualClock, SystemClock};
pub use definition::{
    DefinitionError, GateScope, GateSpec, OptionEffect, ParamSource, PromptOption,
    StepDefinition, StepKind, WorkflowDefinition,
};
pub use ids::{ActorId, IdempotencyKey, ItemId, WorkflowDefinitionId, WorkflowInstanceId};
pub use instance::{
    ActionAttempt, ConfirmationRecord, PendingPrompt, StatusTransition, TransitionError,
    WorkflowInstance, WorkflowStatus,
};
pub use item::{
    Decision, DecisionAttribution, GovernanceItem, Recommendation, RiskAssessment, RiskBucket,
    RiskSignals,
};
