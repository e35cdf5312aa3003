//! Engine error types

use gatehouse_storage::StorageError;
use gatehouse_token::{TokenError, TokenRejection};
use gatehouse_types::{
    ActorId, DefinitionError, ItemId, TransitionError, WorkflowDefinitionId, WorkflowInstanceId,
    WorkflowStatus,
};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Why a `resume` was refused. Token rejections plus checks the engine
/// makes against the instance itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmationRejection {
    #[error(transparent)]
    Token(#[from] TokenRejection),

    #[error("workflow has been cancelled")]
    InstanceCancelled,

    #[error("no confirmation is pending for this token")]
    NotPending,

    #[error("option {0} is not offered by this prompt")]
    UnknownOption(String),
}

impl ConfirmationRejection {
    /// Convenience for matching on the token-level reason.
    pub fn token(&self) -> Option<TokenRejection> {
        match self {
            ConfirmationRejection::Token(r) => Some(*r),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow definition: {0}")]
    UnknownDefinition(WorkflowDefinitionId),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(WorkflowInstanceId),

    #[error("actor {actor} is not authorized to {operation}")]
    Unauthorized { actor: ActorId, operation: String },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("confirmation rejected: {0}")]
    InvalidConfirmation(ConfirmationRejection),

    #[error("version conflict on {instance_id}: expected {expected}, found {actual}")]
    VersionConflict {
        instance_id: WorkflowInstanceId,
        expected: u64,
        actual: u64,
    },

    #[error("instance {0} is busy; retry later")]
    EngineBusy(WorkflowInstanceId),

    #[error("{} item(s) still pending a decision", pending.len())]
    IncompleteDecisions { pending: Vec<ItemId> },

    #[error("action failed: {reason}")]
    ActionFailed {
        instance_id: WorkflowInstanceId,
        reason: String,
    },

    #[error("step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("gateway unavailable: {0}")]
    TransientGateway(String),

    #[error("the terminal action of {0} is already in flight")]
    ActionInFlight(WorkflowInstanceId),

    #[error("instance is {status}, expected {expected}")]
    InvalidState {
        status: WorkflowStatus,
        expected: WorkflowStatus,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict {
                instance_id,
                expected,
                actual,
            } => EngineError::VersionConflict {
                instance_id,
                expected,
                actual,
            },
            other => EngineError::Storage(other),
        }
    }
}

impl From<ConfirmationRejection> for EngineError {
    fn from(rejection: ConfirmationRejection) -> Self {
        EngineError::InvalidConfirmation(rejection)
    }
}

impl From<TokenRejection> for EngineError {
    fn from(rejection: TokenRejection) -> Self {
        EngineError::InvalidConfirmation(ConfirmationRejection::Token(rejection))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl EngineError {
    /// The token-level reason, if this is a token rejection.
    pub fn rejection(&self) -> Option<TokenRejection> {
        match self {
            EngineError::InvalidConfirmation(r) => r.token(),
            _ => None,
        }
    }
}
