use thiserror::Error;

/// Why a presented token was refused.
///
/// Variants are listed in the order validation checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TokenRejection {
    #[error("token signature mismatch")]
    SignatureMismatch,

    #[error("token is bound to a different workflow instance")]
    InstanceMismatch,

    #[error("token has already been used")]
    Consumed,

    #[error("token has expired")]
    Expired,

    #[error("token was issued to a different actor")]
    ActorMismatch,

    #[error("token authorizes a different action")]
    ActionMismatch,

    #[error("token was issued for different parameters")]
    ParameterMismatch,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token secret: {0}")]
    InvalidSecret(String),

    #[error("token encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
