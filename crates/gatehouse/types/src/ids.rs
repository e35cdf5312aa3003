//! Identifier newtypes

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a registered workflow definition, e.g. `certification.review`
    WorkflowDefinitionId
);

string_id!(
    /// Authenticated principal, as derived by the transport layer
    ActorId
);

string_id!(
    /// Governance item under review (an entitlement assignment)
    ItemId
);

string_id!(
    /// Workflow instance identifier: `<thread id>:<operation id>`
    WorkflowInstanceId
);

impl WorkflowInstanceId {
    /// Compose an instance id for a conversation thread and a fresh operation.
    pub fn for_thread(thread_id: &str) -> Self {
        Self(format!("{}:{}", thread_id, uuid::Uuid::new_v4()))
    }

    /// The thread portion of the id, if it was composed with one.
    pub fn thread(&self) -> Option<&str> {
        self.0.rsplit_once(':').map(|(thread, _)| thread)
    }

    pub fn short(&self) -> &str {
        let op = self.0.rsplit_once(':').map(|(_, op)| op).unwrap_or(&self.0);
        &op[..8.min(op.len())]
    }
}

/// Deduplication key handed to the action gateway.
///
/// Stable for a given instance and step so a retried or recovered action is
/// recognized by the backend as the same request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub instance_id: WorkflowInstanceId,
    pub step: String,
}

impl IdempotencyKey {
    pub fn for_step(instance_id: &WorkflowInstanceId, step: &str) -> Self {
        Self {
            instance_id: instance_id.clone(),
            step: step.to_string(),
        }
    }

    pub fn for_compensation(instance_id: &WorkflowInstanceId, step: &str) -> Self {
        Self {
            instance_id: instance_id.clone(),
            step: format!("{step}:compensate"),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.step)
    }
}
