//! Gatehouse workflow engine
//!
//! Drives approval-gated operations across conversation turns and restarts:
//!
//! - steps run in order: automatic handlers, confirmation gates, and one
//!   terminal action
//! - at a gate the engine checkpoints, issues signed single-use tokens and
//!   returns a [`Suspension`]; nothing stays in memory
//! - [`WorkflowEngine::resume`] validates a token against the prompt it was
//!   issued for and consumes it in the same compare-and-swap write that
//!   records the transition
//! - the terminal action is marked before it reaches the [`ActionGateway`],
//!   executed under a stable idempotency key, and audited before the
//!   instance is completed
//!
//! ```ignore
//! let engine = EngineBuilder::with_storage(storage, gateway)
//!     .with_builtin_definitions()
//!     .build()?;
//! let started = engine.start(StartRequest::new("access.request", params, actor, thread)).await?;
//! ```

#![deny(unsafe_code)]

pub mod authz;
pub mod builtin;
pub mod config;
mod engine;
mod error;
pub mod gateway;
pub mod handlers;
mod ledger;
pub mod mocks;
pub mod prompt;
mod registry;
pub mod retry;
pub mod telemetry;

pub use authz::AuthorizationTable;
pub use config::{EngineConfig, StorageConfig, StorageHandles};
pub use engine::{Advance, EngineBuilder, StartRequest, Started, WorkflowEngine};
pub use error::{ConfirmationRejection, EngineError, EngineResult};
pub use gateway::{ActionGateway, ActionResult, GatewayError, MeteredGateway};
pub use handlers::{HandlerRegistry, StepError, StepHandler};
pub use ledger::{UsageEntry, UsageLedger};
pub use prompt::{PendingConfirmation, PromptChoice, Suspension};
pub use registry::DefinitionRegistry;
pub use retry::RetryPolicy;

pub use gatehouse_token::TokenRejection;
