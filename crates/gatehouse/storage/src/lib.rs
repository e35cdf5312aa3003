//! Gatehouse durable state.
//!
//! Two contracts live here:
//! - [`CheckpointStore`]: versioned workflow-instance snapshots with
//!   mandatory compare-and-swap writes. Every version is retained.
//! - [`AuditSink`]: an append-only, BLAKE3 hash-chained record of every
//!   state-changing action, unique per idempotency key.
//!
//! The in-memory adapter is the reference implementation used by tests.
//! PostgreSQL (feature `postgres`) is the transactional backend.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
mod hash;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use hash::{compute_audit_hash, verify_chain};
pub use memory::InMemoryStorage;
pub use model::{AuditAppend, AuditOutcome, AuditRecord, Checkpoint};
pub use traits::{AuditSink, CheckpointStore, GatehouseStorage, QueryWindow};
