//! Confirmation tokens.
//!
//! A confirmation token is the capability a human hands back to resume a
//! suspended workflow. It binds one instance, one actor, one action and one
//! exact parameter set, carries an issue time and a random nonce, and is
//! signed with a keyed BLAKE3 MAC:
//!
//! ```text
//! base64url(claims JSON) "." hex(blake3::keyed_hash(secret, canonical claims))
//! ```
//!
//! Tokens are single-use, but this crate keeps no state: the caller supplies
//! the set of already-consumed nonces to [`TokenManager::validate`] and is
//! responsible for recording consumption atomically with the transition the
//! token authorizes.

#![deny(unsafe_code)]

mod claims;
mod error;
mod manager;
mod secret;

pub use claims::{canonical_json, parameter_digest, TokenBinding, TokenClaims};
pub use error::{TokenError, TokenRejection};
pub use manager::{ConsumedNonces, IssuedToken, TokenManager, DEFAULT_MAX_CLOCK_SKEW, DEFAULT_TTL};
pub use secret::TokenSecret;
