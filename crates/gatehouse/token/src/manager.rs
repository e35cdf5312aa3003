use crate::claims::{TokenBinding, TokenClaims};
use crate::{TokenError, TokenRejection, TokenSecret};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use gatehouse_types::Clock;
use rand::RngCore;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Lookup of nonces that may no longer be used.
pub trait ConsumedNonces {
    fn is_consumed(&self, nonce: &str) -> bool;
}

impl ConsumedNonces for BTreeSet<String> {
    fn is_consumed(&self, nonce: &str) -> bool {
        self.contains(nonce)
    }
}

impl ConsumedNonces for HashSet<String> {
    fn is_consumed(&self, nonce: &str) -> bool {
        self.contains(nonce)
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates confirmation tokens.
#[derive(Debug, Clone)]
pub struct TokenManager {
    secret: TokenSecret,
    ttl: Duration,
    max_clock_skew: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(secret: TokenSecret, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret,
            ttl: DEFAULT_TTL,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            clock,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `binding` with a fresh nonce.
    pub fn issue(&self, binding: &TokenBinding) -> Result<IssuedToken, TokenError> {
        let now = self.clock.now();
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let claims = TokenClaims {
            instance_id: binding.instance_id.clone(),
            actor_id: binding.actor_id.clone(),
            action: binding.action.clone(),
            parameter_digest: binding.parameter_digest.clone(),
            issued_at: now.timestamp_millis(),
            nonce: hex::encode(nonce),
        };

        let body = serde_json::to_vec(&claims)?;
        let signature = self.sign(&claims);
        let token = format!("{}.{}", URL_SAFE_NO_PAD.encode(body), signature.to_hex());

        tracing::debug!(
            instance_id = %claims.instance_id,
            action = %claims.action,
            nonce = %claims.nonce,
            "confirmation token issued"
        );

        Ok(IssuedToken {
            expires_at: self.expiry_of(&claims),
            token,
            claims,
        })
    }

    /// Decode a token and check its signature. Says nothing about whether
    /// it is still usable.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, TokenRejection> {
        let (body, signature) = token
            .split_once('.')
            .ok_or(TokenRejection::SignatureMismatch)?;
        let body = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenRejection::SignatureMismatch)?;
        let claims: TokenClaims =
            serde_json::from_slice(&body).map_err(|_| TokenRejection::SignatureMismatch)?;
        let presented =
            blake3::Hash::from_hex(signature).map_err(|_| TokenRejection::SignatureMismatch)?;

        // blake3::Hash equality is constant time.
        if presented != self.sign(&claims) {
            return Err(TokenRejection::SignatureMismatch);
        }
        Ok(claims)
    }

    /// Full validation against what the caller expects the token to authorize.
    ///
    /// Checks run in a fixed order: signature, instance, consumed, expiry,
    /// actor, action, parameters. The first failure wins.
    pub fn validate(
        &self,
        token: &str,
        expected: &TokenBinding,
        consumed: &dyn ConsumedNonces,
    ) -> Result<TokenClaims, TokenRejection> {
        let claims = self.decode(token)?;
        let reject = |rejection: TokenRejection| {
            tracing::debug!(
                instance_id = %expected.instance_id,
                nonce = %claims.nonce,
                reason = %rejection,
                "confirmation token rejected"
            );
            Err(rejection)
        };

        if claims.instance_id != expected.instance_id {
            return reject(TokenRejection::InstanceMismatch);
        }
        if consumed.is_consumed(&claims.nonce) {
            return reject(TokenRejection::Consumed);
        }

        let now = self.clock.now().timestamp_millis();
        let age = now - claims.issued_at;
        if age > duration_millis(self.ttl) || -age > duration_millis(self.max_clock_skew) {
            return reject(TokenRejection::Expired);
        }

        if claims.actor_id != expected.actor_id {
            return reject(TokenRejection::ActorMismatch);
        }
        if claims.action != expected.action {
            return reject(TokenRejection::ActionMismatch);
        }
        if claims.parameter_digest != expected.parameter_digest {
            return reject(TokenRejection::ParameterMismatch);
        }
        Ok(claims)
    }

    pub fn expiry_of(&self, claims: &TokenClaims) -> DateTime<Utc> {
        let expires = claims.issued_at.saturating_add(duration_millis(self.ttl));
        Utc.timestamp_millis_opt(expires)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sign(&self, claims: &TokenClaims) -> blake3::Hash {
        blake3::keyed_hash(self.secret.key(), &claims.signing_bytes())
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter_digest;
    use chrono::Duration as ChronoDuration;
    use gatehouse_types::{ActorId, ManualClock, WorkflowInstanceId};
    use proptest::prelude::*;
    use serde_json::json;

    fn setup() -> (TokenManager, ManualClock) {
        let clock = ManualClock::default();
        let manager = TokenManager::new(TokenSecret::from_bytes([9u8; 32]), Arc::new(clock.clone()));
        (manager, clock)
    }

    fn binding() -> TokenBinding {
        TokenBinding::new(
            WorkflowInstanceId::new("thread:op-1"),
            ActorId::new("alice"),
            "access.submit_request",
            &json!({"identity": "alice", "items": ["vpn"]}),
        )
    }

    fn none() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_issue_then_validate() {
        let (manager, _) = setup();
        let issued = manager.issue(&binding()).unwrap();
        let claims = manager.validate(&issued.token, &binding(), &none()).unwrap();
        assert_eq!(claims, issued.claims);
        assert_eq!(claims.nonce.len(), 32);
    }

    #[test]
    fn test_expiry_boundaries() {
        let (manager, clock) = setup();
        let issued = manager.issue(&binding()).unwrap();

        clock.advance(ChronoDuration::seconds(29));
        assert!(manager.validate(&issued.token, &binding(), &none()).is_ok());

        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(
            manager.validate(&issued.token, &binding(), &none()),
            Err(TokenRejection::Expired)
        );
    }

    #[test]
    fn test_future_issue_beyond_skew_is_expired() {
        let (manager, clock) = setup();
        let issued = manager.issue(&binding()).unwrap();
        clock.advance(ChronoDuration::seconds(-10));
        assert_eq!(
            manager.validate(&issued.token, &binding(), &none()),
            Err(TokenRejection::Expired)
        );
        clock.advance(ChronoDuration::seconds(7));
        assert!(manager.validate(&issued.token, &binding(), &none()).is_ok());
    }

    #[test]
    fn test_consumed_reported_before_expiry() {
        let (manager, clock) = setup();
        let issued = manager.issue(&binding()).unwrap();
        let mut consumed = none();
        consumed.insert(issued.claims.nonce.clone());
        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(
            manager.validate(&issued.token, &binding(), &consumed),
            Err(TokenRejection::Consumed)
        );
    }

    #[test]
    fn test_binding_mismatches() {
        let (manager, _) = setup();
        let issued = manager.issue(&binding()).unwrap();

        let mut other = binding();
        other.instance_id = WorkflowInstanceId::new("thread:op-2");
        assert_eq!(
            manager.validate(&issued.token, &other, &none()),
            Err(TokenRejection::InstanceMismatch)
        );

        let mut other = binding();
        other.actor_id = ActorId::new("mallory");
        assert_eq!(
            manager.validate(&issued.token, &other, &none()),
            Err(TokenRejection::ActorMismatch)
        );

        let mut other = binding();
        other.action = "access.revoke".into();
        assert_eq!(
            manager.validate(&issued.token, &other, &none()),
            Err(TokenRejection::ActionMismatch)
        );

        let mut other = binding();
        other.parameter_digest = parameter_digest(&json!({"identity": "alice", "items": ["root"]}));
        assert_eq!(
            manager.validate(&issued.token, &other, &none()),
            Err(TokenRejection::ParameterMismatch)
        );
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let (manager, clock) = setup();
        let issued = manager.issue(&binding()).unwrap();
        let other = TokenManager::new(TokenSecret::from_bytes([1u8; 32]), Arc::new(clock));
        assert_eq!(
            other.validate(&issued.token, &binding(), &none()),
            Err(TokenRejection::SignatureMismatch)
        );
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let (manager, _) = setup();
        for token in ["", "no-dot", "!!!.abc", "e30.zz"] {
            assert_eq!(
                manager.decode(token),
                Err(TokenRejection::SignatureMismatch),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let (manager, _) = setup();
        let issued = manager.issue(&binding()).unwrap();
        let (_, signature) = issued.token.split_once('.').unwrap();

        let mut claims = issued.claims.clone();
        claims.actor_id = ActorId::new("mallory");
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
            signature
        );
        assert_eq!(manager.decode(&forged), Err(TokenRejection::SignatureMismatch));
    }

    #[test]
    fn test_nonces_unique() {
        let (manager, _) = setup();
        let a = manager.issue(&binding()).unwrap();
        let b = manager.issue(&binding()).unwrap();
        assert_ne!(a.claims.nonce, b.claims.nonce);
        assert_ne!(a.token, b.token);
    }

    proptest! {
        #[test]
        fn any_single_field_change_breaks_binding(
            actor in "[a-z]{1,8}",
            action in "[a-z.]{1,12}",
            item in "[a-z0-9-]{1,10}",
        ) {
            let (manager, _) = setup();
            let base = TokenBinding::new(
                WorkflowInstanceId::new("t:1"),
                ActorId::new(actor.clone()),
                action.clone(),
                &json!({"item": item.clone()}),
            );
            let issued = manager.issue(&base).unwrap();
            prop_assert!(manager.validate(&issued.token, &base, &none()).is_ok());

            let changed = TokenBinding::new(
                WorkflowInstanceId::new("t:1"),
                ActorId::new(actor),
                action,
                &json!({"item": format!("{item}x")}),
            );
            prop_assert_eq!(
                manager.validate(&issued.token, &changed, &none()),
                Err(TokenRejection::ParameterMismatch)
            );
        }
    }
}
