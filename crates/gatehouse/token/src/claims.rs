use gatehouse_types::{ActorId, WorkflowInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a token is expected to authorize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBinding {
    pub instance_id: WorkflowInstanceId,
    pub actor_id: ActorId,
    pub action: String,
    pub parameter_digest: String,
}

impl TokenBinding {
    pub fn new(
        instance_id: WorkflowInstanceId,
        actor_id: ActorId,
        action: impl Into<String>,
        params: &Value,
    ) -> Self {
        Self {
            instance_id,
            actor_id,
            action: action.into(),
            parameter_digest: parameter_digest(params),
        }
    }
}

/// The signed body of a confirmation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub instance_id: WorkflowInstanceId,
    pub actor_id: ActorId,
    pub action: String,
    pub parameter_digest: String,
    /// Unix milliseconds
    pub issued_at: i64,
    pub nonce: String,
}

impl TokenClaims {
    /// Length-prefixed field encoding the MAC is computed over.
    pub(crate) fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        for field in [
            self.instance_id.as_str(),
            self.actor_id.as_str(),
            self.action.as_str(),
            self.parameter_digest.as_str(),
            self.nonce.as_str(),
        ] {
            out.extend_from_slice(&(field.len() as u64).to_le_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        out.extend_from_slice(&self.issued_at.to_le_bytes());
        out
    }
}

/// BLAKE3 over the canonical JSON form of `params`, hex encoded.
pub fn parameter_digest(params: &Value) -> String {
    blake3::hash(canonical_json(params).as_bytes())
        .to_hex()
        .to_string()
}

/// JSON with object keys sorted at every level and no insignificant whitespace.
///
/// Written out by hand so parameter digests stay the same whether or not
/// serde_json's `preserve_order` feature is enabled, and whatever order the
/// caller inserted map keys in.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [true, null], "y": "s"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":"s","z":[true,null]},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_ignores_insertion_order() {
        let mut forward = serde_json::Map::new();
        forward.insert("instance".into(), json!("t-1:7"));
        forward.insert("action".into(), json!("access.submit"));
        let mut reverse = serde_json::Map::new();
        reverse.insert("action".into(), json!("access.submit"));
        reverse.insert("instance".into(), json!("t-1:7"));

        let forward = Value::Object(forward);
        let reverse = Value::Object(reverse);
        assert_eq!(canonical_json(&forward), canonical_json(&reverse));
        assert_eq!(
            canonical_json(&forward),
            r#"{"action":"access.submit","instance":"t-1:7"}"#
        );
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(parameter_digest(&a), parameter_digest(&b));
    }

    #[test]
    fn test_digest_sensitive_to_values() {
        assert_ne!(
            parameter_digest(&json!({"items": ["a", "b"]})),
            parameter_digest(&json!({"items": ["b", "a"]}))
        );
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(keys in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 0..8)) {
            let forward: serde_json::Map<String, Value> =
                keys.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reversed: serde_json::Map<String, Value> =
                keys.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            prop_assert_eq!(
                parameter_digest(&Value::Object(forward)),
                parameter_digest(&Value::Object(reversed))
            );
        }
    }
}
