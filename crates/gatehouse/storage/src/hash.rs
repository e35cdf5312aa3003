use crate::model::{AuditAppend, AuditRecord};
use crate::{StorageError, StorageResult};

/// BLAKE3 over the record's content, its sequence and its predecessor's hash.
pub fn compute_audit_hash(
    event: &AuditAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "timestamp": event.timestamp,
        "instance_id": event.instance_id,
        "token_nonce": event.token_nonce,
        "actor": event.actor,
        "action": event.action,
        "parameters": event.parameters,
        "outcome": event.outcome,
        "idempotency_key": event.idempotency_key,
        "usage_units": event.usage_units,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

/// Check that `records` (oldest first) form an unbroken chain.
pub fn verify_chain(records: &[AuditRecord]) -> StorageResult<()> {
    let mut previous: Option<&AuditRecord> = None;
    for record in records {
        let expected_prev = previous.map(|p| p.hash.as_str());
        if record.previous_hash.as_deref() != expected_prev {
            return Err(StorageError::InvariantViolation(format!(
                "audit record {} does not link to its predecessor",
                record.sequence
            )));
        }
        if let Some(prev) = previous {
            if record.sequence != prev.sequence + 1 {
                return Err(StorageError::InvariantViolation(format!(
                    "audit sequence gap between {} and {}",
                    prev.sequence, record.sequence
                )));
            }
        }
        let recomputed = compute_audit_hash(&record.to_append(), expected_prev, record.sequence)?;
        if recomputed != record.hash {
            return Err(StorageError::InvariantViolation(format!(
                "audit record {} hash mismatch",
                record.sequence
            )));
        }
        previous = Some(record);
    }
    Ok(())
}
