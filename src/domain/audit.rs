use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use uuid::Uuid;

/// Hash-chained pipeline audit record.
///
/// Records form a tamper-evident chain: each entry hashes its own content
/// together with the previous entry's hash. Security rejections are logged
/// with classification only, never with the offending payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event_type: String,
    pub client_id: Option<String>,
    pub subject_id: Option<Uuid>,
    pub actor: String,
    pub detail: serde_json::Value,
    pub prev_hash: String,
    pub current_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        event_type: impl Into<String>,
        actor: impl Into<String>,
        detail: serde_json::Value,
        client_id: Option<String>,
        subject_id: Option<Uuid>,
        prev_hash: String,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let event_type = event_type.into();
        let actor = actor.into();

        let current_hash = compute_record_hash(&id, &event_type, &actor, &detail, &prev_hash, &now);

        Self {
            id,
            event_type,
            client_id,
            subject_id,
            actor,
            detail,
            prev_hash,
            current_hash,
            created_at: now,
        }
    }

    pub fn verify_hash(&self) -> bool {
        let computed = compute_record_hash(
            &self.id,
            &self.event_type,
            &self.actor,
            &self.detail,
            &self.prev_hash,
            &self.created_at,
        );
        computed == self.current_hash
    }
}

pub fn compute_record_hash(
    id: &Uuid,
    event_type: &str,
    actor: &str,
    detail: &serde_json::Value,
    prev_hash: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(id.as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(actor.as_bytes());
    hasher.update(detail.to_string().as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_chain(records: &[AuditRecord]) -> bool {
    if records.is_empty() {
        return true;
    }

    for (i, record) in records.iter().enumerate() {
        if !record.verify_hash() {
            return false;
        }
        if i > 0 && records[i - 1].current_hash != record.prev_hash {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_hash_verification() {
        let record = AuditRecord::new(
            "admission.rejected",
            "admission",
            serde_json::json!({"code": "E4002"}),
            Some("c1".to_string()),
            None,
            "genesis".to_string(),
        );
        assert!(record.verify_hash());
    }

    #[test]
    fn test_chain_verification_detects_tampering() {
        let first = AuditRecord::new(
            "alert.created",
            "correlator",
            serde_json::json!({}),
            None,
            Some(Uuid::new_v4()),
            "genesis".to_string(),
        );
        let second = AuditRecord::new(
            "alert.status_changed",
            "analyst",
            serde_json::json!({"to": "acknowledged"}),
            None,
            None,
            first.current_hash.clone(),
        );

        assert!(verify_chain(&[first.clone(), second.clone()]));

        let mut tampered = second.clone();
        tampered.detail = serde_json::json!({"to": "closed"});
        assert!(!verify_chain(&[first, tampered]));
    }

    #[test]
    fn test_empty_chain_valid() {
        assert!(verify_chain(&[]));
    }
}
