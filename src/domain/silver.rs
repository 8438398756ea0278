use crate::domain::security::{AuditMetadata, SecurityContext};
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Upper bound on `event_type` and on any single normalized field value.
pub const MAX_FIELD_LENGTH: usize = 4096;

fn default_schema_version() -> String {
    super::bronze::SCHEMA_VERSION.to_string()
}

/// Opaque ciphertext envelope for one sensitive field value.
///
/// The envelope carries everything needed to decrypt later except the key
/// itself: key reference and version for KMS resolution, and the
/// hex-encoded `nonce || ciphertext || tag` blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedValue {
    pub key_ref: String,
    pub key_version: u32,
    pub algorithm: String,
    /// Hex of nonce (12 bytes) followed by ciphertext and tag.
    pub envelope: String,
}

/// Normalized, field-mapped, selectively encrypted event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SilverEvent {
    pub event_id: Uuid,
    pub client_id: String,
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub bronze_event_id: Uuid,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Canonical keys to plaintext values. Sensitive keys never appear here.
    #[serde(default)]
    pub normalized_data: BTreeMap<String, serde_json::Value>,
    /// Canonical keys to ciphertext envelopes.
    #[serde(default)]
    pub encrypted_fields: BTreeMap<String, EncryptedValue>,
    pub security_context: SecurityContext,
    pub audit_metadata: AuditMetadata,
}

impl SilverEvent {
    pub fn new(
        client_id: impl Into<String>,
        event_type: impl Into<String>,
        event_time: DateTime<Utc>,
        bronze_event_id: Uuid,
        security_context: SecurityContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_id: Uuid::new_v4(),
            client_id: client_id.into(),
            event_type: event_type.into(),
            event_time,
            bronze_event_id,
            schema_version: super::bronze::SCHEMA_VERSION.to_string(),
            normalized_data: BTreeMap::new(),
            encrypted_fields: BTreeMap::new(),
            security_context,
            audit_metadata: AuditMetadata {
                created_at: now,
                normalized_at: now,
                source_event_id: bronze_event_id.to_string(),
                schema_version: super::bronze::SCHEMA_VERSION.to_string(),
            },
        }
    }

    /// First-failure structural validation with field paths.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.event_id.is_nil() {
            return Err(PipelineError::validation("event_id", "must not be nil"));
        }
        if self.client_id.is_empty() {
            return Err(PipelineError::validation("client_id", "must not be empty"));
        }
        if self.event_type.is_empty() {
            return Err(PipelineError::validation("event_type", "must not be empty"));
        }
        if self.event_type.len() > MAX_FIELD_LENGTH {
            return Err(PipelineError::validation(
                "event_type",
                format!("exceeds maximum length of {MAX_FIELD_LENGTH}"),
            ));
        }
        if self.bronze_event_id.is_nil() {
            return Err(PipelineError::validation(
                "bronze_event_id",
                "must reference an admitted bronze record",
            ));
        }
        for (key, value) in &self.normalized_data {
            if key.len() > MAX_FIELD_LENGTH {
                return Err(PipelineError::validation(
                    format!("normalized_data.{key}"),
                    "field name too long",
                ));
            }
            if let Some(s) = value.as_str() {
                if s.len() > MAX_FIELD_LENGTH {
                    return Err(PipelineError::validation(
                        format!("normalized_data.{key}"),
                        format!("exceeds maximum length of {MAX_FIELD_LENGTH}"),
                    ));
                }
            }
            if self.encrypted_fields.contains_key(key) {
                return Err(PipelineError::validation(
                    format!("normalized_data.{key}"),
                    "key present in both plaintext and encrypted maps",
                ));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| PipelineError::internal(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::validation("json", e.to_string()))
    }
}
