use crate::domain::bronze::BronzeEvent;
use crate::domain::security::{EncryptionInfo, SecurityContext, SensitiveFieldPolicy};
use crate::domain::silver::{SilverEvent, MAX_FIELD_LENGTH};
use crate::error::PipelineError;
use crate::infrastructure::crypto::{FieldEncryptor, AEAD_ALGORITHM};
use crate::normalize::validator::parse_rfc3339;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Per-field transform closure applied before encryption.
pub type FieldTransform =
    Arc<dyn Fn(&Value) -> Result<Value, PipelineError> + Send + Sync>;

/// Bronze-to-silver assembly stage.
///
/// Concurrency is capped by a semaphore sized from configuration; a full
/// semaphore rejects immediately with a capacity error rather than
/// queueing. The whole transform runs under a deadline and either emits a
/// fully validated silver record or nothing.
pub struct Transformer {
    semaphore: Arc<Semaphore>,
    encryptor: Arc<FieldEncryptor>,
    policy: SensitiveFieldPolicy,
    transforms: HashMap<String, FieldTransform>,
    max_field_length: usize,
    timeout: Duration,
}

impl Transformer {
    pub fn new(
        encryptor: Arc<FieldEncryptor>,
        policy: SensitiveFieldPolicy,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            encryptor,
            policy,
            transforms: HashMap::new(),
            max_field_length: MAX_FIELD_LENGTH,
            timeout,
        }
    }

    /// Register a transform for one canonical field.
    pub fn register_transform(&mut self, field: impl Into<String>, transform: FieldTransform) {
        self.transforms.insert(field.into(), transform);
    }

    /// Produce a silver record from a bronze record and its mapped fields.
    pub async fn transform(
        &self,
        bronze: &BronzeEvent,
        mapped: BTreeMap<String, Value>,
    ) -> Result<SilverEvent, PipelineError> {
        let _permit =
            self.semaphore
                .try_acquire()
                .map_err(|_| PipelineError::CapacityExhausted {
                    resource: "transformer".to_string(),
                })?;

        tokio::time::timeout(self.timeout, self.assemble(bronze, mapped))
            .await
            .map_err(|_| PipelineError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn assemble(
        &self,
        bronze: &BronzeEvent,
        mut mapped: BTreeMap<String, Value>,
    ) -> Result<SilverEvent, PipelineError> {
        // Registered per-field transforms first, so length and sensitivity
        // checks see the final values.
        for (field, transform) in &self.transforms {
            if let Some(value) = mapped.get(field) {
                let replaced = transform(value)?;
                mapped.insert(field.clone(), replaced);
            }
        }

        for (key, value) in &mapped {
            if let Some(s) = value.as_str() {
                if s.len() > self.max_field_length {
                    return Err(PipelineError::validation(
                        key.clone(),
                        format!("exceeds maximum field length {}", self.max_field_length),
                    ));
                }
            }
        }

        let event_type = mapped
            .remove("event_type")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| PipelineError::validation("event_type", "missing after mapping"))?;

        let event_time = match mapped.remove("event_time") {
            Some(Value::String(raw)) => parse_rfc3339(&raw).ok_or_else(|| {
                PipelineError::validation("event_time", "not a valid RFC3339 timestamp")
            })?,
            _ => bronze.timestamp,
        };

        let security_context = build_security_context(bronze);

        let mut silver = SilverEvent::new(
            bronze.client_id.clone(),
            event_type,
            event_time,
            bronze.id,
            security_context,
        );

        // Sensitive values move into the encrypted map; plaintext never
        // lands in normalized_data.
        let key_ref = format!("client/{}", bronze.client_id);
        let mut encryption_info = None;
        for (key, value) in mapped {
            if self.policy.matches_substring(&key) {
                let plaintext = match &value {
                    Value::String(s) => s.clone().into_bytes(),
                    other => other.to_string().into_bytes(),
                };
                let envelope = self.encryptor.encrypt_field(&key_ref, &plaintext).await?;
                if encryption_info.is_none() {
                    encryption_info = Some(EncryptionInfo {
                        algorithm: AEAD_ALGORITHM.to_string(),
                        key_ref: envelope.key_ref.clone(),
                        key_version: envelope.key_version,
                    });
                }
                silver.encrypted_fields.insert(key, envelope);
            } else {
                silver.normalized_data.insert(key, value);
            }
        }
        silver.security_context.encryption = encryption_info;

        silver.validate()?;
        Ok(silver)
    }
}

fn build_security_context(bronze: &BronzeEvent) -> SecurityContext {
    match bronze.security_context.as_deref() {
        Some(raw) if !raw.is_empty() => {
            let mut ctx = SecurityContext::default();
            match raw.to_uppercase().as_str() {
                "PUBLIC" => ctx.classification = crate::domain::security::Classification::Public,
                "CONFIDENTIAL" => {
                    ctx.classification = crate::domain::security::Classification::Confidential
                }
                "RESTRICTED" => {
                    ctx.classification = crate::domain::security::Classification::Restricted
                }
                _ => {}
            }
            ctx
        }
        _ => SecurityContext::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bronze::SourcePlatform;
    use crate::domain::security::Classification;
    use crate::infrastructure::kms::LocalKms;
    use bytes::Bytes;
    use chrono::Utc;
    use serde_json::json;

    fn transformer(max_concurrent: usize) -> Transformer {
        let kms = Arc::new(LocalKms::new(vec![0x42u8; 32]).unwrap());
        Transformer::new(
            Arc::new(FieldEncryptor::new(kms)),
            SensitiveFieldPolicy::default(),
            max_concurrent,
            Duration::from_secs(2),
        )
    }

    fn bronze() -> BronzeEvent {
        BronzeEvent::new(
            "c1",
            SourcePlatform::Aws,
            Utc::now(),
            Bytes::from_static(br#"{"type":"SecurityAlert"}"#),
        )
    }

    fn mapped_fields() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("event_type".to_string(), json!("SecurityAlert")),
            ("event_time".to_string(), json!("2024-01-20T10:00:00+00:00")),
            ("src_ip".to_string(), json!("192.168.1.1")),
            ("dst_ip".to_string(), json!("10.0.0.1")),
        ])
    }

    #[tokio::test]
    async fn test_basic_transform() {
        let bronze = bronze();
        let silver = transformer(10)
            .transform(&bronze, mapped_fields())
            .await
            .unwrap();

        assert_eq!(silver.event_type, "SecurityAlert");
        assert_eq!(silver.client_id, "c1");
        assert_eq!(silver.bronze_event_id, bronze.id);
        assert!(silver.encrypted_fields.is_empty());
        assert_eq!(silver.security_context.classification, Classification::Internal);
        assert!(silver.validate().is_ok());
    }

    #[tokio::test]
    async fn test_sensitive_fields_encrypted() {
        let mut fields = mapped_fields();
        fields.insert("password".to_string(), json!("secret123"));
        fields.insert("api_key".to_string(), json!("k123"));
        fields.insert("auth_token".to_string(), json!("t123"));

        let silver = transformer(10).transform(&bronze(), fields).await.unwrap();

        for name in ["password", "api_key", "auth_token"] {
            assert!(!silver.normalized_data.contains_key(name));
            assert!(silver.encrypted_fields.contains_key(name));
        }
        let envelope = &silver.encrypted_fields["password"];
        assert!(!envelope.envelope.contains(&hex::encode(b"secret123")));
        assert!(silver.security_context.encryption.is_some());
    }

    #[tokio::test]
    async fn test_encrypted_values_recoverable() {
        let kms = Arc::new(LocalKms::new(vec![0x42u8; 32]).unwrap());
        let encryptor = Arc::new(FieldEncryptor::new(kms));
        let t = Transformer::new(
            encryptor.clone(),
            SensitiveFieldPolicy::default(),
            10,
            Duration::from_secs(2),
        );

        let mut fields = mapped_fields();
        fields.insert("password".to_string(), json!("secret123"));
        let silver = t.transform(&bronze(), fields).await.unwrap();

        let recovered = encryptor
            .decrypt_field(&silver.encrypted_fields["password"])
            .await
            .unwrap();
        assert_eq!(recovered, b"secret123");
    }

    #[tokio::test]
    async fn test_capacity_error_when_semaphore_full() {
        let t = transformer(0);
        let err = t.transform(&bronze(), mapped_fields()).await.unwrap_err();
        assert!(matches!(err, PipelineError::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn test_field_transform_applied() {
        let mut t = transformer(10);
        t.register_transform(
            "src_ip",
            Arc::new(|value| {
                let raw = value.as_str().unwrap_or_default();
                Ok(json!(format!("ip:{raw}")))
            }),
        );
        let silver = t.transform(&bronze(), mapped_fields()).await.unwrap();
        assert_eq!(silver.normalized_data["src_ip"], json!("ip:192.168.1.1"));
    }

    #[tokio::test]
    async fn test_oversized_field_rejected() {
        let mut fields = mapped_fields();
        fields.insert("process_args".to_string(), json!("x".repeat(5000)));
        let err = transformer(10)
            .transform(&bronze(), fields)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("process_args"));
    }

    #[tokio::test]
    async fn test_missing_event_type_rejected() {
        let mut fields = mapped_fields();
        fields.remove("event_type");
        assert!(transformer(10).transform(&bronze(), fields).await.is_err());
    }

    #[tokio::test]
    async fn test_event_time_falls_back_to_bronze_timestamp() {
        let bronze = bronze();
        let mut fields = mapped_fields();
        fields.remove("event_time");
        let silver = transformer(10).transform(&bronze, fields).await.unwrap();
        assert_eq!(silver.event_time, bronze.timestamp);
    }

    #[tokio::test]
    async fn test_security_context_hint_respected() {
        let mut b = bronze();
        b.security_context = Some("RESTRICTED".to_string());
        let silver = transformer(10).transform(&b, mapped_fields()).await.unwrap();
        assert_eq!(
            silver.security_context.classification,
            Classification::Restricted
        );
    }
}
