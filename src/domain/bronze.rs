use crate::domain::security::MetadataMap;
use crate::error::PipelineError;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire schema version for all tier envelopes.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Hard cap on a raw payload and on the whole bronze envelope.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Events older than this at ingestion are rejected.
pub const MAX_EVENT_AGE_HOURS: i64 = 24;

/// Default tolerance for producer clocks running ahead of ours.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Source platforms known to the pipeline. The admission allow-list is
/// configured separately; `Other` carries platforms admitted by a custom
/// allow-list entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourcePlatform {
    Aws,
    Azure,
    Gcp,
    Okta,
    Crowdstrike,
    #[serde(untagged)]
    Other(String),
}

impl SourcePlatform {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "aws" => SourcePlatform::Aws,
            "azure" => SourcePlatform::Azure,
            "gcp" => SourcePlatform::Gcp,
            "okta" => SourcePlatform::Okta,
            "crowdstrike" => SourcePlatform::Crowdstrike,
            other => SourcePlatform::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourcePlatform::Aws => "aws",
            SourcePlatform::Azure => "azure",
            SourcePlatform::Gcp => "gcp",
            SourcePlatform::Okta => "okta",
            SourcePlatform::Crowdstrike => "crowdstrike",
            SourcePlatform::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for SourcePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw platform event wrapped in the minimal ingestion envelope.
///
/// Bronze records are write-once: nothing mutates one after construction,
/// downstream tiers reference it only by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BronzeEvent {
    pub id: Uuid,
    pub client_id: String,
    pub source_platform: SourcePlatform,
    pub timestamp: DateTime<Utc>,
    /// Verbatim payload bytes as submitted; must parse as JSON.
    #[serde(with = "payload_bytes")]
    pub payload: Bytes,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_metadata: Option<MetadataMap>,
}

mod payload_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

impl BronzeEvent {
    pub fn new(
        client_id: impl Into<String>,
        source_platform: SourcePlatform,
        timestamp: DateTime<Utc>,
        payload: Bytes,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
            source_platform,
            timestamp,
            payload,
            schema_version: SCHEMA_VERSION.to_string(),
            security_context: None,
            audit_metadata: None,
        }
    }

    /// First-failure structural validation. Time checks use the default
    /// clock-skew budget; the admission validator applies the configured
    /// budget and allow-list on the ingestion path.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.validate_at(Utc::now(), Duration::seconds(DEFAULT_CLOCK_SKEW_SECS))
    }

    pub fn validate_at(&self, now: DateTime<Utc>, skew: Duration) -> Result<(), PipelineError> {
        if self.client_id.is_empty() {
            return Err(PipelineError::validation("client_id", "must not be empty"));
        }
        if self.id.is_nil() {
            return Err(PipelineError::validation("id", "must not be nil"));
        }
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(PipelineError::validation(
                "payload",
                format!(
                    "{} bytes exceeds maximum of {} bytes",
                    self.payload.len(),
                    MAX_PAYLOAD_BYTES
                ),
            ));
        }
        if serde_json::from_slice::<serde_json::Value>(&self.payload).is_err() {
            return Err(PipelineError::validation(
                "payload",
                "payload is not valid JSON",
            ));
        }
        if self.timestamp > now + skew {
            return Err(PipelineError::validation(
                "timestamp",
                "timestamp is beyond the clock skew budget",
            ));
        }
        if self.timestamp < now - Duration::hours(MAX_EVENT_AGE_HOURS) {
            return Err(PipelineError::validation(
                "timestamp",
                format!("event is older than {MAX_EVENT_AGE_HOURS}h"),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| PipelineError::internal(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::validation("json", e.to_string()))
    }

    /// Payload parsed as JSON; validation guarantees this succeeds for
    /// admitted records.
    pub fn payload_json(&self) -> Result<serde_json::Value, PipelineError> {
        serde_json::from_slice(&self.payload)
            .map_err(|_| PipelineError::validation("payload", "payload is not valid JSON"))
    }
}
