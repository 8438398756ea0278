use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data classification attached to normalized records and alerts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Elevated,
    Severe,
}

/// Encryption details carried alongside a record so consumers know how
/// its sensitive fields were protected without holding key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub algorithm: String,
    pub key_ref: String,
    pub key_version: u32,
}

/// Security context for a silver record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityContext {
    pub classification: Classification,
    pub sensitivity: Sensitivity,
    pub compliance: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,
    #[serde(default)]
    pub access_tags: Vec<String>,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            classification: Classification::Internal,
            sensitivity: Sensitivity::Medium,
            compliance: vec!["DEFAULT".to_string()],
            encryption: None,
            access_tags: Vec::new(),
        }
    }
}

/// Security metadata for a gold alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityMetadata {
    pub classification: Classification,
    pub confidence: f64,
    pub threat_level: ThreatLevel,
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,
}

impl SecurityMetadata {
    pub fn new(confidence: f64, threat_level: ThreatLevel) -> Self {
        Self {
            classification: Classification::Confidential,
            confidence,
            threat_level,
            sensitivity: Sensitivity::High,
            tags: Vec::new(),
            encryption: None,
        }
    }
}

/// Compliance metadata for a gold alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceMetadata {
    #[serde(default)]
    pub standards: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    pub retention_days: u32,
    pub handling: String,
}

impl Default for ComplianceMetadata {
    fn default() -> Self {
        Self {
            standards: vec!["DEFAULT".to_string()],
            requirements: Vec::new(),
            retention_days: 365,
            handling: "standard".to_string(),
        }
    }
}

/// Audit metadata stamped onto silver records during normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditMetadata {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub normalized_at: chrono::DateTime<chrono::Utc>,
    pub source_event_id: String,
    pub schema_version: String,
}

/// Audit metadata carried by gold alerts across their lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertAuditMetadata {
    pub created_by: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub modified_by: String,
    pub modified_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub access_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_id: Option<String>,
}

impl AlertAuditMetadata {
    pub fn new(actor: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            created_by: actor.to_string(),
            created_at: now,
            modified_by: actor.to_string(),
            modified_at: now,
            access_log: Vec::new(),
            validation_id: None,
        }
    }

    pub fn touch(&mut self, actor: &str) {
        self.modified_by = actor.to_string();
        self.modified_at = chrono::Utc::now();
    }
}

/// Default canonical names whose values must only be stored encrypted.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "key",
    "token",
    "secret",
    "pii",
    "credentials",
    "auth_tokens",
    "ip_address",
    "username",
    "email",
    "hostname",
];

/// Decides which canonical field names carry sensitive values.
///
/// Normalization (bronze to silver) matches case-insensitive substrings so
/// platform variants like `api_key` or `AuthToken` are caught; alert
/// sealing (silver to gold) matches exact names only, case included.
#[derive(Debug, Clone)]
pub struct SensitiveFieldPolicy {
    patterns: Vec<String>,
}

impl Default for SensitiveFieldPolicy {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl SensitiveFieldPolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        let patterns = patterns.into_iter().filter(|p| !p.is_empty()).collect();
        Self { patterns }
    }

    /// Substring match, case-insensitive. Used on the normalization path.
    pub fn matches_substring(&self, field_name: &str) -> bool {
        let lower = field_name.to_lowercase();
        self.patterns
            .iter()
            .any(|p| lower.contains(p.to_lowercase().as_str()))
    }

    /// Exact, case-sensitive match. Used when the correlator seals alerts.
    pub fn matches_exact(&self, field_name: &str) -> bool {
        self.patterns.iter().any(|p| p.as_str() == field_name)
    }

    /// Configured patterns, original casing preserved.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Free-form metadata map used across envelopes.
pub type MetadataMap = HashMap<String, String>;
