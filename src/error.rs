use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable, externally visible error codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// E1001 - authentication failure
    AuthenticationFailure,
    /// E1002 - authorization insufficient
    AuthorizationInsufficient,
    /// E2001 - integration configuration error
    IntegrationConfig,
    /// E3001 - data validation error
    DataValidation,
    /// E3002 - data corruption detected
    DataCorruption,
    /// E4001 - internal system error
    InternalSystem,
    /// E4002 - resource utilization warning (rate limit, capacity)
    ResourceUtilization,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailure => "E1001",
            ErrorCode::AuthorizationInsufficient => "E1002",
            ErrorCode::IntegrationConfig => "E2001",
            ErrorCode::DataValidation => "E3001",
            ErrorCode::DataCorruption => "E3002",
            ErrorCode::InternalSystem => "E4001",
            ErrorCode::ResourceUtilization => "E4002",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse classification used for propagation and retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Schema, type, size, timestamp, platform failures. Never retried.
    Validation,
    /// Rate limits, full semaphores, oversized batches. Retriable by the caller.
    Capacity,
    /// Bus or sink hiccups, KMS timeouts. Retried internally with backoff.
    Transient,
    /// Invariant violations, KMS auth failures. Escalated to the coordinator.
    Fatal,
    /// Injection patterns, credential leakage, scope violations. Rejected and audited.
    Security,
}

/// Pipeline-wide error type.
///
/// Every variant maps onto one of the stable `E…` codes and one
/// [`ErrorKind`]; messages pass through [`redact`] so credential-like
/// substrings never reach logs or callers.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("validation failed at {field}: {message}")]
    Validation { field: String, message: String },

    #[error("data corruption detected: {message}")]
    Corruption { message: String },

    #[error("security rejection: {message}")]
    SecurityViolation { message: String },

    #[error("rate limit exceeded for client {client_id}")]
    RateLimited {
        client_id: String,
        retry_after: Option<Duration>,
    },

    #[error("capacity exhausted: {resource}")]
    CapacityExhausted { resource: String },

    #[error("batch of {size} exceeds limit {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transient failure in {stage}: {message}")]
    Transient { stage: String, message: String },

    #[error("encryption failed: {message}")]
    EncryptionFailed { message: String },

    #[error("decryption failed for key ref {key_ref}")]
    DecryptionFailed { key_ref: String },

    #[error("key resolution failed: {message}")]
    KeyResolution { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("authorization insufficient: {message}")]
    Authorization { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("circuit breaker open for {stage}")]
    CircuitOpen { stage: String },

    #[error("shutdown did not complete within {timeout_ms}ms: {pending} records pending")]
    UncleanShutdown { timeout_ms: u64, pending: usize },

    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("record is outside its retention window")]
    OutOfRetention,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Validation {
            field: field.into(),
            message: redact(&message.into()),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        PipelineError::Corruption {
            message: redact(&message.into()),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        PipelineError::SecurityViolation {
            message: redact(&message.into()),
        }
    }

    pub fn transient(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Transient {
            stage: stage.into(),
            message: redact(&message.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PipelineError::Internal {
            message: redact(&message.into()),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: redact(&message.into()),
        }
    }

    /// Stable code surfaced to external callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Validation { .. }
            | PipelineError::IllegalTransition { .. }
            | PipelineError::OutOfRetention => ErrorCode::DataValidation,
            PipelineError::Corruption { .. } | PipelineError::DecryptionFailed { .. } => {
                ErrorCode::DataCorruption
            }
            PipelineError::SecurityViolation { .. } => ErrorCode::DataValidation,
            PipelineError::RateLimited { .. }
            | PipelineError::CapacityExhausted { .. }
            | PipelineError::BatchTooLarge { .. } => ErrorCode::ResourceUtilization,
            PipelineError::Authentication { .. } => ErrorCode::AuthenticationFailure,
            PipelineError::Authorization { .. } => ErrorCode::AuthorizationInsufficient,
            PipelineError::Configuration { .. } => ErrorCode::IntegrationConfig,
            PipelineError::Timeout { .. }
            | PipelineError::Transient { .. }
            | PipelineError::EncryptionFailed { .. }
            | PipelineError::KeyResolution { .. }
            | PipelineError::CircuitOpen { .. }
            | PipelineError::UncleanShutdown { .. }
            | PipelineError::Internal { .. } => ErrorCode::InternalSystem,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation { .. }
            | PipelineError::Corruption { .. }
            | PipelineError::IllegalTransition { .. }
            | PipelineError::OutOfRetention
            | PipelineError::DecryptionFailed { .. } => ErrorKind::Validation,
            PipelineError::SecurityViolation { .. }
            | PipelineError::Authentication { .. }
            | PipelineError::Authorization { .. } => ErrorKind::Security,
            PipelineError::RateLimited { .. }
            | PipelineError::CapacityExhausted { .. }
            | PipelineError::BatchTooLarge { .. } => ErrorKind::Capacity,
            PipelineError::Timeout { .. } | PipelineError::Transient { .. } => ErrorKind::Transient,
            PipelineError::EncryptionFailed { .. }
            | PipelineError::KeyResolution { .. }
            | PipelineError::Configuration { .. }
            | PipelineError::CircuitOpen { .. }
            | PipelineError::UncleanShutdown { .. }
            | PipelineError::Internal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the pipeline may retry this failure internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

static CREDENTIAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(password|passwd|api_key|apikey|key|token|secret|credential)\s*[=:]\s*\S+"#)
        .expect("credential redaction pattern")
});

/// Strip credential-like substrings from a message before it can reach a
/// log line or an error returned to a caller.
pub fn redact(message: &str) -> String {
    CREDENTIAL_PATTERN
        .replace_all(message, "$1=[REDACTED]")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(ErrorCode::AuthenticationFailure.as_str(), "E1001");
        assert_eq!(ErrorCode::AuthorizationInsufficient.as_str(), "E1002");
        assert_eq!(ErrorCode::IntegrationConfig.as_str(), "E2001");
        assert_eq!(ErrorCode::DataValidation.as_str(), "E3001");
        assert_eq!(ErrorCode::DataCorruption.as_str(), "E3002");
        assert_eq!(ErrorCode::InternalSystem.as_str(), "E4001");
        assert_eq!(ErrorCode::ResourceUtilization.as_str(), "E4002");
    }

    #[test]
    fn test_validation_maps_to_e3001() {
        let err = PipelineError::validation("payload", "not valid JSON");
        assert_eq!(err.code(), ErrorCode::DataValidation);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limit_maps_to_e4002() {
        let err = PipelineError::RateLimited {
            client_id: "c1".to_string(),
            retry_after: Some(Duration::from_millis(50)),
        };
        assert_eq!(err.code(), ErrorCode::ResourceUtilization);
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_is_retryable() {
        let err = PipelineError::transient("bus", "publish queue unavailable");
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::InternalSystem);
    }

    #[test]
    fn test_redaction_removes_credentials() {
        let redacted = redact("refused: password=hunter2 token=abc123 for client c1");
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("[REDACTED]"));
        assert!(redacted.contains("client c1"));
    }

    #[test]
    fn test_redaction_applied_by_constructors() {
        let err = PipelineError::validation("payload", "field secret=topsecret rejected");
        assert!(!err.to_string().contains("topsecret"));
    }

    #[test]
    fn test_decryption_failure_does_not_leak_ciphertext() {
        let err = PipelineError::DecryptionFailed {
            key_ref: "tenant-default".to_string(),
        };
        assert!(err.to_string().contains("tenant-default"));
        assert_eq!(err.code(), ErrorCode::DataCorruption);
    }
}
