use crate::domain::bronze::{BronzeEvent, MAX_EVENT_AGE_HOURS, MAX_PAYLOAD_BYTES};
use crate::error::PipelineError;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::RegexSet;
use std::collections::HashSet;

/// Maximum nesting depth accepted for any JSON payload.
pub const MAX_JSON_DEPTH: usize = 20;

static SQL_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bunion\s+select\b",
        r"(?i)\bselect\s+.{0,80}\bfrom\b",
        r"(?i)\binsert\s+into\b",
        r"(?i)\bdrop\s+table\b",
        r"(?i)\bdelete\s+from\b",
        r"(?i)\bor\s+1\s*=\s*1\b",
    ])
    .expect("sql injection patterns")
});

static SCRIPT_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)<script\b",
        r"(?i)javascript:",
        r"(?i)\bon(error|load|click)\s*=",
        r"(?i)\beval\s*\(",
        r"(?i)document\.cookie",
    ])
    .expect("script injection patterns")
});

static SHELL_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i);\s*rm\s+-rf\b",
        r"(?i)\|\s*(sh|bash)\b",
        r"(?i)\bchmod\s+777\b",
        r"\$\([^)]*\)",
        r"(?i)/etc/(passwd|shadow)\b",
        r"(?i)\bnc\s+-e\b",
    ])
    .expect("shell injection patterns")
});

/// Validation failure classes, used for per-class metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Size,
    Json,
    Schema,
    Pattern,
    Time,
    Platform,
}

/// Stateless bronze-record validator.
///
/// Checks run in a fixed order (size, parse, schema, patterns, time,
/// platform) and exit on the first failure. The validator performs no I/O
/// and the same input always yields the same result for a fixed `now`.
#[derive(Debug, Clone)]
pub struct EventValidator {
    allowed_platforms: HashSet<String>,
    clock_skew: Duration,
    max_payload_bytes: usize,
    max_depth: usize,
}

impl EventValidator {
    pub fn new(allowed_platforms: &[String], clock_skew: std::time::Duration) -> Self {
        Self {
            allowed_platforms: allowed_platforms
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            clock_skew: Duration::seconds(clock_skew.as_secs() as i64),
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            max_depth: MAX_JSON_DEPTH,
        }
    }

    pub fn validate(&self, event: &BronzeEvent) -> Result<(), PipelineError> {
        self.validate_at(event, Utc::now())
    }

    pub fn validate_at(
        &self,
        event: &BronzeEvent,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        // 1. Size
        if event.payload.len() > self.max_payload_bytes {
            return Err(PipelineError::validation(
                "payload",
                format!(
                    "{} bytes exceeds maximum of {} bytes",
                    event.payload.len(),
                    self.max_payload_bytes
                ),
            ));
        }

        // 2. JSON parse
        let parsed: serde_json::Value = serde_json::from_slice(&event.payload)
            .map_err(|_| PipelineError::validation("payload", "payload is not valid JSON"))?;

        if json_depth(&parsed) > self.max_depth {
            return Err(PipelineError::validation(
                "payload",
                format!("JSON nesting exceeds depth {}", self.max_depth),
            ));
        }

        // 3. Schema
        if event.id.is_nil() {
            return Err(PipelineError::validation("id", "must not be nil"));
        }
        if event.client_id.is_empty() {
            return Err(PipelineError::validation("client_id", "must not be empty"));
        }
        if event.schema_version.is_empty() {
            return Err(PipelineError::validation(
                "schema_version",
                "must not be empty",
            ));
        }

        // 4. Safety patterns. A hit is a security rejection, not a plain
        // validation failure.
        let text = String::from_utf8_lossy(&event.payload);
        if SQL_INJECTION_PATTERNS.is_match(&text) {
            return Err(PipelineError::security("SQL injection pattern in payload"));
        }
        if SCRIPT_INJECTION_PATTERNS.is_match(&text) {
            return Err(PipelineError::security(
                "script injection pattern in payload",
            ));
        }
        if SHELL_INJECTION_PATTERNS.is_match(&text) {
            return Err(PipelineError::security(
                "shell injection pattern in payload",
            ));
        }

        // 5. Time window
        if event.timestamp > now + self.clock_skew {
            return Err(PipelineError::validation(
                "timestamp",
                "timestamp is beyond the clock skew budget",
            ));
        }
        if event.timestamp < now - Duration::hours(MAX_EVENT_AGE_HOURS) {
            return Err(PipelineError::validation(
                "timestamp",
                format!("event is older than {MAX_EVENT_AGE_HOURS}h"),
            ));
        }

        // 6. Platform allow-list
        if !self
            .allowed_platforms
            .contains(&event.source_platform.as_str().to_lowercase())
        {
            return Err(PipelineError::validation(
                "source_platform",
                format!("platform {} is not allowed", event.source_platform),
            ));
        }

        Ok(())
    }

    /// Failure class of a validator error, for per-class counters.
    pub fn classify(err: &PipelineError) -> FailureClass {
        match err {
            PipelineError::SecurityViolation { .. } => FailureClass::Pattern,
            PipelineError::Validation { field, message } => match field.as_str() {
                "payload" if message.contains("bytes") || message.contains("depth") => {
                    FailureClass::Size
                }
                "payload" => FailureClass::Json,
                "timestamp" => FailureClass::Time,
                "source_platform" => FailureClass::Platform,
                _ => FailureClass::Schema,
            },
            _ => FailureClass::Schema,
        }
    }
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        serde_json::Value::Array(items) => {
            1 + items.iter().map(json_depth).max().unwrap_or(0)
        }
        _ => 0,
    }
}

/// Primitive-class checks shared with the mapper.
pub fn is_valid_ipv4(value: &str) -> bool {
    value.parse::<std::net::Ipv4Addr>().is_ok()
}

pub fn is_valid_port(value: i64) -> bool {
    (0..=65535).contains(&value)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bronze::SourcePlatform;
    use crate::error::ErrorKind;
    use bytes::Bytes;

    fn validator() -> EventValidator {
        EventValidator::new(
            &["aws".to_string(), "azure".to_string(), "okta".to_string()],
            std::time::Duration::from_secs(300),
        )
    }

    fn event_with_payload(payload: &str) -> BronzeEvent {
        BronzeEvent::new(
            "c1",
            SourcePlatform::Aws,
            Utc::now(),
            Bytes::from(payload.to_string()),
        )
    }

    #[test]
    fn test_clean_event_passes() {
        let ev = event_with_payload(r#"{"source":{"ip":"192.168.1.1"},"type":"SecurityAlert"}"#);
        assert!(validator().validate(&ev).is_ok());
    }

    #[test]
    fn test_sql_injection_is_security_rejection() {
        let ev = event_with_payload(r#"{"query":"1 UNION SELECT * FROM users"}"#);
        let err = validator().validate(&ev).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert_eq!(EventValidator::classify(&err), FailureClass::Pattern);
    }

    #[test]
    fn test_script_injection_detected() {
        let ev = event_with_payload(r#"{"body":"<script>alert(1)</script>"}"#);
        assert_eq!(
            validator().validate(&ev).unwrap_err().kind(),
            ErrorKind::Security
        );
    }

    #[test]
    fn test_shell_injection_detected() {
        let ev = event_with_payload(r#"{"cmd":"x; rm -rf /"}"#);
        assert_eq!(
            validator().validate(&ev).unwrap_err().kind(),
            ErrorKind::Security
        );
    }

    #[test]
    fn test_disallowed_platform_rejected() {
        let mut ev = event_with_payload(r#"{"a":1}"#);
        ev.source_platform = SourcePlatform::Gcp;
        let err = validator().validate(&ev).unwrap_err();
        assert_eq!(EventValidator::classify(&err), FailureClass::Platform);
    }

    #[test]
    fn test_depth_limit() {
        let mut payload = String::new();
        for _ in 0..(MAX_JSON_DEPTH + 1) {
            payload.push_str(r#"{"n":"#);
        }
        payload.push('1');
        for _ in 0..(MAX_JSON_DEPTH + 1) {
            payload.push('}');
        }
        let ev = event_with_payload(&payload);
        let err = validator().validate(&ev).unwrap_err();
        assert_eq!(EventValidator::classify(&err), FailureClass::Size);
    }

    #[test]
    fn test_order_size_before_patterns() {
        // An oversize payload containing an injection string fails on size
        // first; the distinct security code is reserved for parseable events.
        let mut payload = format!(r#"{{"q":"UNION SELECT","pad":""#);
        payload.push_str(&"a".repeat(MAX_PAYLOAD_BYTES));
        payload.push_str("\"}");
        let ev = event_with_payload(&payload);
        let err = validator().validate(&ev).unwrap_err();
        assert_eq!(EventValidator::classify(&err), FailureClass::Size);
    }

    #[test]
    fn test_time_window_boundaries() {
        let v = validator();
        let now = Utc::now();
        let mut ev = event_with_payload(r#"{"a":1}"#);

        ev.timestamp = now - Duration::hours(24) + Duration::seconds(1);
        assert!(v.validate_at(&ev, now).is_ok());

        ev.timestamp = now - Duration::hours(24) - Duration::seconds(1);
        let err = v.validate_at(&ev, now).unwrap_err();
        assert_eq!(EventValidator::classify(&err), FailureClass::Time);
    }

    #[test]
    fn test_determinism() {
        let v = validator();
        let now = Utc::now();
        let ev = event_with_payload(r#"{"a":1}"#);
        for _ in 0..3 {
            assert!(v.validate_at(&ev, now).is_ok());
        }
    }

    #[test]
    fn test_primitive_checks() {
        assert!(is_valid_ipv4("192.168.1.1"));
        assert!(!is_valid_ipv4("999.0.0.1"));
        assert!(!is_valid_ipv4("not-an-ip"));
        assert!(is_valid_port(0));
        assert!(is_valid_port(65535));
        assert!(!is_valid_port(65536));
        assert!(parse_rfc3339("2024-01-20T10:00:00Z").is_some());
        assert!(parse_rfc3339("yesterday").is_none());
    }
}
