use crate::error::PipelineError;
use crate::normalize::validator::{is_valid_ipv4, is_valid_port, parse_rfc3339};
use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

/// Built-in source-to-canonical field mappings. Canonical names map to
/// themselves so re-mapping an already-canonical record is a no-op.
static STANDARD_MAPPINGS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // network
        ("source_ip", "src_ip"),
        ("src", "src_ip"),
        ("source.ip", "src_ip"),
        ("sourceipaddress", "src_ip"),
        ("src_ip", "src_ip"),
        ("destination_ip", "dst_ip"),
        ("dest_ip", "dst_ip"),
        ("dest.ip", "dst_ip"),
        ("destination.ip", "dst_ip"),
        ("dst_ip", "dst_ip"),
        ("source_port", "src_port"),
        ("src_port", "src_port"),
        ("destination_port", "dst_port"),
        ("dest_port", "dst_port"),
        ("dst_port", "dst_port"),
        ("protocol", "protocol"),
        // identity
        ("user", "username"),
        ("user_name", "username"),
        ("useridentity.username", "username"),
        ("username", "username"),
        ("email_address", "email"),
        ("email", "email"),
        ("host", "hostname"),
        ("computer_name", "hostname"),
        ("hostname", "hostname"),
        // event identity
        ("type", "event_type"),
        ("event_name", "event_type"),
        ("eventname", "event_type"),
        ("eventtype", "event_type"),
        ("event_type", "event_type"),
        ("event_timestamp", "event_time"),
        ("timestamp", "event_time"),
        ("@timestamp", "event_time"),
        ("eventtime", "event_time"),
        ("event_time", "event_time"),
        // classification
        ("severity", "severity"),
        ("action", "action"),
        ("status", "status"),
        ("result", "status"),
    ])
});

/// Canonical fields whose values are lowercased enum-like strings.
const ENUM_FIELDS: &[&str] = &["severity", "action", "status", "protocol"];

/// Event types treated as network-origin, requiring src/dst addresses.
static NETWORK_EVENT_MARKERS: &[&str] = &[
    "network",
    "connection",
    "firewall",
    "flow",
    "dns",
    "securityalert",
    "intrusion",
];

struct CachedPath {
    canonical: Option<String>,
    last_accessed: Instant,
}

/// Deterministic source-to-canonical field mapper.
///
/// A static standard table composes with a per-deployment custom table;
/// custom entries win. Output keeps only mapped keys plus explicit
/// pass-through keys. Repeated nested-path resolutions go through a
/// bounded cache; staleness is harmless because tables only change on
/// configuration reload.
pub struct FieldMapper {
    custom: HashMap<String, String>,
    passthrough: HashSet<String>,
    cache: RwLock<HashMap<String, CachedPath>>,
    max_cache_entries: usize,
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self::new(HashMap::new(), HashSet::new())
    }
}

impl FieldMapper {
    pub fn new(custom: HashMap<String, String>, passthrough: HashSet<String>) -> Self {
        Self {
            custom: custom
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            passthrough,
            cache: RwLock::new(HashMap::new()),
            max_cache_entries: 4096,
        }
    }

    /// Map a parsed payload into canonical fields with coerced values.
    pub fn map(&self, payload: &Value) -> Result<BTreeMap<String, Value>, PipelineError> {
        let object = payload
            .as_object()
            .ok_or_else(|| PipelineError::validation("payload", "payload must be a JSON object"))?;

        let mut flat = Vec::new();
        flatten_into("", object, &mut flat);

        let mut mapped = BTreeMap::new();
        for (path, value) in flat {
            if let Some(canonical) = self.resolve(&path) {
                let coerced = coerce(&canonical, value)?;
                mapped.insert(canonical, coerced);
            } else if self.passthrough.contains(&path) {
                mapped.insert(path, value);
            }
        }
        Ok(mapped)
    }

    /// Resolve a (possibly dotted) source path to its canonical name.
    fn resolve(&self, path: &str) -> Option<String> {
        let lowered = path.to_lowercase();

        if let Some(hit) = self.cache_get(&lowered) {
            return hit;
        }

        let resolved = self
            .custom
            .get(&lowered)
            .cloned()
            .or_else(|| STANDARD_MAPPINGS.get(lowered.as_str()).map(|c| c.to_string()));

        self.cache_put(lowered, resolved.clone());
        resolved
    }

    fn cache_get(&self, path: &str) -> Option<Option<String>> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.get_mut(path).map(|entry| {
            entry.last_accessed = Instant::now();
            entry.canonical.clone()
        })
    }

    fn cache_put(&self, path: String, canonical: Option<String>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= self.max_cache_entries {
            // Evict the least recently used entry.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            path,
            CachedPath {
                canonical,
                last_accessed: Instant::now(),
            },
        );
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Post-mapping required-field check. Network-origin events must carry
    /// both addresses in addition to the base fields.
    pub fn check_required(&self, mapped: &BTreeMap<String, Value>) -> Result<(), PipelineError> {
        for field in ["event_type", "event_time"] {
            if !mapped.contains_key(field) {
                return Err(PipelineError::validation(
                    field,
                    "required canonical field missing after mapping",
                ));
            }
        }
        let event_type = mapped
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if is_network_event(event_type) {
            for field in ["src_ip", "dst_ip"] {
                if !mapped.contains_key(field) {
                    return Err(PipelineError::validation(
                        field,
                        format!("required for network event type {event_type}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub fn is_network_event(event_type: &str) -> bool {
    let lowered = event_type.to_lowercase();
    NETWORK_EVENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Flatten nested objects into dotted paths; arrays and scalars stay as
/// leaf values.
fn flatten_into(prefix: &str, object: &serde_json::Map<String, Value>, out: &mut Vec<(String, Value)>) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten_into(&path, inner, out),
            other => out.push((path, other.clone())),
        }
    }
}

/// Type coercion applied after rename.
fn coerce(canonical: &str, value: Value) -> Result<Value, PipelineError> {
    match canonical {
        "src_ip" | "dst_ip" => {
            let raw = value
                .as_str()
                .ok_or_else(|| PipelineError::validation(canonical, "expected an IPv4 string"))?;
            if !is_valid_ipv4(raw) {
                return Err(PipelineError::validation(
                    canonical,
                    format!("{raw} is not a valid IPv4 address"),
                ));
            }
            Ok(Value::String(raw.to_string()))
        }
        "src_port" | "dst_port" => {
            let port = match &value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| PipelineError::validation(canonical, "expected a port number"))?;
            if !is_valid_port(port) {
                return Err(PipelineError::validation(
                    canonical,
                    format!("port {port} outside [0, 65535]"),
                ));
            }
            Ok(Value::Number(port.into()))
        }
        "event_time" => {
            let parsed = match &value {
                Value::String(s) => parse_rfc3339(s),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                _ => None,
            }
            .ok_or_else(|| {
                PipelineError::validation(canonical, "expected an RFC3339 or epoch timestamp")
            })?;
            Ok(Value::String(parsed.to_rfc3339()))
        }
        field if ENUM_FIELDS.contains(&field) => {
            let raw = value
                .as_str()
                .ok_or_else(|| PipelineError::validation(canonical, "expected a string"))?;
            Ok(Value::String(raw.to_lowercase()))
        }
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapper() -> FieldMapper {
        FieldMapper::default()
    }

    #[test]
    fn test_standard_renames() {
        let mapped = mapper()
            .map(&json!({
                "source_ip": "192.168.1.1",
                "destination_port": 443,
                "event_timestamp": "2024-01-20T10:00:00Z",
                "type": "SecurityAlert"
            }))
            .unwrap();

        assert_eq!(mapped["src_ip"], json!("192.168.1.1"));
        assert_eq!(mapped["dst_port"], json!(443));
        assert_eq!(mapped["event_type"], json!("SecurityAlert"));
        assert!(mapped.contains_key("event_time"));
    }

    #[test]
    fn test_nested_path_resolution() {
        let mapped = mapper()
            .map(&json!({
                "source": {"ip": "192.168.1.1"},
                "dest": {"ip": "10.0.0.1"},
                "timestamp": "2024-01-20T10:00:00Z",
                "type": "SecurityAlert"
            }))
            .unwrap();

        assert_eq!(mapped["src_ip"], json!("192.168.1.1"));
        assert_eq!(mapped["dst_ip"], json!("10.0.0.1"));
    }

    #[test]
    fn test_unmapped_keys_dropped() {
        let mapped = mapper()
            .map(&json!({"type": "Login", "internal_debug": "x"}))
            .unwrap();
        assert!(!mapped.contains_key("internal_debug"));
    }

    #[test]
    fn test_passthrough_keys_kept() {
        let mapper = FieldMapper::new(
            HashMap::new(),
            HashSet::from(["request_id".to_string()]),
        );
        let mapped = mapper
            .map(&json!({"type": "Login", "request_id": "r-1"}))
            .unwrap();
        assert_eq!(mapped["request_id"], json!("r-1"));
    }

    #[test]
    fn test_custom_table_overrides_standard() {
        let mapper = FieldMapper::new(
            HashMap::from([("type".to_string(), "alert_kind".to_string())]),
            HashSet::new(),
        );
        let mapped = mapper.map(&json!({"type": "Login"})).unwrap();
        assert_eq!(mapped["alert_kind"], json!("Login"));
        assert!(!mapped.contains_key("event_type"));
    }

    #[test]
    fn test_invalid_ipv4_rejected() {
        let err = mapper()
            .map(&json!({"source_ip": "999.1.1.1"}))
            .unwrap_err();
        assert!(err.to_string().contains("src_ip"));
    }

    #[test]
    fn test_port_bounds() {
        assert!(mapper().map(&json!({"dst_port": 65535})).is_ok());
        assert!(mapper().map(&json!({"dst_port": 65536})).is_err());
        assert!(mapper().map(&json!({"dst_port": "8080"})).is_ok());
    }

    #[test]
    fn test_epoch_timestamp_coerced() {
        let mapped = mapper().map(&json!({"timestamp": 1705744800})).unwrap();
        let rendered = mapped["event_time"].as_str().unwrap();
        assert!(rendered.starts_with("2024-01-20"));
    }

    #[test]
    fn test_enum_case_normalized() {
        let mapped = mapper().map(&json!({"severity": "HIGH"})).unwrap();
        assert_eq!(mapped["severity"], json!("high"));
    }

    #[test]
    fn test_mapping_idempotent() {
        let first = mapper()
            .map(&json!({
                "source": {"ip": "192.168.1.1"},
                "destination_port": 443,
                "timestamp": "2024-01-20T10:00:00Z",
                "type": "SecurityAlert"
            }))
            .unwrap();

        let as_value = Value::Object(first.clone().into_iter().collect());
        let second = mapper().map(&as_value).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_required_fields_for_network_events() {
        let m = mapper();
        let complete = m
            .map(&json!({
                "source": {"ip": "192.168.1.1"},
                "dest": {"ip": "10.0.0.1"},
                "timestamp": "2024-01-20T10:00:00Z",
                "type": "NetworkConnection"
            }))
            .unwrap();
        assert!(m.check_required(&complete).is_ok());

        let missing = m
            .map(&json!({
                "source": {"ip": "192.168.1.1"},
                "timestamp": "2024-01-20T10:00:00Z",
                "type": "NetworkConnection"
            }))
            .unwrap();
        let err = m.check_required(&missing).unwrap_err();
        assert!(err.to_string().contains("dst_ip"));
    }

    #[test]
    fn test_non_network_events_skip_address_check() {
        let m = mapper();
        let mapped = m
            .map(&json!({
                "timestamp": "2024-01-20T10:00:00Z",
                "type": "UserLogin"
            }))
            .unwrap();
        assert!(m.check_required(&mapped).is_ok());
    }

    #[test]
    fn test_cache_populated_and_bounded() {
        let m = FieldMapper::new(HashMap::new(), HashSet::new());
        m.map(&json!({"source": {"ip": "192.168.1.1"}})).unwrap();
        assert!(m.cache_len() >= 1);
        for i in 0..5000 {
            m.resolve(&format!("unknown_field_{i}"));
        }
        assert!(m.cache_len() <= 4096);
    }
}
