use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Failed to parse {name}")),
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Admission gate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Token-bucket refill rate, events per second per client.
    pub rate_limit_rps: u32,
    pub burst: u32,
    pub max_batch_size: usize,
    /// Producer clocks may run ahead of ours by up to this much.
    pub clock_skew: Duration,
    /// Idle limiter shards older than this are reclaimed.
    pub limiter_idle_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit_rps: 1000,
            burst: 1000,
            max_batch_size: 1000,
            clock_skew: Duration::from_secs(300),
            limiter_idle_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Normalizer worker-pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    pub worker_pool_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_concurrent_transforms: usize,
    /// Deadline for a single transform.
    pub processing_timeout: Duration,
    /// Deadline for a single record end to end.
    pub record_timeout: Duration,
    pub retry_max: u32,
    pub retry_backoff: Duration,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            max_concurrent_transforms: 100,
            processing_timeout: Duration::from_secs(2),
            record_timeout: Duration::from_secs(5),
            retry_max: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Correlation engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    pub window: Duration,
    pub max_events_per_correlation: usize,
    pub worker_pool_size: usize,
    pub rule_timeout: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_events_per_correlation: 1000,
            worker_pool_size: 4,
            rule_timeout: Duration::from_secs(5),
        }
    }
}

/// Alert lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Process-global creation/update rate.
    pub rate_limit_rps: u32,
    pub burst: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rate_limit_rps: 100,
            burst: 1000,
        }
    }
}

/// Circuit breaker thresholds for the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitConfig {
    /// Error ratio at or above which the circuit opens.
    pub error_threshold: f64,
    /// Rolling window over which the ratio is computed.
    pub window: Duration,
    /// Open duration before a half-open probe.
    pub reset_timeout: Duration,
    /// Minimum observations before the circuit may open.
    pub min_requests: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            window: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(30),
            min_requests: 10,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub admission: AdmissionConfig,
    pub normalizer: NormalizerConfig,
    pub correlation: CorrelationConfig,
    pub alerts: AlertConfig,
    pub circuit: CircuitConfig,
    pub allowed_platforms: Vec<String>,
    pub sensitive_field_patterns: Vec<String>,
    pub shutdown_timeout: Duration,
    /// 32-byte hex master key for the local KMS; real deployments point the
    /// KMS abstraction at an external service instead.
    pub master_encryption_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            normalizer: NormalizerConfig::default(),
            correlation: CorrelationConfig::default(),
            alerts: AlertConfig::default(),
            circuit: CircuitConfig::default(),
            allowed_platforms: ["aws", "azure", "gcp", "okta", "crowdstrike"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sensitive_field_patterns: crate::domain::security::DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            shutdown_timeout: Duration::from_secs(30),
            master_encryption_key: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment with production defaults.
    ///
    /// The rate limit unit at the admission boundary is events per second.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        Ok(Self {
            admission: AdmissionConfig {
                rate_limit_rps: env_parse("ADMISSION_RATE_LIMIT_RPS", 1000)?,
                burst: env_parse("ADMISSION_BURST", 1000)?,
                max_batch_size: env_parse("ADMISSION_MAX_BATCH_SIZE", 1000)?,
                clock_skew: Duration::from_secs(env_parse("ADMISSION_CLOCK_SKEW_SECS", 300u64)?),
                limiter_idle_ttl: Duration::from_secs(env_parse(
                    "ADMISSION_LIMITER_IDLE_TTL_SECS",
                    1800u64,
                )?),
            },
            normalizer: NormalizerConfig {
                worker_pool_size: env_parse("NORMALIZER_WORKERS", 10)?,
                batch_size: env_parse("NORMALIZER_BATCH_SIZE", 1000)?,
                flush_interval: Duration::from_millis(env_parse(
                    "NORMALIZER_FLUSH_INTERVAL_MS",
                    1000u64,
                )?),
                max_concurrent_transforms: env_parse("NORMALIZER_MAX_CONCURRENT_TRANSFORMS", 100)?,
                processing_timeout: Duration::from_millis(env_parse(
                    "NORMALIZER_PROCESSING_TIMEOUT_MS",
                    2000u64,
                )?),
                record_timeout: Duration::from_millis(env_parse(
                    "NORMALIZER_RECORD_TIMEOUT_MS",
                    5000u64,
                )?),
                retry_max: env_parse("NORMALIZER_RETRY_MAX", 3)?,
                retry_backoff: Duration::from_millis(env_parse(
                    "NORMALIZER_RETRY_BACKOFF_MS",
                    100u64,
                )?),
            },
            correlation: CorrelationConfig {
                window: Duration::from_secs(env_parse("CORRELATION_WINDOW_SECS", 900u64)?),
                max_events_per_correlation: env_parse("CORRELATION_MAX_EVENTS", 1000)?,
                worker_pool_size: env_parse("CORRELATION_WORKERS", 4)?,
                rule_timeout: Duration::from_millis(env_parse(
                    "CORRELATION_RULE_TIMEOUT_MS",
                    5000u64,
                )?),
            },
            alerts: AlertConfig {
                rate_limit_rps: env_parse("ALERT_RATE_LIMIT_RPS", 100)?,
                burst: env_parse("ALERT_BURST", 1000)?,
            },
            circuit: CircuitConfig {
                error_threshold: env_parse("CIRCUIT_ERROR_THRESHOLD", 0.5)?,
                window: Duration::from_secs(env_parse("CIRCUIT_WINDOW_SECS", 30u64)?),
                reset_timeout: Duration::from_secs(env_parse("CIRCUIT_RESET_TIMEOUT_SECS", 30u64)?),
                min_requests: env_parse("CIRCUIT_MIN_REQUESTS", 10u64)?,
            },
            allowed_platforms: env_list("ALLOWED_PLATFORMS", &defaults.allowed_platforms_ref()),
            sensitive_field_patterns: env_list(
                "SENSITIVE_FIELD_PATTERNS",
                &defaults.sensitive_patterns_ref(),
            ),
            shutdown_timeout: Duration::from_secs(env_parse("SHUTDOWN_TIMEOUT_SECS", 30u64)?),
            master_encryption_key: env::var("MASTER_ENCRYPTION_KEY").ok(),
        })
    }

    fn allowed_platforms_ref(&self) -> Vec<&str> {
        self.allowed_platforms.iter().map(|s| s.as_str()).collect()
    }

    fn sensitive_patterns_ref(&self) -> Vec<&str> {
        self.sensitive_field_patterns
            .iter()
            .map(|s| s.as_str())
            .collect()
    }

    pub fn master_key_bytes(&self) -> Result<Vec<u8>> {
        let raw = self
            .master_encryption_key
            .as_deref()
            .context("MASTER_ENCRYPTION_KEY must be set (32 bytes hex)")?;
        hex::decode(raw).context("Failed to decode master key from hex")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.admission.rate_limit_rps, 1000);
        assert_eq!(cfg.admission.burst, 1000);
        assert_eq!(cfg.normalizer.worker_pool_size, 10);
        assert_eq!(cfg.normalizer.batch_size, 1000);
        assert_eq!(cfg.normalizer.flush_interval, Duration::from_secs(1));
        assert_eq!(cfg.correlation.window, Duration::from_secs(900));
        assert_eq!(cfg.correlation.worker_pool_size, 4);
        assert_eq!(cfg.circuit.error_threshold, 0.5);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(cfg.allowed_platforms.len(), 5);
    }

    #[test]
    fn test_master_key_decoding() {
        let mut cfg = Config::default();
        cfg.master_encryption_key = Some(hex::encode([0x42u8; 32]));
        assert_eq!(cfg.master_key_bytes().unwrap().len(), 32);

        cfg.master_encryption_key = Some("not-hex".to_string());
        assert!(cfg.master_key_bytes().is_err());

        cfg.master_encryption_key = None;
        assert!(cfg.master_key_bytes().is_err());
    }
}
