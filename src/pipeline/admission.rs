use crate::application::audit_service::AuditService;
use crate::domain::bronze::{BronzeEvent, SourcePlatform, MAX_PAYLOAD_BYTES};
use crate::error::{ErrorKind, PipelineError};
use crate::infrastructure::bus::{MessageBus, BRONZE_TOPIC};
use crate::infrastructure::config::AdmissionConfig;
use crate::infrastructure::telemetry::PipelineMetrics;
use crate::normalize::validator::{parse_rfc3339, EventValidator};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Classic token bucket: refills continuously at `rate` per second up to
/// `burst` and hands out whole tokens.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            rate: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = Instant::now();
    }

    /// Take `n` tokens atomically; either all or none.
    pub fn try_take(&mut self, n: u32) -> bool {
        self.refill();
        let needed = n as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Rough wait until one token is available, for retry hints.
    pub fn retry_after(&self) -> Duration {
        if self.rate <= 0.0 {
            return Duration::from_secs(1);
        }
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.rate)
    }
}

#[derive(Debug)]
struct ClientLimiter {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Ingestion gate: per-client rate limiting, size caps, batch caps, bronze
/// construction, validation, and bus publication.
///
/// Limiter state is sharded per client behind an outer read lock; each
/// shard has its own mutex so no lock is ever held across the bus await.
pub struct AdmissionController {
    config: AdmissionConfig,
    validator: EventValidator,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<PipelineMetrics>,
    audit: Arc<AuditService>,
    limiters: RwLock<HashMap<String, Arc<Mutex<ClientLimiter>>>>,
    accepting: AtomicBool,
}

impl AdmissionController {
    pub fn new(
        config: AdmissionConfig,
        validator: EventValidator,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<PipelineMetrics>,
        audit: Arc<AuditService>,
    ) -> Self {
        Self {
            config,
            validator,
            bus,
            metrics,
            audit,
            limiters: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop admitting new work; in-flight submissions finish normally.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Submit one raw event. Returns the bronze event id on acceptance.
    pub async fn submit(
        &self,
        client_id: &str,
        source_platform: &str,
        payload: Bytes,
    ) -> Result<Uuid, PipelineError> {
        if !self.is_accepting() {
            return Err(PipelineError::CapacityExhausted {
                resource: "admission is shutting down".to_string(),
            });
        }
        if client_id.is_empty() {
            return Err(PipelineError::validation("client_id", "must not be empty"));
        }

        if payload.len() > MAX_PAYLOAD_BYTES {
            self.metrics
                .rejected_validation
                .fetch_add(1, Ordering::Relaxed);
            let err = PipelineError::validation(
                "payload",
                format!(
                    "{} bytes exceeds maximum of {MAX_PAYLOAD_BYTES} bytes",
                    payload.len()
                ),
            );
            self.audit
                .log_admission_rejected(client_id, err.code(), "payload over size cap")
                .await;
            return Err(err);
        }

        self.reserve(client_id, 1).await?;
        self.admit_one(client_id, source_platform, payload).await
    }

    /// Submit an ordered batch. The rate reservation covers the whole batch
    /// atomically; per-item failures are reported individually without
    /// failing the rest.
    pub async fn submit_batch(
        &self,
        client_id: &str,
        source_platform: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<Result<Uuid, PipelineError>>, PipelineError> {
        if !self.is_accepting() {
            return Err(PipelineError::CapacityExhausted {
                resource: "admission is shutting down".to_string(),
            });
        }
        if payloads.len() > self.config.max_batch_size {
            self.audit
                .log_admission_rejected(
                    client_id,
                    crate::error::ErrorCode::ResourceUtilization,
                    "batch over size cap",
                )
                .await;
            return Err(PipelineError::BatchTooLarge {
                size: payloads.len(),
                limit: self.config.max_batch_size,
            });
        }

        self.reserve(client_id, payloads.len() as u32).await?;

        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if payload.len() > MAX_PAYLOAD_BYTES {
                self.metrics
                    .rejected_validation
                    .fetch_add(1, Ordering::Relaxed);
                results.push(Err(PipelineError::validation(
                    "payload",
                    format!(
                        "{} bytes exceeds maximum of {MAX_PAYLOAD_BYTES} bytes",
                        payload.len()
                    ),
                )));
                continue;
            }
            results.push(self.admit_one(client_id, source_platform, payload).await);
        }
        Ok(results)
    }

    async fn admit_one(
        &self,
        client_id: &str,
        source_platform: &str,
        payload: Bytes,
    ) -> Result<Uuid, PipelineError> {
        let timestamp = extract_event_timestamp(&payload).unwrap_or_else(Utc::now);
        let bronze = BronzeEvent::new(
            client_id,
            SourcePlatform::parse(source_platform),
            timestamp,
            payload,
        );

        if let Err(err) = self.validator.validate(&bronze) {
            match err.kind() {
                ErrorKind::Security => {
                    self.metrics
                        .rejected_security
                        .fetch_add(1, Ordering::Relaxed);
                    self.audit
                        .log_security_rejection(client_id, "payload_pattern_match")
                        .await;
                    warn!(client_id, "security rejection at admission");
                }
                _ => {
                    self.metrics
                        .rejected_validation
                        .fetch_add(1, Ordering::Relaxed);
                    self.audit
                        .log_admission_rejected(client_id, err.code(), "validation failed")
                        .await;
                }
            }
            return Err(err);
        }

        let raw = bronze.to_json()?;
        self.bus
            .publish(BRONZE_TOPIC, client_id, Bytes::from(raw))
            .await
            .map_err(|e| PipelineError::transient("admission", e.to_string()))?;

        self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(client_id, event_id = %bronze.id, "bronze event admitted");
        Ok(bronze.id)
    }

    async fn reserve(&self, client_id: &str, tokens: u32) -> Result<(), PipelineError> {
        let limiter = self.limiter_for(client_id).await;
        let mut guard = limiter.lock().await;
        guard.last_seen = Instant::now();
        if guard.bucket.try_take(tokens) {
            Ok(())
        } else {
            let retry_after = guard.bucket.retry_after();
            drop(guard);
            self.metrics
                .rejected_rate_limit
                .fetch_add(1, Ordering::Relaxed);
            let err = PipelineError::RateLimited {
                client_id: client_id.to_string(),
                retry_after: Some(retry_after),
            };
            self.audit
                .log_admission_rejected(client_id, err.code(), "rate limit exceeded")
                .await;
            Err(err)
        }
    }

    async fn limiter_for(&self, client_id: &str) -> Arc<Mutex<ClientLimiter>> {
        {
            let limiters = self.limiters.read().await;
            if let Some(limiter) = limiters.get(client_id) {
                return limiter.clone();
            }
        }
        let mut limiters = self.limiters.write().await;
        limiters
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ClientLimiter {
                    bucket: TokenBucket::new(self.config.rate_limit_rps, self.config.burst),
                    last_seen: Instant::now(),
                }))
            })
            .clone()
    }

    /// Drop limiter shards idle beyond the configured TTL. Run
    /// periodically by the coordinator.
    pub async fn reclaim_idle_limiters(&self) -> usize {
        let ttl = self.config.limiter_idle_ttl;
        let mut limiters = self.limiters.write().await;
        let before = limiters.len();
        let mut keep = HashMap::new();
        for (client_id, limiter) in limiters.drain() {
            let idle = match limiter.try_lock() {
                Ok(guard) => guard.last_seen.elapsed() > ttl,
                // A contended shard is in active use.
                Err(_) => false,
            };
            if !idle {
                keep.insert(client_id, limiter);
            }
        }
        let reclaimed = before - keep.len();
        *limiters = keep;
        reclaimed
    }

    pub async fn limiter_count(&self) -> usize {
        self.limiters.read().await.len()
    }
}

/// Pull the producer-claimed event time out of the raw payload so the
/// freshness window applies to the event, not the submission.
fn extract_event_timestamp(payload: &Bytes) -> Option<chrono::DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    for key in ["timestamp", "event_timestamp", "@timestamp", "event_time"] {
        if let Some(raw) = value.get(key).and_then(|v| v.as_str()) {
            if let Some(parsed) = parse_rfc3339(raw) {
                return Some(parsed);
            }
        }
    }
    None
}
