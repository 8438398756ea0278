use crate::domain::bronze::BronzeEvent;
use crate::domain::silver::SilverEvent;
use crate::error::{ErrorKind, PipelineError};
use crate::infrastructure::bus::{BusRecord, MessageBus, BRONZE_TOPIC};
use crate::infrastructure::config::NormalizerConfig;
use crate::infrastructure::telemetry::PipelineMetrics;
use crate::normalize::mapper::FieldMapper;
use crate::normalize::transformer::Transformer;
use crate::normalize::validator::EventValidator;
use crate::pipeline::circuit::CircuitBreaker;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consumer group the normalizer workers poll under.
pub const CONSUMER_GROUP: &str = "normalizers";

/// Share of transform concurrency one client may hold.
const FAIR_SHARE_PERCENT: usize = 25;

/// Bronze-to-silver worker pool.
///
/// Workers pull batches off the bronze topic, run each record through
/// validate, map, transform independently, and push results into the
/// bounded sink channel in batch order so per-partition ordering survives.
/// Transient failures retry with exponential backoff; validation and
/// security failures are acked and dropped; records that exhaust retries
/// are surrendered to the bus for redelivery.
pub struct NormalizerPipeline {
    bus: Arc<dyn MessageBus>,
    validator: Arc<EventValidator>,
    mapper: Arc<FieldMapper>,
    transformer: Arc<Transformer>,
    sink: mpsc::Sender<SilverEvent>,
    config: NormalizerConfig,
    metrics: Arc<PipelineMetrics>,
    circuit: Arc<CircuitBreaker>,
    /// Per-client concurrency slots so one client cannot monopolize the
    /// transform pool.
    client_slots: RwLock<HashMap<String, Arc<Semaphore>>>,
    client_share: usize,
}

enum RecordOutcome {
    Silver(Box<SilverEvent>),
    /// Permanent failure; ack so the bus does not redeliver.
    Drop(PipelineError),
    /// Transient failure; surrender for redelivery.
    Redeliver(PipelineError),
}

impl NormalizerPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        validator: Arc<EventValidator>,
        mapper: Arc<FieldMapper>,
        transformer: Arc<Transformer>,
        sink: mpsc::Sender<SilverEvent>,
        config: NormalizerConfig,
        metrics: Arc<PipelineMetrics>,
        circuit: Arc<CircuitBreaker>,
    ) -> Self {
        let client_share =
            (config.max_concurrent_transforms * FAIR_SHARE_PERCENT / 100).max(1);
        Self {
            bus,
            validator,
            mapper,
            transformer,
            sink,
            config,
            metrics,
            circuit,
            client_slots: RwLock::new(HashMap::new()),
            client_share,
        }
    }

    async fn client_slot(&self, client_id: &str) -> Arc<Semaphore> {
        {
            let slots = self.client_slots.read().await;
            if let Some(slot) = slots.get(client_id) {
                return slot.clone();
            }
        }
        let mut slots = self.client_slots.write().await;
        slots
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.client_share)))
            .clone()
    }

    /// Start the worker pool. Workers exit after draining their current
    /// batch once the shutdown signal flips.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_pool_size)
            .map(|worker_id| {
                let pipeline = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    pipeline.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "normalizer worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let records = match self
                .bus
                .poll(CONSUMER_GROUP, BRONZE_TOPIC, self.config.batch_size)
                .await
            {
                Ok(records) => records,
                Err(err) => {
                    warn!(worker_id, %err, "bus poll failed");
                    self.circuit.record_failure();
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
            };

            if records.is_empty() {
                // Nothing buffered; wake on the flush interval or shutdown.
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.flush_interval) => {}
                }
                continue;
            }

            // Checked after the poll so a half-open probe is only consumed
            // when there is work whose outcome will settle it.
            if !self.circuit.should_allow_request() {
                for record in &records {
                    self.surrender(record).await;
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.flush_interval) => {}
                }
                continue;
            }

            self.process_batch(worker_id, records).await;
        }
        info!(worker_id, "normalizer worker stopped");
    }

    /// Process one polled batch. Records proceed concurrently and
    /// independently; one failure never aborts a sibling.
    async fn process_batch(&self, worker_id: usize, records: Vec<BusRecord>) {
        let batch_deadline = Instant::now() + self.config.record_timeout;

        let outcomes =
            futures::future::join_all(records.iter().map(|record| self.process_record(record)))
                .await;

        // Emit in batch order so a partition's records reach the sink in
        // the order the bus delivered them.
        for (record, outcome) in records.iter().zip(outcomes) {
            match outcome {
                RecordOutcome::Silver(silver) => {
                    let remaining = batch_deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, self.sink.send(*silver)).await {
                        Ok(Ok(())) => {
                            self.ack(record).await;
                            self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                            self.circuit.record_success();
                        }
                        Ok(Err(_)) => {
                            // Sink closed: shutdown is underway, hand the
                            // record back for redelivery.
                            self.surrender(record).await;
                        }
                        Err(_) => {
                            warn!(
                                worker_id,
                                offset = record.offset,
                                "sink backpressure exceeded batch deadline"
                            );
                            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                            self.circuit.record_failure();
                            self.surrender(record).await;
                        }
                    }
                }
                RecordOutcome::Drop(err) => {
                    debug!(worker_id, offset = record.offset, %err, "record dropped");
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    self.ack(record).await;
                    // The stage itself worked; only the data was bad.
                    self.circuit.record_success();
                }
                RecordOutcome::Redeliver(err) => {
                    error!(worker_id, offset = record.offset, %err, "record surrendered");
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    self.circuit.record_failure();
                    self.surrender(record).await;
                }
            }
        }
    }

    async fn process_record(&self, record: &BusRecord) -> RecordOutcome {
        let started = Instant::now();

        let raw = match std::str::from_utf8(&record.payload) {
            Ok(raw) => raw,
            Err(_) => {
                return RecordOutcome::Drop(PipelineError::corruption(
                    "bronze record is not valid UTF-8",
                ))
            }
        };
        let bronze = match BronzeEvent::from_json(raw) {
            Ok(bronze) => bronze,
            Err(_) => {
                return RecordOutcome::Drop(PipelineError::corruption(
                    "bronze record failed to deserialize",
                ))
            }
        };

        // Fair-share gate: a flood from one client queues behind its own
        // slots instead of starving other partitions.
        let slot = self.client_slot(&record.partition_key).await;
        let _share = match slot.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return RecordOutcome::Redeliver(PipelineError::transient(
                    "normalizer",
                    "client slot pool closed",
                ))
            }
        };

        let work = self.normalize_with_retries(&bronze);
        match tokio::time::timeout(self.config.record_timeout, work).await {
            Ok(Ok(silver)) => {
                self.metrics.observe_latency(started.elapsed());
                RecordOutcome::Silver(Box::new(silver))
            }
            Ok(Err(err)) => match err.kind() {
                ErrorKind::Validation | ErrorKind::Security => RecordOutcome::Drop(err),
                ErrorKind::Transient | ErrorKind::Capacity | ErrorKind::Fatal => {
                    RecordOutcome::Redeliver(err)
                }
            },
            Err(_) => RecordOutcome::Redeliver(PipelineError::Timeout {
                timeout_ms: self.config.record_timeout.as_millis() as u64,
            }),
        }
    }

    /// Validate, map, transform with exponential backoff on transient
    /// failures. Validation and security failures are never retried.
    async fn normalize_with_retries(
        &self,
        bronze: &BronzeEvent,
    ) -> Result<SilverEvent, PipelineError> {
        self.validator.validate(bronze)?;

        let payload = bronze.payload_json()?;
        let mapped = self.mapper.map(&payload)?;
        self.mapper.check_required(&mapped)?;

        let mut attempt = 0u32;
        loop {
            match self.transformer.transform(bronze, mapped.clone()).await {
                Ok(silver) => return Ok(silver),
                Err(err) if retryable(&err) && attempt < self.config.retry_max => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, %err, "transform retry");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn ack(&self, record: &BusRecord) {
        if let Err(err) = self.bus.ack(CONSUMER_GROUP, BRONZE_TOPIC, record.offset).await {
            warn!(offset = record.offset, %err, "ack failed");
        }
    }

    async fn surrender(&self, record: &BusRecord) {
        if let Err(err) = self
            .bus
            .surrender(CONSUMER_GROUP, BRONZE_TOPIC, record.offset)
            .await
        {
            warn!(offset = record.offset, %err, "surrender failed");
        }
    }
}

/// Capacity errors (a momentarily full transformer) back off and retry
/// alongside transient infrastructure failures.
fn retryable(err: &PipelineError) -> bool {
    matches!(err.kind(), ErrorKind::Transient | ErrorKind::Capacity)
}
