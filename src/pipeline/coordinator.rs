use crate::application::{AlertService, AuditService};
use crate::correlation::engine::CorrelationEngine;
use crate::correlation::rules::RuleRegistry;
use crate::domain::silver::SilverEvent;
use crate::error::PipelineError;
use crate::infrastructure::bus::{MessageBus, BRONZE_TOPIC, SILVER_TOPIC};
use crate::infrastructure::config::Config;
use crate::infrastructure::crypto::FieldEncryptor;
use crate::infrastructure::kms::Kms;
use crate::infrastructure::storage::{partition_key, StorageSink, Tier};
use crate::infrastructure::telemetry::{MetricsSnapshot, PipelineMetrics};
use crate::normalize::mapper::FieldMapper;
use crate::normalize::transformer::Transformer;
use crate::normalize::validator::EventValidator;
use crate::pipeline::admission::AdmissionController;
use crate::pipeline::circuit::{CircuitBreaker, CircuitState};
use crate::pipeline::normalizer::{NormalizerPipeline, CONSUMER_GROUP};
use crate::domain::security::SensitiveFieldPolicy;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CORRELATOR_GROUP: &str = "correlators";
const ARCHIVER_GROUP: &str = "bronze_archive";
const IDLE_POLL: Duration = Duration::from_millis(200);
/// How long the correlator keeps polling for stragglers before it
/// evaluates a non-empty batch.
const CORRELATOR_LINGER: Duration = Duration::from_millis(100);

/// Coordinator health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub accepting: bool,
    pub circuit_state: String,
    pub pending_bronze: usize,
    pub pending_silver: usize,
    pub metrics: MetricsSnapshot,
}

/// Owns the pipeline stages as cooperating tasks.
///
/// Startup order: storage-facing tasks, correlator, normalizer workers,
/// admission. Shutdown walks the same order in reverse; every stage stops
/// accepting work, drains, and acknowledges within its share of the
/// shutdown budget. Unacked bronze records stay on the bus for redelivery.
pub struct PipelineCoordinator {
    config: Config,
    bus: Arc<dyn MessageBus>,
    storage: Arc<dyn StorageSink>,
    metrics: Arc<PipelineMetrics>,
    circuit: Arc<CircuitBreaker>,
    admission: Arc<AdmissionController>,
    normalizer: Arc<NormalizerPipeline>,
    engine: Arc<CorrelationEngine>,
    alert_service: Arc<AlertService>,

    normalizer_shutdown: watch::Sender<bool>,
    correlator_shutdown: watch::Sender<bool>,
    sink_shutdown: watch::Sender<bool>,

    sink_rx: Option<mpsc::Receiver<SilverEvent>>,
    normalizer_handles: Vec<JoinHandle<()>>,
    correlator_handle: Option<JoinHandle<()>>,
    sink_handles: Vec<JoinHandle<()>>,
}

impl PipelineCoordinator {
    /// Wire the full component graph from injected collaborators.
    pub fn new(
        config: Config,
        bus: Arc<dyn MessageBus>,
        storage: Arc<dyn StorageSink>,
        kms: Arc<dyn Kms>,
        registry: Arc<RuleRegistry>,
        audit: Arc<AuditService>,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let circuit = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        let policy = SensitiveFieldPolicy::new(config.sensitive_field_patterns.clone());
        let validator = Arc::new(EventValidator::new(
            &config.allowed_platforms,
            config.admission.clock_skew,
        ));

        let encryptor = Arc::new(FieldEncryptor::new(kms));
        let transformer = Arc::new(Transformer::new(
            encryptor.clone(),
            policy.clone(),
            config.normalizer.max_concurrent_transforms,
            config.normalizer.processing_timeout,
        ));

        let channel_capacity = config.normalizer.batch_size * config.normalizer.worker_pool_size;
        let (sink_tx, sink_rx) = mpsc::channel(channel_capacity);

        let normalizer = Arc::new(NormalizerPipeline::new(
            bus.clone(),
            validator.clone(),
            Arc::new(FieldMapper::default()),
            transformer,
            sink_tx,
            config.normalizer.clone(),
            metrics.clone(),
            circuit.clone(),
        ));

        let admission = Arc::new(AdmissionController::new(
            config.admission.clone(),
            EventValidator::new(&config.allowed_platforms, config.admission.clock_skew),
            bus.clone(),
            metrics.clone(),
            audit.clone(),
        ));

        let alert_service = Arc::new(AlertService::new(config.alerts.clone(), audit));
        let engine = Arc::new(CorrelationEngine::new(
            registry,
            config.correlation.clone(),
            metrics.clone(),
            format!("correlator@{}", std::process::id()),
            encryptor,
            policy,
        ));

        let (normalizer_shutdown, _) = watch::channel(false);
        let (correlator_shutdown, _) = watch::channel(false);
        let (sink_shutdown, _) = watch::channel(false);

        Self {
            config,
            bus,
            storage,
            metrics,
            circuit,
            admission,
            normalizer,
            engine,
            alert_service,
            normalizer_shutdown,
            correlator_shutdown,
            sink_shutdown,
            sink_rx: Some(sink_rx),
            normalizer_handles: Vec::new(),
            correlator_handle: None,
            sink_handles: Vec::new(),
        }
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        self.admission.clone()
    }

    pub fn alert_service(&self) -> Arc<AlertService> {
        self.alert_service.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Start every stage, downstream first.
    pub fn start(&mut self) {
        let sink_rx = self
            .sink_rx
            .take()
            .expect("coordinator can only be started once");

        // 1. Storage-facing tasks.
        self.sink_handles.push(tokio::spawn(silver_sink_loop(
            sink_rx,
            self.bus.clone(),
            self.storage.clone(),
            self.sink_shutdown.subscribe(),
        )));
        self.sink_handles.push(tokio::spawn(bronze_archive_loop(
            self.bus.clone(),
            self.storage.clone(),
            self.sink_shutdown.subscribe(),
        )));

        // 2. Correlator.
        self.correlator_handle = Some(tokio::spawn(correlator_loop(
            self.bus.clone(),
            self.engine.clone(),
            self.alert_service.clone(),
            self.storage.clone(),
            self.config.correlation.max_events_per_correlation,
            self.correlator_shutdown.subscribe(),
        )));

        // 3. Normalizer workers.
        self.normalizer_handles = self
            .normalizer
            .spawn_workers(self.normalizer_shutdown.subscribe());

        // 4. Admission sweep for idle limiter shards; admission itself is
        // already accepting.
        let admission = self.admission.clone();
        let mut sweep_shutdown = self.normalizer_shutdown.subscribe();
        self.sink_handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let reclaimed = admission.reclaim_idle_limiters().await;
                        if reclaimed > 0 {
                            info!(reclaimed, "idle rate limiters reclaimed");
                        }
                    }
                    _ = sweep_shutdown.changed() => {
                        if *sweep_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        info!("pipeline started");
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            accepting: self.admission.is_accepting(),
            circuit_state: match self.circuit.state() {
                CircuitState::Closed => "closed".to_string(),
                CircuitState::Open => "open".to_string(),
                CircuitState::HalfOpen => "half_open".to_string(),
            },
            pending_bronze: self.bus.pending(CONSUMER_GROUP, BRONZE_TOPIC).await,
            pending_silver: self.bus.pending(CORRELATOR_GROUP, SILVER_TOPIC).await,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Stop every stage, upstream first, within the shutdown budget.
    pub async fn shutdown(mut self) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        info!("pipeline shutdown requested");

        // 1. Admission stops taking new submissions.
        self.admission.stop_accepting();

        // 2. Normalizer workers finish their current batch and exit;
        // anything unacked stays on the bus for redelivery.
        let _ = self.normalizer_shutdown.send(true);
        for handle in self.normalizer_handles.drain(..) {
            await_stage(handle, deadline, "normalizer").await?;
        }

        // 3. Correlator.
        let _ = self.correlator_shutdown.send(true);
        if let Some(handle) = self.correlator_handle.take() {
            await_stage(handle, deadline, "correlator").await?;
        }

        // 4. Storage-facing tasks drain last.
        let _ = self.sink_shutdown.send(true);
        for handle in self.sink_handles.drain(..) {
            await_stage(handle, deadline, "sink").await?;
        }

        let surrendered = self.bus.pending(CONSUMER_GROUP, BRONZE_TOPIC).await;
        info!(surrendered, "pipeline shutdown complete");
        Ok(())
    }
}

async fn await_stage(
    handle: JoinHandle<()>,
    deadline: Instant,
    stage: &str,
) -> Result<(), PipelineError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, handle).await {
        Ok(_) => Ok(()),
        Err(_) => {
            warn!(stage, "stage did not drain before the shutdown deadline");
            Err(PipelineError::UncleanShutdown {
                timeout_ms: remaining.as_millis() as u64,
                pending: 0,
            })
        }
    }
}

/// Silver sink: publish normalized records to the silver topic and hand
/// them to durable storage.
async fn silver_sink_loop(
    mut rx: mpsc::Receiver<SilverEvent>,
    bus: Arc<dyn MessageBus>,
    storage: Arc<dyn StorageSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(silver) => store_silver(&*bus, &*storage, silver).await,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Upstream stages are already stopped; drain what is
                    // buffered and exit.
                    while let Ok(silver) = rx.try_recv() {
                        store_silver(&*bus, &*storage, silver).await;
                    }
                    break;
                }
            }
        }
    }
    info!("silver sink stopped");
}

async fn store_silver(bus: &dyn MessageBus, storage: &dyn StorageSink, silver: SilverEvent) {
    match silver.to_json() {
        Ok(raw) => {
            if let Err(err) = bus
                .publish(SILVER_TOPIC, &silver.client_id, Bytes::from(raw))
                .await
            {
                warn!(%err, "silver publish failed");
            }
        }
        Err(err) => warn!(%err, "silver serialization failed"),
    }
    let key = partition_key(Tier::Silver, silver.event_time);
    match serde_json::to_value(&silver) {
        Ok(value) => {
            if let Err(err) = storage.store(Tier::Silver, &key, value).await {
                warn!(%err, "silver store failed");
            }
        }
        Err(err) => warn!(%err, "silver serialization failed"),
    }
}

/// Bronze archive: copy admitted bronze records into tiered storage.
async fn bronze_archive_loop(
    bus: Arc<dyn MessageBus>,
    storage: Arc<dyn StorageSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let records = match bus.poll(ARCHIVER_GROUP, BRONZE_TOPIC, 500).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "bronze archive poll failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };
        if records.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        }
        for record in records {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&record.payload) {
                let at = value
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(crate::normalize::validator::parse_rfc3339)
                    .unwrap_or_else(chrono::Utc::now);
                let key = partition_key(Tier::Bronze, at);
                if let Err(err) = storage.store(Tier::Bronze, &key, value).await {
                    warn!(%err, "bronze store failed");
                }
            }
            let _ = bus.ack(ARCHIVER_GROUP, BRONZE_TOPIC, record.offset).await;
        }
    }
    info!("bronze archiver stopped");
}

/// Correlator stage: poll silver records, evaluate rule windows, emit
/// alerts through the lifecycle service into gold storage.
async fn correlator_loop(
    bus: Arc<dyn MessageBus>,
    engine: Arc<CorrelationEngine>,
    alert_service: Arc<AlertService>,
    storage: Arc<dyn StorageSink>,
    max_batch: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut records = match bus.poll(CORRELATOR_GROUP, SILVER_TOPIC, max_batch).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "correlator poll failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };
        if records.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        }

        // A burst lands over several polls; keep gathering until a linger
        // passes with nothing new so one window sees the whole burst.
        while records.len() < max_batch && !*shutdown.borrow() {
            tokio::time::sleep(CORRELATOR_LINGER).await;
            match bus
                .poll(CORRELATOR_GROUP, SILVER_TOPIC, max_batch - records.len())
                .await
            {
                Ok(more) if more.is_empty() => break,
                Ok(more) => records.extend(more),
                Err(_) => break,
            }
        }

        let mut events = Vec::new();
        let mut offsets = Vec::new();
        for record in &records {
            match std::str::from_utf8(&record.payload)
                .ok()
                .and_then(|raw| SilverEvent::from_json(raw).ok())
            {
                Some(event) => {
                    events.push(event);
                    offsets.push(record.offset);
                }
                None => {
                    // Corrupted silver record: drop it rather than loop on
                    // redelivery.
                    let _ = bus.ack(CORRELATOR_GROUP, SILVER_TOPIC, record.offset).await;
                }
            }
        }

        match engine.correlate_batch(events).await {
            Ok(alerts) => {
                for alert in alerts {
                    let key = partition_key(Tier::Gold, alert.detection_time);
                    let value = serde_json::to_value(&alert).unwrap_or_default();
                    match alert_service.create(alert).await {
                        Ok(_) => {
                            if let Err(err) = storage.store(Tier::Gold, &key, value).await {
                                warn!(%err, "gold store failed");
                            }
                        }
                        Err(err) => warn!(%err, "alert creation rejected"),
                    }
                }
                for offset in offsets {
                    let _ = bus.ack(CORRELATOR_GROUP, SILVER_TOPIC, offset).await;
                }
            }
            Err(err) => {
                warn!(%err, "correlation batch failed");
                for offset in offsets {
                    let _ = bus.surrender(CORRELATOR_GROUP, SILVER_TOPIC, offset).await;
                }
            }
        }
    }
    info!("correlator stopped");
}
