use crate::correlation::rules::{CorrelationContext, RuleRegistry};
use crate::correlation::window::{check_batch_size, group_by_event_time};
use crate::domain::gold::GoldAlert;
use crate::domain::security::{EncryptionInfo, SensitiveFieldPolicy};
use crate::domain::silver::SilverEvent;
use crate::error::PipelineError;
use crate::infrastructure::config::CorrelationConfig;
use crate::infrastructure::crypto::{FieldEncryptor, AEAD_ALGORITHM};
use crate::infrastructure::telemetry::PipelineMetrics;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Silver-to-gold correlation engine.
///
/// Batches are split per client, grouped by event time, and each group is
/// evaluated against every registered rule in lexicographic rule-id order.
/// Groups run concurrently up to the configured worker cap; rule execution
/// inside a group stays sequential so rule metrics are deterministic. A
/// group whose deadline expires discards everything it produced. Emitted
/// alerts are sealed before they leave the engine: intelligence entries
/// whose names exactly match the sensitive set move into
/// `encrypted_fields`, and no alert may carry an encrypted name outside
/// that set.
pub struct CorrelationEngine {
    registry: Arc<RuleRegistry>,
    config: CorrelationConfig,
    metrics: Arc<PipelineMetrics>,
    ctx: CorrelationContext,
    group_slots: Arc<Semaphore>,
    encryptor: Arc<FieldEncryptor>,
    policy: SensitiveFieldPolicy,
}

impl CorrelationEngine {
    pub fn new(
        registry: Arc<RuleRegistry>,
        config: CorrelationConfig,
        metrics: Arc<PipelineMetrics>,
        actor: impl Into<String>,
        encryptor: Arc<FieldEncryptor>,
        policy: SensitiveFieldPolicy,
    ) -> Self {
        let group_slots = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            registry,
            config,
            metrics,
            ctx: CorrelationContext {
                actor: actor.into(),
            },
            group_slots,
            encryptor,
            policy,
        }
    }

    /// Correlate one batch of silver events into zero or more alerts.
    pub async fn correlate_batch(
        &self,
        events: Vec<SilverEvent>,
    ) -> Result<Vec<GoldAlert>, PipelineError> {
        check_batch_size(events.len(), self.config.max_events_per_correlation)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        // Group per client first; windows never span clients.
        let mut per_client: BTreeMap<String, Vec<SilverEvent>> = BTreeMap::new();
        for event in events {
            per_client
                .entry(event.client_id.clone())
                .or_default()
                .push(event);
        }

        let window = chrono::Duration::from_std(self.config.window)
            .map_err(|e| PipelineError::configuration(e.to_string()))?;

        let mut groups = Vec::new();
        for (_, client_events) in per_client {
            groups.extend(group_by_event_time(client_events, window));
        }

        let rules = self.registry.snapshot().await;
        let outcomes = futures::future::join_all(
            groups
                .into_iter()
                .map(|group| self.evaluate_group(group, &rules)),
        )
        .await;

        let mut alerts = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(mut group_alerts) => alerts.append(&mut group_alerts),
                Err(err) => {
                    // Deadline or rule failure: the group's partial output
                    // was already discarded.
                    warn!(%err, "correlation group failed");
                }
            }
        }

        self.metrics
            .alerts_emitted
            .fetch_add(alerts.len() as u64, Ordering::Relaxed);
        Ok(alerts)
    }

    async fn evaluate_group(
        &self,
        group: Vec<SilverEvent>,
        rules: &[Arc<dyn crate::correlation::rules::CorrelationRule>],
    ) -> Result<Vec<GoldAlert>, PipelineError> {
        let _slot = self
            .group_slots
            .acquire()
            .await
            .map_err(|_| PipelineError::internal("correlation pool closed"))?;

        self.metrics
            .correlation_groups
            .fetch_add(1, Ordering::Relaxed);

        let mut alerts = Vec::new();
        for rule in rules {
            let evaluation = rule.correlate(&group, &self.ctx);
            match tokio::time::timeout(self.config.rule_timeout, evaluation).await {
                Ok(Ok(Some(alert))) => {
                    let sealed = self.seal_alert(alert).await?;
                    debug!(rule_id = rule.rule_id(), alert_id = %sealed.alert_id, "rule emitted alert");
                    alerts.push(sealed);
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    warn!(rule_id = rule.rule_id(), %err, "rule evaluation failed");
                    return Err(err);
                }
                Err(_) => {
                    // Abort the whole group; nothing partial leaves here.
                    return Err(PipelineError::Timeout {
                        timeout_ms: self.config.rule_timeout.as_millis() as u64,
                    });
                }
            }
        }
        Ok(alerts)
    }

    /// Finalize a rule's alert before it leaves the engine.
    ///
    /// Intelligence entries whose names exactly match the sensitive set
    /// are encrypted and moved into `encrypted_fields`; the plaintext is
    /// gone once sealing completes. Any encrypted name outside the
    /// configured set fails the alert.
    async fn seal_alert(&self, mut alert: GoldAlert) -> Result<GoldAlert, PipelineError> {
        let key_ref = format!("client/{}", alert.client_id);
        let sensitive: Vec<String> = alert
            .intelligence_data
            .keys()
            .filter(|key| self.policy.matches_exact(key))
            .cloned()
            .collect();

        let mut encryption_info = None;
        for key in sensitive {
            if let Some(value) = alert.intelligence_data.remove(&key) {
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
                alert.encrypted_fields.insert(key, envelope);
            }
        }
        if encryption_info.is_some() {
            alert.security_metadata.encryption = encryption_info;
        }

        for key in alert.encrypted_fields.keys() {
            if !self.policy.matches_exact(key) {
                return Err(PipelineError::validation(
                    format!("encrypted_fields.{key}"),
                    "name is not in the configured sensitive-field set",
                ));
            }
        }

        alert.validate()?;
        Ok(alert)
    }
}
