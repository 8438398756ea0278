use crate::domain::gold::{GoldAlert, Severity};
use crate::domain::security::{SecurityMetadata, ThreatLevel};
use crate::domain::silver::SilverEvent;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Runtime context handed to every rule evaluation.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    /// Process-level actor identity recorded as `created_by`.
    pub actor: String,
}

/// A named detection predicate over one event-time group.
///
/// `correlate` returns at most one alert per invocation and must be pure
/// apart from shared read-only configuration.
#[async_trait]
pub trait CorrelationRule: Send + Sync {
    fn rule_id(&self) -> &str;

    /// Checked before registration; a rule that fails never runs.
    fn validate(&self) -> Result<(), PipelineError>;

    async fn correlate(
        &self,
        events: &[SilverEvent],
        ctx: &CorrelationContext,
    ) -> Result<Option<GoldAlert>, PipelineError>;
}

/// Weighted 0-100 score mapped onto the severity ladder.
pub fn severity_from_score(score: f64) -> Severity {
    match score {
        s if s >= 80.0 => Severity::Critical,
        s if s >= 60.0 => Severity::High,
        s if s >= 40.0 => Severity::Medium,
        s if s >= 20.0 => Severity::Low,
        _ => Severity::Info,
    }
}

fn threat_level_for(severity: Severity) -> ThreatLevel {
    match severity {
        Severity::Critical | Severity::High => ThreatLevel::Severe,
        Severity::Medium => ThreatLevel::Elevated,
        Severity::Low => ThreatLevel::Low,
        Severity::Info => ThreatLevel::None,
    }
}

fn build_alert(
    events: &[SilverEvent],
    ctx: &CorrelationContext,
    rule_id: &str,
    score: f64,
    confidence: f64,
    intelligence: BTreeMap<String, serde_json::Value>,
) -> GoldAlert {
    let severity = severity_from_score(score);
    let mut metadata = SecurityMetadata::new(confidence, threat_level_for(severity));
    metadata.tags.push(rule_id.to_string());

    let mut alert = GoldAlert::new(
        events[0].client_id.clone(),
        severity,
        events.iter().map(|e| e.event_id).collect(),
        metadata,
        &ctx.actor,
    );
    alert
        .intelligence_data
        .insert("rule_id".to_string(), serde_json::json!(rule_id));
    alert
        .intelligence_data
        .insert("score".to_string(), serde_json::json!(score));
    alert.intelligence_data.extend(intelligence);
    alert
}

/// Fires when a group holds at least `min_count` events of one type.
pub struct ThresholdRule {
    id: String,
    event_type: String,
    min_count: usize,
}

impl ThresholdRule {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, min_count: usize) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            min_count,
        }
    }
}

#[async_trait]
impl CorrelationRule for ThresholdRule {
    fn rule_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.id.is_empty() {
            return Err(PipelineError::configuration("rule id must not be empty"));
        }
        if self.min_count == 0 {
            return Err(PipelineError::configuration(
                "threshold rule needs min_count >= 1",
            ));
        }
        if self.event_type.is_empty() {
            return Err(PipelineError::configuration(
                "threshold rule needs an event type",
            ));
        }
        Ok(())
    }

    async fn correlate(
        &self,
        events: &[SilverEvent],
        ctx: &CorrelationContext,
    ) -> Result<Option<GoldAlert>, PipelineError> {
        let matching: Vec<&SilverEvent> = events
            .iter()
            .filter(|e| e.event_type == self.event_type)
            .collect();
        if matching.len() < self.min_count {
            return Ok(None);
        }

        // Score scales with how far past the threshold the group went.
        let overshoot = matching.len() as f64 / self.min_count as f64;
        let score = (45.0 * overshoot).min(100.0);
        let confidence = (0.6 + 0.1 * (matching.len() - self.min_count) as f64).min(0.95);

        let selected: Vec<SilverEvent> = matching.into_iter().cloned().collect();
        Ok(Some(build_alert(
            &selected,
            ctx,
            &self.id,
            score,
            confidence,
            BTreeMap::from([(
                "matched_events".to_string(),
                serde_json::json!(selected.len()),
            )]),
        )))
    }
}

/// Fires when one source address touches many distinct destinations,
/// the classic scan / lateral-movement shape.
pub struct FanOutRule {
    id: String,
    min_distinct_targets: usize,
}

impl FanOutRule {
    pub fn new(id: impl Into<String>, min_distinct_targets: usize) -> Self {
        Self {
            id: id.into(),
            min_distinct_targets,
        }
    }
}

#[async_trait]
impl CorrelationRule for FanOutRule {
    fn rule_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.id.is_empty() {
            return Err(PipelineError::configuration("rule id must not be empty"));
        }
        if self.min_distinct_targets < 2 {
            return Err(PipelineError::configuration(
                "fan-out rule needs at least 2 targets",
            ));
        }
        Ok(())
    }

    async fn correlate(
        &self,
        events: &[SilverEvent],
        ctx: &CorrelationContext,
    ) -> Result<Option<GoldAlert>, PipelineError> {
        let mut by_source: HashMap<&str, (HashSet<&str>, Vec<&SilverEvent>)> = HashMap::new();
        for event in events {
            let src = event.normalized_data.get("src_ip").and_then(|v| v.as_str());
            let dst = event.normalized_data.get("dst_ip").and_then(|v| v.as_str());
            if let (Some(src), Some(dst)) = (src, dst) {
                let entry = by_source.entry(src).or_default();
                entry.0.insert(dst);
                entry.1.push(event);
            }
        }

        let offender = by_source
            .into_iter()
            .filter(|(_, (targets, _))| targets.len() >= self.min_distinct_targets)
            .max_by_key(|(_, (targets, _))| targets.len());

        let Some((src, (targets, matched))) = offender else {
            return Ok(None);
        };

        let spread = targets.len() as f64 / self.min_distinct_targets as f64;
        let score = (55.0 * spread).min(100.0);
        let selected: Vec<SilverEvent> = matched.into_iter().cloned().collect();
        Ok(Some(build_alert(
            &selected,
            ctx,
            &self.id,
            score,
            0.85,
            BTreeMap::from([
                ("source_ip".to_string(), serde_json::json!(src)),
                ("distinct_targets".to_string(), serde_json::json!(targets.len())),
            ]),
        )))
    }
}

/// Fires when a group accumulates enough platform-reported high-severity
/// events.
pub struct SeverityEscalationRule {
    id: String,
    min_high_severity: usize,
}

impl SeverityEscalationRule {
    pub fn new(id: impl Into<String>, min_high_severity: usize) -> Self {
        Self {
            id: id.into(),
            min_high_severity,
        }
    }
}

#[async_trait]
impl CorrelationRule for SeverityEscalationRule {
    fn rule_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.id.is_empty() {
            return Err(PipelineError::configuration("rule id must not be empty"));
        }
        if self.min_high_severity == 0 {
            return Err(PipelineError::configuration(
                "escalation rule needs min_high_severity >= 1",
            ));
        }
        Ok(())
    }

    async fn correlate(
        &self,
        events: &[SilverEvent],
        ctx: &CorrelationContext,
    ) -> Result<Option<GoldAlert>, PipelineError> {
        let matching: Vec<SilverEvent> = events
            .iter()
            .filter(|e| {
                matches!(
                    e.normalized_data.get("severity").and_then(|v| v.as_str()),
                    Some("high") | Some("critical")
                )
            })
            .cloned()
            .collect();
        if matching.len() < self.min_high_severity {
            return Ok(None);
        }

        let score = (70.0 + 5.0 * (matching.len() - self.min_high_severity) as f64).min(100.0);
        Ok(Some(build_alert(
            &matching,
            ctx,
            &self.id,
            score,
            0.9,
            BTreeMap::from([(
                "high_severity_events".to_string(),
                serde_json::json!(matching.len()),
            )]),
        )))
    }
}

/// Registered rules, iterated in lexicographic rule-id order.
///
/// Writers are rare (configuration reload); evaluation takes the read side.
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<BTreeMap<String, Arc<dyn CorrelationRule>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a rule; a rule with the same id is replaced.
    pub async fn register(&self, rule: Arc<dyn CorrelationRule>) -> Result<(), PipelineError> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        rules.insert(rule.rule_id().to_string(), rule);
        Ok(())
    }

    pub async fn remove(&self, rule_id: &str) -> bool {
        self.rules.write().await.remove(rule_id).is_some()
    }

    /// Current rules in deterministic evaluation order.
    pub async fn snapshot(&self) -> Vec<Arc<dyn CorrelationRule>> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }
}

/// The detection set the pipeline ships with.
pub async fn register_builtin_rules(registry: &RuleRegistry) -> Result<(), PipelineError> {
    registry
        .register(Arc::new(ThresholdRule::new(
            "builtin.alert_burst",
            "SecurityAlert",
            3,
        )))
        .await?;
    registry
        .register(Arc::new(FanOutRule::new("builtin.network_fan_out", 5)))
        .await?;
    registry
        .register(Arc::new(SeverityEscalationRule::new(
            "builtin.severity_escalation",
            3,
        )))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::security::SecurityContext;
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx() -> CorrelationContext {
        CorrelationContext {
            actor: "correlator@test".to_string(),
        }
    }

    fn event(event_type: &str) -> SilverEvent {
        SilverEvent::new(
            "c1",
            event_type,
            Utc::now(),
            Uuid::new_v4(),
            SecurityContext::default(),
        )
    }

    fn network_event(src: &str, dst: &str) -> SilverEvent {
        let mut ev = event("NetworkConnection");
        ev.normalized_data
            .insert("src_ip".to_string(), serde_json::json!(src));
        ev.normalized_data
            .insert("dst_ip".to_string(), serde_json::json!(dst));
        ev
    }

    #[tokio::test]
    async fn test_threshold_rule_fires_at_count() {
        let rule = ThresholdRule::new("r.burst", "SecurityAlert", 3);
        let events: Vec<SilverEvent> = (0..3).map(|_| event("SecurityAlert")).collect();

        let alert = rule.correlate(&events, &ctx()).await.unwrap().unwrap();
        assert_eq!(alert.silver_event_ids.len(), 3);
        assert_eq!(alert.client_id, "c1");
        assert!(alert.validate().is_ok());
        assert_eq!(
            alert.intelligence_data["rule_id"],
            serde_json::json!("r.burst")
        );
    }

    #[tokio::test]
    async fn test_threshold_rule_below_count_silent() {
        let rule = ThresholdRule::new("r.burst", "SecurityAlert", 3);
        let events: Vec<SilverEvent> = (0..2).map(|_| event("SecurityAlert")).collect();
        assert!(rule.correlate(&events, &ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_threshold_rule_ignores_other_types() {
        let rule = ThresholdRule::new("r.burst", "SecurityAlert", 2);
        let events = vec![event("SecurityAlert"), event("UserLogin"), event("UserLogin")];
        assert!(rule.correlate(&events, &ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fan_out_rule() {
        let rule = FanOutRule::new("r.fanout", 3);
        let events: Vec<SilverEvent> = (0..4)
            .map(|i| network_event("192.168.1.1", &format!("10.0.0.{i}")))
            .collect();

        let alert = rule.correlate(&events, &ctx()).await.unwrap().unwrap();
        assert_eq!(alert.intelligence_data["distinct_targets"], serde_json::json!(4));
        assert_eq!(alert.silver_event_ids.len(), 4);
    }

    #[tokio::test]
    async fn test_fan_out_requires_distinct_targets() {
        let rule = FanOutRule::new("r.fanout", 3);
        let events: Vec<SilverEvent> = (0..5)
            .map(|_| network_event("192.168.1.1", "10.0.0.1"))
            .collect();
        assert!(rule.correlate(&events, &ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_severity_escalation_rule() {
        let rule = SeverityEscalationRule::new("r.escalation", 2);
        let mut events = vec![event("A"), event("B"), event("C")];
        for ev in events.iter_mut().take(2) {
            ev.normalized_data
                .insert("severity".to_string(), serde_json::json!("critical"));
        }

        let alert = rule.correlate(&events, &ctx()).await.unwrap().unwrap();
        assert!(matches!(alert.severity, Severity::High | Severity::Critical));
        assert_eq!(alert.silver_event_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_lexicographic_order() {
        let registry = RuleRegistry::new();
        registry
            .register(Arc::new(ThresholdRule::new("zeta", "A", 1)))
            .await
            .unwrap();
        registry
            .register(Arc::new(ThresholdRule::new("alpha", "A", 1)))
            .await
            .unwrap();
        registry
            .register(Arc::new(ThresholdRule::new("mid", "A", 1)))
            .await
            .unwrap();

        let ids: Vec<String> = registry
            .snapshot()
            .await
            .iter()
            .map(|r| r.rule_id().to_string())
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected_at_registration() {
        let registry = RuleRegistry::new();
        let err = registry
            .register(Arc::new(ThresholdRule::new("r.bad", "A", 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_builtin_rules_register() {
        let registry = RuleRegistry::new();
        register_builtin_rules(&registry).await.unwrap();
        assert_eq!(registry.len().await, 3);
    }

    #[test]
    fn test_severity_score_mapping() {
        assert_eq!(severity_from_score(95.0), Severity::Critical);
        assert_eq!(severity_from_score(70.0), Severity::High);
        assert_eq!(severity_from_score(45.0), Severity::Medium);
        assert_eq!(severity_from_score(25.0), Severity::Low);
        assert_eq!(severity_from_score(5.0), Severity::Info);
    }
}
