use crate::application::audit_service::AuditService;
use crate::domain::gold::{AlertStatus, GoldAlert};
use crate::error::PipelineError;
use crate::infrastructure::config::AlertConfig;
use crate::pipeline::admission::TokenBucket;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

/// Alert lifecycle service: creation, status transitions, history.
///
/// Creation and updates share one process-global token bucket. Each alert
/// sits behind its own mutex so history appends are serialized per alert
/// while different alerts move independently.
pub struct AlertService {
    alerts: RwLock<HashMap<Uuid, Arc<Mutex<GoldAlert>>>>,
    limiter: Mutex<TokenBucket>,
    audit: Arc<AuditService>,
}

impl AlertService {
    pub fn new(config: AlertConfig, audit: Arc<AuditService>) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            limiter: Mutex::new(TokenBucket::new(config.rate_limit_rps, config.burst)),
            audit,
        }
    }

    async fn take_token(&self) -> Result<(), PipelineError> {
        let mut limiter = self.limiter.lock().await;
        if limiter.try_take(1) {
            Ok(())
        } else {
            Err(PipelineError::RateLimited {
                client_id: "alert-service".to_string(),
                retry_after: Some(limiter.retry_after()),
            })
        }
    }

    /// Validate and store a freshly correlated alert.
    pub async fn create(&self, alert: GoldAlert) -> Result<Uuid, PipelineError> {
        self.take_token().await?;
        alert.validate()?;

        let alert_id = alert.alert_id;
        let client_id = alert.client_id.clone();
        let actor = alert.audit_metadata.created_by.clone();
        {
            let mut alerts = self.alerts.write().await;
            alerts.insert(alert_id, Arc::new(Mutex::new(alert)));
        }
        self.audit
            .log_alert_created(alert_id, &client_id, &actor)
            .await;
        info!(%alert_id, client_id, "alert created");
        Ok(alert_id)
    }

    /// Apply a status transition, appending to the alert's history.
    pub async fn update_status(
        &self,
        alert_id: Uuid,
        next: AlertStatus,
        actor: &str,
        reason: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        self.take_token().await?;

        let entry = {
            let alerts = self.alerts.read().await;
            alerts
                .get(&alert_id)
                .cloned()
                .ok_or_else(|| PipelineError::validation("alert_id", "unknown alert"))?
        };

        let mut alert = entry.lock().await;
        let from = alert.status;
        alert.transition(next, actor, reason, metadata)?;
        self.audit
            .log_alert_status_changed(alert_id, actor, from.as_str(), next.as_str())
            .await;
        info!(%alert_id, from = %from, to = %next, "alert status changed");
        Ok(())
    }

    pub async fn get(&self, alert_id: Uuid) -> Option<GoldAlert> {
        let entry = {
            let alerts = self.alerts.read().await;
            alerts.get(&alert_id).cloned()
        }?;
        let alert = entry.lock().await;
        Some(alert.clone())
    }

    pub async fn list_for_client(&self, client_id: &str) -> Vec<GoldAlert> {
        let entries: Vec<Arc<Mutex<GoldAlert>>> = {
            let alerts = self.alerts.read().await;
            alerts.values().cloned().collect()
        };
        let mut result = Vec::new();
        for entry in entries {
            let alert = entry.lock().await;
            if alert.client_id == client_id {
                result.push(alert.clone());
            }
        }
        result
    }

    pub async fn count(&self) -> usize {
        self.alerts.read().await.len()
    }
}
