use crate::domain::security::{AlertAuditMetadata, ComplianceMetadata, SecurityMetadata};
use crate::domain::silver::EncryptedValue;
use crate::error::PipelineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Alerts older than this reject further state changes.
pub const ALERT_MAX_LIFETIME_DAYS: i64 = 90;

fn default_schema_version() -> String {
    super::bronze::SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Investigating,
    Resolved,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Closed => "closed",
        }
    }

    /// The allowed transition graph. Closed is terminal.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (New, Acknowledged)
                | (Acknowledged, Investigating)
                | (Acknowledged, Resolved)
                | (Investigating, Resolved)
                | (Investigating, Closed)
                | (Resolved, Closed)
        )
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in an alert's append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusTransition {
    pub status: AlertStatus,
    pub at: DateTime<Utc>,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Correlated alert derived from one or more silver events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoldAlert {
    pub alert_id: Uuid,
    pub client_id: String,
    pub severity: Severity,
    pub detection_time: DateTime<Utc>,
    pub status: AlertStatus,
    #[serde(default)]
    pub intelligence_data: BTreeMap<String, serde_json::Value>,
    pub silver_event_ids: Vec<Uuid>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub security_metadata: SecurityMetadata,
    pub audit_metadata: AlertAuditMetadata,
    pub compliance_metadata: ComplianceMetadata,
    /// Names must come from the configured sensitive-field set; the
    /// correlator enforces this when it seals an alert, since the record
    /// itself cannot see the runtime configuration.
    #[serde(default)]
    pub encrypted_fields: BTreeMap<String, EncryptedValue>,
    pub history: Vec<StatusTransition>,
}

impl GoldAlert {
    pub fn new(
        client_id: impl Into<String>,
        severity: Severity,
        silver_event_ids: Vec<Uuid>,
        security_metadata: SecurityMetadata,
        created_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            alert_id: Uuid::new_v4(),
            client_id: client_id.into(),
            severity,
            detection_time: now,
            status: AlertStatus::New,
            intelligence_data: BTreeMap::new(),
            silver_event_ids,
            schema_version: super::bronze::SCHEMA_VERSION.to_string(),
            security_metadata,
            audit_metadata: AlertAuditMetadata::new(created_by),
            compliance_metadata: ComplianceMetadata::default(),
            encrypted_fields: BTreeMap::new(),
            history: vec![StatusTransition {
                status: AlertStatus::New,
                at: now,
                actor: created_by.to_string(),
                reason: Some("alert created".to_string()),
                metadata: BTreeMap::new(),
            }],
        }
    }

    /// First-failure structural validation.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.alert_id.is_nil() {
            return Err(PipelineError::validation("alert_id", "must not be nil"));
        }
        if self.client_id.is_empty() {
            return Err(PipelineError::validation("client_id", "must not be empty"));
        }
        if self.silver_event_ids.is_empty() {
            return Err(PipelineError::validation(
                "silver_event_ids",
                "must reference at least one silver event",
            ));
        }
        if !(0.0..=1.0).contains(&self.security_metadata.confidence) {
            return Err(PipelineError::validation(
                "security_metadata.confidence",
                "must be within [0, 1]",
            ));
        }
        match self.history.first() {
            Some(first) if first.status == AlertStatus::New => {}
            _ => {
                return Err(PipelineError::validation(
                    "history",
                    "first history entry must be status new",
                ))
            }
        }
        for pair in self.history.windows(2) {
            if !pair[0].status.can_transition_to(pair[1].status) {
                return Err(PipelineError::validation(
                    "history",
                    format!(
                        "illegal transition {} -> {}",
                        pair[0].status, pair[1].status
                    ),
                ));
            }
        }
        if let Some(last) = self.history.last() {
            if last.status != self.status {
                return Err(PipelineError::validation(
                    "status",
                    "status does not match last history entry",
                ));
            }
        }
        Ok(())
    }

    /// Whether this alert is still inside its mutability window.
    pub fn in_retention(&self, now: DateTime<Utc>) -> bool {
        now - self.audit_metadata.created_at < Duration::days(ALERT_MAX_LIFETIME_DAYS)
    }

    /// Append a status change, enforcing the transition graph and the
    /// retention gate. History-append serialization is the caller's job.
    pub fn transition(
        &mut self,
        next: AlertStatus,
        actor: &str,
        reason: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        if !self.in_retention(Utc::now()) {
            return Err(PipelineError::OutOfRetention);
        }
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.history.push(StatusTransition {
            status: next,
            at: Utc::now(),
            actor: actor.to_string(),
            reason,
            metadata,
        });
        self.audit_metadata.touch(actor);
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| PipelineError::internal(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::validation("json", e.to_string()))
    }
}
