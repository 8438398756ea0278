use crate::domain::audit::{verify_chain, AuditRecord};
use crate::error::ErrorCode;
use tokio::sync::Mutex;
use uuid::Uuid;

const GENESIS_HASH: &str = "genesis";

/// Append-only, hash-chained audit log for pipeline events.
///
/// Rejection entries carry the error code and classification only; raw
/// payloads never enter the audit trail.
pub struct AuditService {
    records: Mutex<Vec<AuditRecord>>,
}

impl Default for AuditService {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditService {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    async fn append(
        &self,
        event_type: &str,
        actor: &str,
        detail: serde_json::Value,
        client_id: Option<String>,
        subject_id: Option<Uuid>,
    ) -> AuditRecord {
        let mut records = self.records.lock().await;
        let prev_hash = records
            .last()
            .map(|r| r.current_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let record = AuditRecord::new(event_type, actor, detail, client_id, subject_id, prev_hash);
        records.push(record.clone());
        record
    }

    pub async fn log_admission_rejected(
        &self,
        client_id: &str,
        code: ErrorCode,
        reason: &str,
    ) -> AuditRecord {
        self.append(
            "admission.rejected",
            "admission",
            serde_json::json!({"code": code.as_str(), "reason": reason}),
            Some(client_id.to_string()),
            None,
        )
        .await
    }

    /// Security rejections record the classification, never the payload.
    pub async fn log_security_rejection(&self, client_id: &str, classification: &str) -> AuditRecord {
        self.append(
            "admission.security_rejected",
            "admission",
            serde_json::json!({"classification": classification}),
            Some(client_id.to_string()),
            None,
        )
        .await
    }

    pub async fn log_alert_created(&self, alert_id: Uuid, client_id: &str, actor: &str) -> AuditRecord {
        self.append(
            "alert.created",
            actor,
            serde_json::json!({}),
            Some(client_id.to_string()),
            Some(alert_id),
        )
        .await
    }

    pub async fn log_alert_status_changed(
        &self,
        alert_id: Uuid,
        actor: &str,
        from: &str,
        to: &str,
    ) -> AuditRecord {
        self.append(
            "alert.status_changed",
            actor,
            serde_json::json!({"from": from, "to": to}),
            None,
            Some(alert_id),
        )
        .await
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    pub async fn verify(&self) -> bool {
        verify_chain(&self.records.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chain_links_records() {
        let service = AuditService::new();
        service
            .log_admission_rejected("c1", ErrorCode::ResourceUtilization, "rate limited")
            .await;
        service.log_security_rejection("c1", "sql_injection").await;
        let alert_id = Uuid::new_v4();
        service.log_alert_created(alert_id, "c1", "correlator").await;

        let records = service.records().await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].prev_hash, "genesis");
        assert_eq!(records[1].prev_hash, records[0].current_hash);
        assert!(service.verify().await);
    }

    #[tokio::test]
    async fn test_security_entries_carry_no_payload() {
        let service = AuditService::new();
        service.log_security_rejection("c1", "shell_injection").await;
        let records = service.records().await;
        let rendered = records[0].detail.to_string();
        assert!(rendered.contains("shell_injection"));
        assert!(!rendered.contains("payload"));
    }
}
