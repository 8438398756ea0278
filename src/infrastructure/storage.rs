use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Data tier a record belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
        }
    }

    /// Documented retention policy; enforcement is the storage backend's job.
    pub fn retention_days(&self) -> u32 {
        match self {
            Tier::Bronze => 30,
            Tier::Silver => 90,
            Tier::Gold => 365,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Partition key layout: `{tier}/{yyyy}/{mm}/{dd}/{unix_seconds}` with
/// full-precision epoch seconds so two records in the same day cannot
/// collide on a truncated suffix.
pub fn partition_key(tier: Tier, at: DateTime<Utc>) -> String {
    format!(
        "{}/{:04}/{:02}/{:02}/{}",
        tier,
        at.year(),
        at.month(),
        at.day(),
        at.timestamp()
    )
}

/// Durable storage contract. The sink owns durability, indexing, and
/// retention enforcement; the pipeline only hands records over.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store(
        &self,
        tier: Tier,
        partition_key: &str,
        record: serde_json::Value,
    ) -> Result<(), PipelineError>;

    /// Fetch records whose partition key starts with the given prefix.
    async fn fetch(
        &self,
        tier: Tier,
        partition_prefix: &str,
    ) -> Result<Vec<serde_json::Value>, PipelineError>;
}

/// Reference sink used for wiring and tests.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: Mutex<BTreeMap<(Tier, String), Vec<serde_json::Value>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, tier: Tier) -> usize {
        let records = self.records.lock().await;
        records
            .iter()
            .filter(|((t, _), _)| *t == tier)
            .map(|(_, v)| v.len())
            .sum()
    }
}

#[async_trait]
impl StorageSink for InMemoryStorage {
    async fn store(
        &self,
        tier: Tier,
        partition_key: &str,
        record: serde_json::Value,
    ) -> Result<(), PipelineError> {
        let mut records = self.records.lock().await;
        records
            .entry((tier, partition_key.to_string()))
            .or_default()
            .push(record);
        Ok(())
    }

    async fn fetch(
        &self,
        tier: Tier,
        partition_prefix: &str,
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|((t, key), _)| *t == tier && key.starts_with(partition_prefix))
            .flat_map(|(_, v)| v.iter().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_partition_key_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
        let key = partition_key(Tier::Silver, at);
        assert_eq!(key, format!("silver/2024/01/20/{}", at.timestamp()));
    }

    #[test]
    fn test_partition_keys_distinct_per_second() {
        let a = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 1).unwrap();
        assert_ne!(partition_key(Tier::Bronze, a), partition_key(Tier::Bronze, b));
    }

    #[test]
    fn test_retention_policy() {
        assert_eq!(Tier::Bronze.retention_days(), 30);
        assert_eq!(Tier::Silver.retention_days(), 90);
        assert_eq!(Tier::Gold.retention_days(), 365);
    }

    #[tokio::test]
    async fn test_store_and_fetch_by_prefix() {
        let sink = InMemoryStorage::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
        sink.store(
            Tier::Gold,
            &partition_key(Tier::Gold, at),
            serde_json::json!({"alert": 1}),
        )
        .await
        .unwrap();

        let fetched = sink.fetch(Tier::Gold, "gold/2024/01/20").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(sink.fetch(Tier::Gold, "gold/2024/01/21").await.unwrap().is_empty());
        assert_eq!(sink.count(Tier::Gold).await, 1);
    }
}
