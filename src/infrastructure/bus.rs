use crate::error::PipelineError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

pub const BRONZE_TOPIC: &str = "bronze_events";
pub const SILVER_TOPIC: &str = "silver_events";

/// One record delivered from the bus.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: String,
    pub partition_key: String,
    pub offset: u64,
    pub payload: Bytes,
}

/// Message-broker contract: at-least-once delivery with per-partition
/// ordering. Records stay in flight between `poll` and `ack`; records
/// surrendered (or never acked) are redelivered on a later poll.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Bytes,
    ) -> Result<u64, PipelineError>;

    async fn poll(
        &self,
        group: &str,
        topic: &str,
        max_records: usize,
    ) -> Result<Vec<BusRecord>, PipelineError>;

    async fn ack(&self, group: &str, topic: &str, offset: u64) -> Result<(), PipelineError>;

    /// Hand an in-flight record back for redelivery.
    async fn surrender(&self, group: &str, topic: &str, offset: u64) -> Result<(), PipelineError>;

    /// Records neither acked nor in flight for a consumer group.
    async fn pending(&self, group: &str, topic: &str) -> usize;
}

#[derive(Debug)]
struct StoredRecord {
    partition_key: String,
    payload: Bytes,
    offset: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    in_flight: HashSet<u64>,
    acked: HashSet<u64>,
}

#[derive(Debug, Default)]
struct TopicState {
    records: Vec<StoredRecord>,
    next_offset: u64,
    groups: HashMap<String, GroupState>,
}

/// Reference bus used for wiring and tests. Publish order is delivery
/// order, which makes every partition FIFO for a single consumer group.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Bytes,
    ) -> Result<u64, PipelineError> {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        let offset = state.next_offset;
        state.next_offset += 1;
        state.records.push(StoredRecord {
            partition_key: partition_key.to_string(),
            payload,
            offset,
        });
        Ok(offset)
    }

    async fn poll(
        &self,
        group: &str,
        topic: &str,
        max_records: usize,
    ) -> Result<Vec<BusRecord>, PipelineError> {
        let mut topics = self.topics.lock().await;
        let state = match topics.get_mut(topic) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };
        let group_state = state.groups.entry(group.to_string()).or_default();

        let mut delivered = Vec::new();
        for record in &state.records {
            if delivered.len() >= max_records {
                break;
            }
            if group_state.acked.contains(&record.offset)
                || group_state.in_flight.contains(&record.offset)
            {
                continue;
            }
            group_state.in_flight.insert(record.offset);
            delivered.push(BusRecord {
                topic: topic.to_string(),
                partition_key: record.partition_key.clone(),
                offset: record.offset,
                payload: record.payload.clone(),
            });
        }
        Ok(delivered)
    }

    async fn ack(&self, group: &str, topic: &str, offset: u64) -> Result<(), PipelineError> {
        let mut topics = self.topics.lock().await;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| PipelineError::transient("bus", format!("unknown topic {topic}")))?;
        let group_state = state.groups.entry(group.to_string()).or_default();
        group_state.in_flight.remove(&offset);
        group_state.acked.insert(offset);
        Ok(())
    }

    async fn surrender(&self, group: &str, topic: &str, offset: u64) -> Result<(), PipelineError> {
        let mut topics = self.topics.lock().await;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| PipelineError::transient("bus", format!("unknown topic {topic}")))?;
        let group_state = state.groups.entry(group.to_string()).or_default();
        group_state.in_flight.remove(&offset);
        Ok(())
    }

    async fn pending(&self, group: &str, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        let Some(state) = topics.get(topic) else {
            return 0;
        };
        match state.groups.get(group) {
            Some(group_state) => state
                .records
                .iter()
                .filter(|r| {
                    !group_state.acked.contains(&r.offset)
                        && !group_state.in_flight.contains(&r.offset)
                })
                .count(),
            None => state.records.len(),
        }
    }
}
