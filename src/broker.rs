//! Thin abstraction over the message broker.
//!
//! [`ReliableBroker`] gives the pipeline idempotent publish, consumer-group
//! delivery with per-key partitioning, and dead-letter redirection that
//! preserves the source partition so per-file-hash ordering survives
//! replay. [`ChannelBroker`] is the in-process implementation used by the
//! worker runtime and tests; a durable broker client slots in behind the
//! same trait in production deployments.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{Result, TidepoolError};

/// Name of the dead-letter topic paired with `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlt")
}

/// One delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub partition: usize,
    pub key: String,
    pub message_id: String,
    pub payload: String,
}

/// Payload carried on a dead-letter topic: the original message plus
/// failure metadata, for later manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub partition: usize,
    pub key: String,
    pub message_id: String,
    pub payload: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReliableBroker: Send + Sync {
    /// Publish keyed by `key`; messages with the same key land on the same
    /// partition. Idempotent by `message_id`: republishing an already-seen
    /// id is a no-op, so producer retries never duplicate.
    async fn publish(&self, topic: &str, key: &str, message_id: &str, payload: String)
        -> Result<()>;

    /// Publish to an explicit partition. Used for dead-letter redirection,
    /// where the source partition must be preserved.
    async fn publish_to_partition(
        &self,
        topic: &str,
        partition: usize,
        key: &str,
        message_id: &str,
        payload: String,
    ) -> Result<()>;

    /// Attach a consumer group and return one receiver per partition.
    fn subscribe(&self, topic: &str, group: &str) -> Result<Vec<UnboundedReceiver<Envelope>>>;

    fn partitions(&self) -> usize;

    /// Redirect a failed delivery to the paired dead-letter topic, on the
    /// same partition, carrying the original payload and key.
    async fn dead_letter(&self, envelope: &Envelope, error: &str, attempts: u32) -> Result<()> {
        let dead = DeadLetter {
            source_topic: envelope.topic.clone(),
            partition: envelope.partition,
            key: envelope.key.clone(),
            message_id: envelope.message_id.clone(),
            payload: envelope.payload.clone(),
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&dead)
            .map_err(|e| TidepoolError::TransientIo(format!("serialize dead letter: {e}")))?;
        self.publish_to_partition(
            &dead_letter_topic(&envelope.topic),
            envelope.partition,
            &envelope.key,
            &Uuid::new_v4().to_string(),
            payload,
        )
        .await
    }
}

struct TopicChannels {
    senders: Vec<UnboundedSender<Envelope>>,
    pending: Vec<Option<UnboundedReceiver<Envelope>>>,
}

impl TopicChannels {
    fn new(partitions: usize) -> Self {
        let mut senders = Vec::with_capacity(partitions);
        let mut pending = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            pending.push(Some(rx));
        }
        Self { senders, pending }
    }
}

/// In-process broker: one unbounded channel per topic partition, so
/// per-partition ordering holds by construction. Producer idempotence is a
/// seen-set over `(topic, message_id)`.
pub struct ChannelBroker {
    partition_count: usize,
    idempotent: bool,
    topics: Mutex<HashMap<String, TopicChannels>>,
    published: Mutex<HashSet<(String, String)>>,
}

impl ChannelBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        let transactional_id = format!("{}{}", config.transactional_id_prefix, Uuid::new_v4());
        info!(
            partitions = config.partitions,
            acks = %config.producer_acks,
            idempotent = config.producer_idempotent,
            retries = config.producer_retries,
            %transactional_id,
            "in-process broker ready"
        );
        Self {
            partition_count: config.partitions,
            idempotent: config.producer_idempotent,
            topics: Mutex::new(HashMap::new()),
            published: Mutex::new(HashSet::new()),
        }
    }

    /// Stable key-to-partition mapping.
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partition_count
    }
}

#[async_trait]
impl ReliableBroker for ChannelBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        message_id: &str,
        payload: String,
    ) -> Result<()> {
        let partition = self.partition_for(key);
        self.publish_to_partition(topic, partition, key, message_id, payload)
            .await
    }

    async fn publish_to_partition(
        &self,
        topic: &str,
        partition: usize,
        key: &str,
        message_id: &str,
        payload: String,
    ) -> Result<()> {
        if partition >= self.partition_count {
            return Err(TidepoolError::Validation(format!(
                "partition {partition} out of range (topic has {})",
                self.partition_count
            )));
        }

        if self.idempotent {
            let mut published = self.published.lock();
            if !published.insert((topic.to_string(), message_id.to_string())) {
                debug!(topic, message_id, "duplicate publish suppressed");
                return Ok(());
            }
        }

        let envelope = Envelope {
            topic: topic.to_string(),
            partition,
            key: key.to_string(),
            message_id: message_id.to_string(),
            payload,
        };

        let mut topics = self.topics.lock();
        let channels = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicChannels::new(self.partition_count));
        channels.senders[partition].send(envelope).map_err(|_| {
            TidepoolError::TransientIo(format!("topic {topic} partition {partition} is closed"))
        })?;
        Ok(())
    }

    fn subscribe(&self, topic: &str, group: &str) -> Result<Vec<UnboundedReceiver<Envelope>>> {
        let mut topics = self.topics.lock();
        let channels = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicChannels::new(self.partition_count));

        let mut receivers = Vec::with_capacity(self.partition_count);
        for slot in channels.pending.iter_mut() {
            match slot.take() {
                Some(rx) => receivers.push(rx),
                None => {
                    return Err(TidepoolError::Conflict(format!(
                        "a consumer group is already attached to {topic}"
                    )))
                }
            }
        }
        info!(topic, group, partitions = receivers.len(), "consumer group attached");
        Ok(receivers)
    }

    fn partitions(&self) -> usize {
        self.partition_count
    }
}
