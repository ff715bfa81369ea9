use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rdkafka::message::{Message as _, OwnedMessage};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Offset;
use serde_json::Value;

use crate::codec::{CodecError, MessageCodec};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A partition handed to this member for one membership epoch, with the offset the
/// broker tells us to start from when it knows one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Assignment {
    partition: Partition,
    offset: Option<i64>,
}

impl Assignment {
    pub fn new(partition: Partition, offset: Option<i64>) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }
}

impl From<TopicPartitionListElem<'_>> for Assignment {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        let offset = match elem.offset() {
            Offset::Offset(o) => Some(o),
            _ => None,
        };
        Self::new(Partition::new(elem.topic(), elem.partition()), offset)
    }
}

/// A record as read from the broker, before any topic configuration is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl From<OwnedMessage> for RawMessage {
    fn from(message: OwnedMessage) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        }
    }
}

/// A consumed record, decoded once with its topic's codec. Read-only to processors;
/// cloning is cheap.
#[derive(Clone)]
pub struct Message {
    raw: RawMessage,
    decoded: Arc<Result<Value, CodecError>>,
}

impl Message {
    pub fn new(raw: RawMessage, codec: Arc<dyn MessageCodec>) -> Self {
        let decoded = Arc::new(codec.decode(&raw.payload));
        Self { raw, decoded }
    }

    pub fn topic(&self) -> &str {
        &self.raw.topic
    }

    pub fn partition(&self) -> i32 {
        self.raw.partition
    }

    pub fn offset(&self) -> i64 {
        self.raw.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.raw.key.as_deref()
    }

    /// The key as UTF-8, if present and valid
    pub fn key_str(&self) -> Option<&str> {
        self.key().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw.payload
    }

    /// The payload as decoded by the topic's codec when the record was claimed.
    pub fn value(&self) -> Result<&Value, CodecError> {
        match &*self.decoded {
            Ok(value) => Ok(value),
            Err(e) => Err(e.clone()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.raw.topic)
            .field("partition", &self.raw.partition)
            .field("offset", &self.raw.offset)
            .field("key", &self.raw.key)
            .field("payload_len", &self.raw.payload.len())
            .finish()
    }
}

/// A message whose processing failed, on its way to a dead-letter topic.
#[derive(Debug)]
pub struct FailedMessage {
    message: Message,
    topic: String,
    error: anyhow::Error,
}

impl FailedMessage {
    pub fn new(message: Message, topic: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            message,
            topic: topic.into(),
            error,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Destination (dead-letter) topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn offset(&self) -> i64 {
        self.message.offset()
    }
}
