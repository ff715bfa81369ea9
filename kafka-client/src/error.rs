use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::codec::CodecError;

/// Errors raised while reading the next record of a partition.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("generation {0} ended")]
    GenerationEnded(u64),
    #[error("partition stream for {topic}:{partition} closed")]
    StreamClosed { topic: String, partition: i32 },
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("generation {0} is no longer active")]
    GenerationEnded(u64),
    #[error("commit task failed: {0}")]
    Join(String),
}

/// Errors from joining or running a consumer group membership epoch.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("rebalance failed: {0}")]
    Rebalance(String),
    #[error("group client is closed")]
    Closed,
    #[error("session handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ForwardError {
    #[error("failed message router is full")]
    Full,
    #[error("failed message router is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("no codec configured for topic {0}")]
    MissingCodec(String),
    #[error("unsupported message type")]
    UnsupportedMessageType,
    #[error("failed to encode message for topic {topic}: {error}")]
    Encode { topic: String, error: CodecError },
    #[error("failed to produce to kafka: {error}")]
    Kafka { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no topic configuration registered for {0}")]
    MissingTopic(String),
    #[error("topic {0} registered twice")]
    DuplicateTopic(String),
    #[error("invalid producer mode: {0}")]
    InvalidProducerMode(String),
    #[error("invalid consumer backend: {0}")]
    InvalidBackend(String),
    #[error("no topics to consume")]
    NoTopics,
}

/// Errors surfaced by the blocking consume entry points.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer initialization failed: {0}")]
    Init(#[from] ConfigError),
    #[error("failed to create kafka consumer: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer already started")]
    AlreadyStarted,
    /// The group could not confirm it released its partition claims. Callers must treat
    /// this as fatal.
    #[error("failed to release consumer group: {0}")]
    Release(#[source] KafkaError),
}
