use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

impl KafkaConfig {
    pub fn producer_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", self.kafka_compression_codec.to_owned())
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                self.kafka_producer_queue_messages.to_string(),
            );
        client_config
    }
}

/// Which group protocol implementation drives consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerBackend {
    /// Explicit generations, offsets committed by the partition loops.
    Generation,
    /// Callback-driven sessions, acknowledged offsets committed by the client.
    Session,
}

impl FromStr for ConsumerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "generation" => Ok(ConsumerBackend::Generation),
            "session" => Ok(ConsumerBackend::Session),
            _ => Err(ConfigError::InvalidBackend(s.to_string())),
        }
    }
}

impl fmt::Display for ConsumerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerBackend::Generation => write!(f, "generation"),
            ConsumerBackend::Session => write!(f, "session"),
        }
    }
}

/// Comma separated list of topics, e.g. "orders,refunds"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

impl FromStr for TopicList {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        Ok(TopicList(topics))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topics: TopicList,

    #[envconfig(default = "generation")]
    pub kafka_consumer_backend: ConsumerBackend,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Records buffered between the group client and each partition loop
    #[envconfig(default = "100")]
    pub kafka_consumer_partition_buffer: usize,

    // Failed messages buffered on their way to the dead-letter topic, 0 disables forwarding
    #[envconfig(default = "100")]
    pub kafka_consumer_failed_message_buffer: usize,

    // Interval between commits of acknowledged offsets, session backend only
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

impl ConsumerConfig {
    pub fn topics(&self) -> &[String] {
        &self.kafka_consumer_topics.0
    }

    /// Client settings shared by both backends; each backend decides how offsets move.
    pub fn client_config(&self, kafka: &KafkaConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &kafka.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &self.kafka_consumer_group)
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .set("partition.assignment.strategy", "range,roundrobin")
            .set("enable.partition.eof", "false");
        client_config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// `produce` returns once the broker acknowledged the message.
    Sync,
    /// `produce` returns once the message is queued; delivery reports are logged.
    Async,
}

impl FromStr for ProducerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" => Ok(ProducerMode::Sync),
            "async" => Ok(ProducerMode::Async),
            _ => Err(ConfigError::InvalidProducerMode(s.to_string())),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    #[envconfig(default = "sync")]
    pub kafka_producer_mode: ProducerMode,

    // How long a synchronous send waits for a free slot in the producer queue
    #[envconfig(default = "5000")]
    pub kafka_producer_enqueue_timeout_ms: u64,
}

impl ProducerConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_producer_enqueue_timeout_ms)
    }
}
