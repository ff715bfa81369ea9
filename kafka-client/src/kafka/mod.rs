//! rdkafka-backed implementations of both consumer backends.

pub mod backlog;
pub mod context;
pub mod generation;
pub mod group_client;
pub mod session;

pub use generation::KafkaGenerationGroup;
pub use session::KafkaConsumerGroup;
