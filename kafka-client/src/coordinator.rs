use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConsumerBackend, ConsumerConfig, KafkaConfig};
use crate::dead_letter::FailedMessageRouter;
use crate::error::ConsumerError;
use crate::generation::GenerationCoordinator;
use crate::kafka::{KafkaConsumerGroup, KafkaGenerationGroup};
use crate::partition_loop::LoopContext;
use crate::session::SessionCoordinator;
use crate::topic::TopicRegistry;

/// Pause between failed attempts to join or consume a membership epoch.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Backend-independent handle on a running consumer.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Consumes until [`Coordinator::stop`] is called, then releases the group. A release
    /// failure is returned as [`ConsumerError::Release`] and must be treated as fatal.
    async fn start(&self) -> Result<(), ConsumerError>;

    fn stop(&self);

    /// True once the first membership epoch started.
    fn is_ready(&self) -> bool;
}

/// Builds the coordinator selected by `config`, after checking every subscribed topic has a
/// configuration. Must be called from within a tokio runtime.
pub fn build_coordinator<D>(
    kafka: &KafkaConfig,
    config: &ConsumerConfig,
    topics: TopicRegistry<D>,
    deps: Arc<D>,
    router: FailedMessageRouter,
    shutdown: CancellationToken,
) -> Result<Box<dyn Coordinator>, ConsumerError>
where
    D: Send + Sync + 'static,
{
    topics.validate(config.topics())?;

    let ctx = LoopContext {
        topics: Arc::new(topics),
        deps,
        router,
        cancel: shutdown.clone(),
    };
    let client_config = config.client_config(kafka);

    info!(
        backend = %config.kafka_consumer_backend,
        group = %config.kafka_consumer_group,
        topics = ?config.topics(),
        "creating consumer"
    );

    let coordinator: Box<dyn Coordinator> = match config.kafka_consumer_backend {
        ConsumerBackend::Generation => {
            let group = KafkaGenerationGroup::new(
                client_config,
                config.topics(),
                config.kafka_consumer_partition_buffer,
                shutdown,
            )?;
            Box::new(GenerationCoordinator::new(group, ctx))
        }
        ConsumerBackend::Session => {
            let group = KafkaConsumerGroup::new(
                client_config,
                config.topics(),
                config.kafka_consumer_partition_buffer,
                config.kafka_consumer_auto_commit_interval_ms,
                shutdown,
            )?;
            Box::new(SessionCoordinator::new(
                group,
                config.topics().to_vec(),
                ctx,
            ))
        }
    };

    Ok(coordinator)
}
