use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::CoordinationError;
use crate::kafka::group_client::{GroupClient, GroupConsumer};
use crate::metrics_consts::OFFSET_MARK_FAILURES;
use crate::session::{run_session, Claim, ConsumerGroup, GroupHandler, GroupSession};

/// Session backend over an rdkafka consumer group. Acknowledged offsets are stored on the
/// consumer and committed by the client every auto-commit interval.
pub struct KafkaConsumerGroup {
    client: GroupClient,
}

impl KafkaConsumerGroup {
    pub fn new(
        mut client_config: ClientConfig,
        topics: &[String],
        partition_buffer: usize,
        auto_commit_interval_ms: u32,
        shutdown: CancellationToken,
    ) -> Result<Self, KafkaError> {
        client_config
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false");
        let client = GroupClient::new(&client_config, topics, partition_buffer, shutdown)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    type Session = KafkaSession;

    async fn consume(
        &self,
        cancel: &CancellationToken,
        _topics: &[String],
        handler: Arc<dyn GroupHandler<KafkaSession>>,
    ) -> Result<(), CoordinationError> {
        let epoch = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            epoch = self.client.next_epoch() => epoch?,
        };

        let claims = epoch
            .claims
            .into_iter()
            .map(|(assignment, rx)| {
                Claim::new(
                    assignment.topic(),
                    assignment.partition_number(),
                    assignment.offset(),
                    rx,
                )
            })
            .collect();

        let session = Arc::new(KafkaSession {
            id: epoch.id,
            context: epoch.token,
            consumer: self.client.consumer().clone(),
        });

        run_session(session, claims, handler).await
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.client.stop_polling().await;

        let consumer = self.client.consumer();
        match consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => info!("committed acknowledged offsets"),
            // Nothing was acknowledged since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                error!("failed to commit acknowledged offsets on close: {}", e);
                return Err(e);
            }
        }

        consumer.unsubscribe();
        info!("left consumer group");
        Ok(())
    }
}

pub struct KafkaSession {
    id: u64,
    context: CancellationToken,
    consumer: Arc<GroupConsumer>,
}

impl GroupSession for KafkaSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn context(&self) -> &CancellationToken {
        &self.context
    }

    fn mark_message(&self, topic: &str, partition: i32, offset: i64) {
        // The stored offset is the next one to read
        if let Err(e) = self.consumer.store_offset(topic, partition, offset + 1) {
            error!(topic, partition, offset, "failed to store offset: {}", e);
            metrics::counter!(OFFSET_MARK_FAILURES, "topic" => topic.to_string()).increment(1);
        }
    }
}
