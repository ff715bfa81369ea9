//! Partition message loop shared by both consumer backends.
//!
//! The loop owns one (topic, partition) for the lifetime of a membership epoch. It reads a
//! record, hands it to the topic's processor and then reports the outcome back to its
//! [`MessageSource`], which decides what "progress" means for its backend: an explicit
//! offset commit for the generation backend, an acknowledgment for the session backend.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dead_letter::FailedMessageRouter;
use crate::error::ReadError;
use crate::message::{FailedMessage, Message, RawMessage};
use crate::metrics_consts::{
    MESSAGES_FAILED, MESSAGES_PROCESSED, MESSAGES_UNCONFIGURED_TOPIC, PARTITION_READ_ERRORS,
    PROCESSING_DURATION_MS,
};
use crate::topic::TopicRegistry;

/// Read-next/acknowledge abstraction a partition loop runs over.
#[async_trait]
pub trait MessageSource: Send {
    /// Next record in partition order. `Ok(None)` means the source was stopped cleanly
    /// (cancellation or end of the claim).
    async fn next_message(&mut self) -> Result<Option<RawMessage>, ReadError>;

    /// Records that `message` was processed.
    async fn acknowledge(&mut self, message: &Message);

    /// Records that processing `message` failed.
    async fn reject(&mut self, message: &Message);
}

/// Everything a partition loop needs besides its source.
pub struct LoopContext<D> {
    pub topics: Arc<TopicRegistry<D>>,
    pub deps: Arc<D>,
    pub router: FailedMessageRouter,
    /// Handed to processors; cancelled when the loop's epoch or the consumer stops.
    pub cancel: CancellationToken,
}

impl<D> Clone for LoopContext<D> {
    fn clone(&self) -> Self {
        Self {
            topics: self.topics.clone(),
            deps: self.deps.clone(),
            router: self.router.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<D> LoopContext<D> {
    /// Same context, with processors observing `cancel` instead.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

#[derive(Debug)]
pub enum LoopExit {
    /// The source stopped cleanly.
    Stopped,
    /// Reading failed; the owning coordinator recreates the loop on the next epoch.
    ReadFailed(ReadError),
}

pub async fn run_partition_loop<D, S>(source: &mut S, ctx: &LoopContext<D>) -> LoopExit
where
    D: Send + Sync + 'static,
    S: MessageSource + ?Sized,
{
    loop {
        let raw = match source.next_message().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return LoopExit::Stopped,
            Err(e @ ReadError::GenerationEnded(_)) => {
                debug!("partition loop done: {}", e);
                return LoopExit::ReadFailed(e);
            }
            Err(e) => {
                error!("failed to read message: {}", e);
                metrics::counter!(PARTITION_READ_ERRORS).increment(1);
                return LoopExit::ReadFailed(e);
            }
        };

        let Some(topic) = ctx.topics.get(&raw.topic) else {
            error!(
                topic = %raw.topic,
                partition = raw.partition,
                offset = raw.offset,
                "no topic configuration, skipping message"
            );
            metrics::counter!(MESSAGES_UNCONFIGURED_TOPIC, "topic" => raw.topic.clone())
                .increment(1);
            continue;
        };

        let message = Message::new(raw, topic.codec().clone());
        debug!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "message claimed"
        );

        let started = Instant::now();
        let result = topic
            .processor()
            .process(ctx.cancel.clone(), ctx.deps.clone(), message.clone())
            .await;
        metrics::histogram!(PROCESSING_DURATION_MS, "topic" => message.topic().to_string())
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(()) => {
                metrics::counter!(MESSAGES_PROCESSED, "topic" => message.topic().to_string())
                    .increment(1);
                source.acknowledge(&message).await;
            }
            Err(e) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "failed to process message: {:#}",
                    e
                );
                metrics::counter!(MESSAGES_FAILED, "topic" => message.topic().to_string())
                    .increment(1);

                if let Some(failed_topic) = topic.failed_topic() {
                    // The router logs and counts drops itself
                    let _ = ctx
                        .router
                        .forward(FailedMessage::new(message.clone(), failed_topic, e));
                }

                source.reject(&message).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::dead_letter::failed_message_channel;
    use crate::topic::TopicConfig;
    use std::collections::VecDeque;

    /// Source that replays a fixed script and records outcomes.
    struct ScriptedSource {
        script: VecDeque<Result<RawMessage, ReadError>>,
        acked: Vec<i64>,
        rejected: Vec<i64>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<RawMessage, ReadError>>) -> Self {
            Self {
                script: script.into(),
                acked: Vec::new(),
                rejected: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn next_message(&mut self) -> Result<Option<RawMessage>, ReadError> {
            self.script.pop_front().transpose()
        }

        async fn acknowledge(&mut self, message: &Message) {
            self.acked.push(message.offset());
        }

        async fn reject(&mut self, message: &Message) {
            self.rejected.push(message.offset());
        }
    }

    fn record(topic: &str, offset: i64) -> Result<RawMessage, ReadError> {
        Ok(RawMessage::new(topic, 0, offset, &b"{}"[..]))
    }

    fn context(
        failed_topic: Option<&str>,
        capacity: usize,
    ) -> (LoopContext<()>, crate::dead_letter::FailedMessageReceiver) {
        let mut config = TopicConfig::new(
            "orders",
            Arc::new(JsonCodec),
            |_: CancellationToken, _: Arc<()>, message: Message| async move {
                anyhow::ensure!(message.offset() % 2 == 0, "odd offset");
                Ok(())
            },
        );
        if let Some(topic) = failed_topic {
            config = config.with_failed_topic(topic);
        }
        let (router, receiver) = failed_message_channel(capacity);
        let ctx = LoopContext {
            topics: Arc::new(TopicRegistry::new(vec![config]).unwrap()),
            deps: Arc::new(()),
            router,
            cancel: CancellationToken::new(),
        };
        (ctx, receiver)
    }

    #[tokio::test]
    async fn acknowledges_successes_and_rejects_failures_in_order() {
        let (ctx, mut receiver) = context(Some("orders-failed"), 8);
        let mut source = ScriptedSource::new(vec![
            record("orders", 0),
            record("orders", 1),
            record("orders", 2),
        ]);

        let exit = run_partition_loop(&mut source, &ctx).await;

        assert!(matches!(exit, LoopExit::Stopped));
        assert_eq!(source.acked, vec![0, 2]);
        assert_eq!(source.rejected, vec![1]);

        let failed = receiver.try_recv().expect("failed message routed");
        assert_eq!(failed.topic(), "orders-failed");
        assert_eq!(failed.offset(), 1);
        assert_eq!(failed.error().to_string(), "odd offset");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn failures_without_dead_letter_topic_are_not_routed() {
        let (ctx, mut receiver) = context(None, 8);
        let mut source = ScriptedSource::new(vec![record("orders", 1), record("orders", 2)]);

        run_partition_loop(&mut source, &ctx).await;

        assert_eq!(source.rejected, vec![1]);
        assert_eq!(source.acked, vec![2]);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_router_does_not_stop_the_loop() {
        let (ctx, _receiver) = context(Some("orders-failed"), 0);
        let mut source = ScriptedSource::new(vec![
            record("orders", 1),
            record("orders", 3),
            record("orders", 4),
        ]);

        run_partition_loop(&mut source, &ctx).await;

        assert_eq!(source.rejected, vec![1, 3]);
        assert_eq!(source.acked, vec![4]);
    }

    #[tokio::test]
    async fn skips_unconfigured_topics_without_progress() {
        let (ctx, _receiver) = context(None, 8);
        let mut source = ScriptedSource::new(vec![record("refunds", 0), record("orders", 2)]);

        run_partition_loop(&mut source, &ctx).await;

        assert_eq!(source.acked, vec![2]);
        assert!(source.rejected.is_empty());
    }

    #[tokio::test]
    async fn read_error_terminates_the_loop() {
        let (ctx, _receiver) = context(None, 8);
        let mut source = ScriptedSource::new(vec![
            record("orders", 0),
            Err(ReadError::GenerationEnded(3)),
            record("orders", 2),
        ]);

        let exit = run_partition_loop(&mut source, &ctx).await;

        assert!(matches!(
            exit,
            LoopExit::ReadFailed(ReadError::GenerationEnded(3))
        ));
        assert_eq!(source.acked, vec![0]);
        assert_eq!(source.script.len(), 1);
    }
}
