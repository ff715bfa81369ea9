//! Dead-letter hand-off for messages whose processing failed.
//!
//! Partition loops hand failed messages to a [`FailedMessageRouter`] without ever waiting:
//! when the bounded buffer is full the message is dropped from the hand-off and the drop
//! is logged. The record itself stays in the source partition, only the dead-letter copy is
//! lost. A single [`DeadLetterForwarder`] drains the buffer and republishes each message on
//! its destination topic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ForwardError, ProduceError};
use crate::message::FailedMessage;
use crate::metrics_consts::{
    DEAD_LETTER_DROPPED, DEAD_LETTER_PUBLISHED, DEAD_LETTER_PUBLISH_ERRORS, DEAD_LETTER_ROUTED,
};

/// Creates the router/receiver pair. A `capacity` of zero disables buffering: every
/// forward is reported as dropped.
pub fn failed_message_channel(capacity: usize) -> (FailedMessageRouter, FailedMessageReceiver) {
    if capacity == 0 {
        return (
            FailedMessageRouter { tx: None },
            FailedMessageReceiver { rx: None },
        );
    }

    let (tx, rx) = mpsc::channel(capacity);
    (
        FailedMessageRouter { tx: Some(tx) },
        FailedMessageReceiver { rx: Some(rx) },
    )
}

/// Sending half, cloned into every partition loop.
#[derive(Clone)]
pub struct FailedMessageRouter {
    tx: Option<mpsc::Sender<FailedMessage>>,
}

impl FailedMessageRouter {
    /// Hands `failed` over without waiting for buffer space.
    pub fn forward(&self, failed: FailedMessage) -> Result<(), ForwardError> {
        let (source_topic, partition, offset) = (
            failed.message().topic().to_string(),
            failed.message().partition(),
            failed.offset(),
        );

        let result = match &self.tx {
            None => Err(ForwardError::Full),
            Some(tx) => tx.try_send(failed).map_err(|e| match e {
                TrySendError::Full(_) => ForwardError::Full,
                TrySendError::Closed(_) => ForwardError::Closed,
            }),
        };

        match &result {
            Ok(()) => {
                metrics::counter!(DEAD_LETTER_ROUTED, "topic" => source_topic.clone()).increment(1);
                info!(
                    topic = %source_topic,
                    partition, offset, "failed message sent to fail handler"
                );
            }
            Err(e) => {
                metrics::counter!(DEAD_LETTER_DROPPED, "topic" => source_topic.clone())
                    .increment(1);
                error!(
                    topic = %source_topic,
                    partition, offset, "failed message not sent to fail handler: {}", e
                );
            }
        }

        result
    }
}

pub struct FailedMessageReceiver {
    rx: Option<mpsc::Receiver<FailedMessage>>,
}

impl FailedMessageReceiver {
    /// Next failed message, or `None` once every router clone is gone.
    pub async fn recv(&mut self) -> Option<FailedMessage> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<FailedMessage> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}

/// Destination for dead-lettered messages, usually the [`crate::producer::Producer`].
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish_failed(&self, failed: &FailedMessage) -> Result<(), ProduceError>;
}

pub struct DeadLetterForwarder<S: DeadLetterSink> {
    receiver: FailedMessageReceiver,
    sink: Arc<S>,
}

impl<S: DeadLetterSink> DeadLetterForwarder<S> {
    pub fn new(receiver: FailedMessageReceiver, sink: Arc<S>) -> Self {
        Self { receiver, sink }
    }

    /// Republishes failed messages until the routers are dropped or `shutdown` fires.
    /// Messages already buffered when shutdown fires are still published.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting dead-letter forwarder");

        loop {
            let failed = tokio::select! {
                failed = self.receiver.recv() => failed,
                _ = shutdown.cancelled() => {
                    while let Some(failed) = self.receiver.try_recv() {
                        self.publish(failed).await;
                    }
                    break;
                }
            };

            match failed {
                Some(failed) => self.publish(failed).await,
                None => break,
            }
        }

        info!("Dead-letter forwarder shutting down");
    }

    async fn publish(&self, failed: FailedMessage) {
        match self.sink.publish_failed(&failed).await {
            Ok(()) => {
                metrics::counter!(DEAD_LETTER_PUBLISHED, "topic" => failed.topic().to_string())
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(DEAD_LETTER_PUBLISH_ERRORS, "topic" => failed.topic().to_string())
                    .increment(1);
                warn!(
                    topic = failed.topic(),
                    source_topic = failed.message().topic(),
                    offset = failed.offset(),
                    "failed to publish dead-letter message: {}",
                    e
                );
            }
        }
    }
}
