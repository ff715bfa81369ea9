use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::{ClientConfig, TopicPartitionList};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CoordinationError;
use crate::kafka::backlog::{Backlogs, Routed};
use crate::kafka::context::{Epoch, EpochEvent, PartitionRoutes, RebalanceContext};
use crate::message::{Partition, RawMessage};
use crate::metrics_consts::{CONSUMER_RECV_ERRORS, PARTITIONS_PAUSED, UNROUTED_MESSAGES};

pub type GroupConsumer = StreamConsumer<RebalanceContext>;

/// How often records held for paused partitions are offered to their claims again.
const BACKLOG_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Consumer group membership shared by both rdkafka backends.
///
/// A single pump task polls the consumer, which is also what drives librdkafka's rebalance
/// callbacks, and routes every record to the stream of the epoch that owns its partition.
/// A partition whose stream is full is paused rather than waited on.
pub struct GroupClient {
    consumer: Arc<GroupConsumer>,
    events: Mutex<mpsc::UnboundedReceiver<EpochEvent>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl GroupClient {
    /// Creates the consumer and subscribes it to `topics`. `shutdown` cancels every epoch.
    pub fn new(
        client_config: &ClientConfig,
        topics: &[String],
        partition_buffer: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, KafkaError> {
        let routes: Arc<PartitionRoutes> = Arc::new(DashMap::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = RebalanceContext::new(
            routes.clone(),
            events_tx,
            partition_buffer,
            shutdown.clone(),
        );

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: GroupConsumer = client_config.create_with_context(context)?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        info!(topics = ?topics, "subscribed to topics");

        let consumer = Arc::new(consumer);
        let stop = CancellationToken::new();
        let pump = tokio::spawn(Self::pump(consumer.clone(), routes, stop.clone()));

        Ok(Self {
            consumer,
            events: Mutex::new(events_rx),
            pump: std::sync::Mutex::new(Some(pump)),
            stop,
        })
    }

    pub fn consumer(&self) -> &Arc<GroupConsumer> {
        &self.consumer
    }

    /// Waits for the next assignment. Revocations in between are skipped.
    pub async fn next_epoch(&self) -> Result<Epoch, CoordinationError> {
        let mut events = self.events.lock().await;
        loop {
            match events.recv().await {
                Some(EpochEvent::Assigned(epoch)) => return Ok(epoch),
                Some(EpochEvent::Revoked(id)) => debug!(epoch = id, "epoch revoked"),
                Some(EpochEvent::Failed(reason)) => {
                    return Err(CoordinationError::Rebalance(reason))
                }
                None => return Err(CoordinationError::Closed),
            }
        }
    }

    /// Stops the pump. No record is routed and no rebalance callback runs afterwards.
    /// Safe to call more than once.
    pub async fn stop_polling(&self) {
        self.stop.cancel();
        let pump = self.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                error!("consumer pump task failed: {}", e);
            }
        }
    }

    async fn pump(
        consumer: Arc<GroupConsumer>,
        routes: Arc<PartitionRoutes>,
        stop: CancellationToken,
    ) {
        info!("starting consumer pump");

        let mut backlogs = Backlogs::default();
        let mut flush = tokio::time::interval(BACKLOG_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let received = tokio::select! {
                _ = stop.cancelled() => break,
                _ = flush.tick(), if !backlogs.is_empty() => {
                    for partition in backlogs.flush(&routes) {
                        debug!(%partition, "claim caught up, resuming partition");
                        set_fetching(&consumer, &partition, true);
                    }
                    continue;
                }
                received = consumer.recv() => received,
            };

            let message = match received {
                Ok(message) => message.detach(),
                Err(e) => {
                    warn!("kafka recv error: {}", e);
                    metrics::counter!(CONSUMER_RECV_ERRORS).increment(1);
                    continue;
                }
            };

            let partition = Partition::new(message.topic(), message.partition());
            // Clone the sender so no map guard is held while routing
            let route = routes.get(&partition).map(|tx| tx.clone());
            let Some(tx) = route else {
                debug!(
                    %partition,
                    offset = message.offset(),
                    "no claim for partition, dropping record"
                );
                metrics::counter!(UNROUTED_MESSAGES).increment(1);
                continue;
            };

            let offset = message.offset();
            match backlogs.route(&partition, &tx, RawMessage::from(message)) {
                Routed::Sent | Routed::Held => {}
                Routed::Full => {
                    debug!(%partition, offset, "claim is full, pausing partition");
                    metrics::counter!(PARTITIONS_PAUSED).increment(1);
                    set_fetching(&consumer, &partition, false);
                }
                Routed::Closed => {
                    debug!(%partition, offset, "claim closed, dropping record");
                    metrics::counter!(UNROUTED_MESSAGES).increment(1);
                }
            }
        }

        info!("consumer pump stopped");
    }
}

fn set_fetching(consumer: &GroupConsumer, partition: &Partition, fetching: bool) {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(partition.topic(), partition.partition_number());

    let result = if fetching {
        consumer.resume(&tpl)
    } else {
        consumer.pause(&tpl)
    };
    if let Err(e) = result {
        error!(%partition, fetching, "failed to change partition fetch state: {}", e);
    }
}
