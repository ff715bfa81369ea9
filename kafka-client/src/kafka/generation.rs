use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CommitError, CoordinationError, ReadError};
use crate::generation::{Generation, GenerationGroup, PartitionReader};
use crate::kafka::group_client::{GroupClient, GroupConsumer};
use crate::message::{Assignment, Partition, RawMessage};
use crate::offsets::{OffsetCommitter, OffsetMap};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Generation backend over an rdkafka consumer group. Offsets are only ever committed by
/// the partition loops, so auto-commit is disabled.
pub struct KafkaGenerationGroup {
    client: GroupClient,
}

impl KafkaGenerationGroup {
    pub fn new(
        mut client_config: ClientConfig,
        topics: &[String],
        partition_buffer: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, KafkaError> {
        client_config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        let client = GroupClient::new(&client_config, topics, partition_buffer, shutdown)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GenerationGroup for KafkaGenerationGroup {
    type Generation = KafkaGeneration;

    async fn next_generation(&self) -> Result<Arc<KafkaGeneration>, CoordinationError> {
        let epoch = self.client.next_epoch().await?;

        let mut assignments = Vec::with_capacity(epoch.claims.len());
        let mut streams = HashMap::with_capacity(epoch.claims.len());
        for (assignment, rx) in epoch.claims {
            streams.insert(assignment.partition().clone(), rx);
            assignments.push(assignment);
        }

        Ok(Arc::new(KafkaGeneration {
            id: epoch.id,
            consumer: self.client.consumer().clone(),
            token: epoch.token,
            assignments,
            streams: Mutex::new(streams),
        }))
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.client.stop_polling().await;
        self.client.consumer().unsubscribe();
        info!("left consumer group");
        Ok(())
    }
}

pub struct KafkaGeneration {
    id: u64,
    consumer: Arc<GroupConsumer>,
    token: CancellationToken,
    assignments: Vec<Assignment>,
    streams: Mutex<HashMap<Partition, mpsc::Receiver<RawMessage>>>,
}

#[async_trait]
impl OffsetCommitter for KafkaGeneration {
    async fn commit_offsets(&self, offsets: &OffsetMap) -> Result<(), CommitError> {
        if self.token.is_cancelled() {
            return Err(CommitError::GenerationEnded(self.id));
        }

        let mut tpl = TopicPartitionList::new();
        for (topic, partitions) in offsets {
            for (partition, offset) in partitions {
                // Nothing precedes the first record of a partition
                if *offset < 0 {
                    continue;
                }
                tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
            }
        }
        if tpl.count() == 0 {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| CommitError::Join(e.to_string()))??;
        Ok(())
    }
}

impl Generation for KafkaGeneration {
    type Reader = KafkaPartitionReader;

    fn id(&self) -> u64 {
        self.id
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn assignments(&self) -> Vec<Assignment> {
        self.assignments.clone()
    }

    fn reader(&self, assignment: &Assignment) -> Result<KafkaPartitionReader, ReadError> {
        let stream = self
            .streams
            .lock()
            .ok()
            .and_then(|mut streams| streams.remove(assignment.partition()));

        let Some(stream) = stream else {
            return Err(ReadError::StreamClosed {
                topic: assignment.topic().to_string(),
                partition: assignment.partition_number(),
            });
        };

        Ok(KafkaPartitionReader {
            generation: self.id,
            token: self.token.clone(),
            consumer: self.consumer.clone(),
            partition: assignment.partition().clone(),
            stream,
            rewound_to: None,
        })
    }
}

pub struct KafkaPartitionReader {
    generation: u64,
    token: CancellationToken,
    consumer: Arc<GroupConsumer>,
    partition: Partition,
    stream: mpsc::Receiver<RawMessage>,
    rewound_to: Option<i64>,
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    async fn read_message(&mut self) -> Result<RawMessage, ReadError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                next = self.stream.recv() => next,
            };
            let Some(message) = next else {
                return Err(ReadError::GenerationEnded(self.generation));
            };

            // Records fetched before the seek are still buffered, skip them until the
            // rewound record comes around again
            if let Some(target) = self.rewound_to {
                if message.offset > target {
                    debug!(
                        partition = %self.partition,
                        offset = message.offset,
                        target,
                        "skipping record buffered before rewind"
                    );
                    continue;
                }
                self.rewound_to = None;
            }

            return Ok(message);
        }
    }

    async fn set_offset(&mut self, offset: i64) -> Result<(), ReadError> {
        let consumer = self.consumer.clone();
        let (topic, partition) = (
            self.partition.topic().to_string(),
            self.partition.partition_number(),
        );

        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
        })
        .await
        .map_err(|_| ReadError::GenerationEnded(self.generation))??;

        self.rewound_to = Some(offset);
        Ok(())
    }
}
