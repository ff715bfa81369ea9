//! In-memory stand-ins for broker-backed components, shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::{DefaultProducerContext, FutureProducer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::KafkaConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{CommitError, CoordinationError, ProduceError, ReadError};
use crate::generation::{Generation, GenerationGroup, PartitionReader};
use crate::message::{Assignment, FailedMessage, Partition, RawMessage};
use crate::offsets::{OffsetCommitter, OffsetMap};
use crate::producer::create_kafka_producer;
use crate::session::{run_session, Claim, ConsumerGroup, GroupHandler, GroupSession};

pub fn json_message(topic: &str, partition: i32, offset: i64) -> RawMessage {
    RawMessage::new(
        topic,
        partition,
        offset,
        format!(r#"{{"offset": {}}}"#, offset).into_bytes(),
    )
}

/// In-process broker plus a producer connected to it.
pub async fn create_mock_kafka() -> (MockCluster<'static, DefaultProducerContext>, FutureProducer) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");

    let config = KafkaConfig {
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_producer_queue_messages: 1000,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
        kafka_hosts: cluster.bootstrap_servers(),
    };

    (
        cluster,
        create_kafka_producer(&config)
            .await
            .expect("failed to create mocked kafka producer"),
    )
}

fn kafka_error() -> KafkaError {
    KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut)
}

/// Committer recording every successful commit, optionally failing the first attempts.
#[derive(Default)]
pub struct RecordingCommitter {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    commits: Mutex<Vec<(String, i32, i64)>>,
}

impl RecordingCommitter {
    pub fn failing(attempts: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(attempts),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Offsets committed for one partition, in commit order
    pub fn committed(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .map(|(_, _, o)| *o)
            .collect()
    }
}

#[async_trait]
impl OffsetCommitter for RecordingCommitter {
    async fn commit_offsets(&self, offsets: &OffsetMap) -> Result<(), CommitError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CommitError::Kafka(kafka_error()));
        }

        let mut commits = self.commits.lock().unwrap();
        for (topic, partitions) in offsets {
            for (partition, offset) in partitions {
                commits.push((topic.clone(), *partition, *offset));
            }
        }
        Ok(())
    }
}

/// Reader over a fixed set of records. Once they are exhausted the generation is over.
pub struct ScriptedReader {
    generation: u64,
    records: Vec<RawMessage>,
    next_offset: i64,
    reads: Arc<Mutex<Vec<i64>>>,
}

impl ScriptedReader {
    pub fn new(generation: u64, mut records: Vec<RawMessage>) -> Self {
        records.sort_by_key(|r| r.offset);
        Self {
            generation,
            records,
            next_offset: 0,
            reads: Arc::default(),
        }
    }

    pub fn starting_at(mut self, offset: i64) -> Self {
        self.next_offset = offset;
        self
    }

    pub fn with_read_log(mut self, reads: Arc<Mutex<Vec<i64>>>) -> Self {
        self.reads = reads;
        self
    }
}

#[async_trait]
impl PartitionReader for ScriptedReader {
    async fn read_message(&mut self) -> Result<RawMessage, ReadError> {
        let next = self
            .records
            .iter()
            .find(|r| r.offset >= self.next_offset)
            .cloned()
            .ok_or(ReadError::GenerationEnded(self.generation))?;

        self.next_offset = next.offset + 1;
        self.reads.lock().unwrap().push(next.offset);
        Ok(next)
    }

    async fn set_offset(&mut self, offset: i64) -> Result<(), ReadError> {
        self.next_offset = offset;
        Ok(())
    }
}

/// A generation assigning a fixed set of partitions, each with scripted records.
pub struct FakeGeneration {
    id: u64,
    context: CancellationToken,
    partitions: HashMap<Partition, Vec<RawMessage>>,
    committer: Arc<RecordingCommitter>,
    reads: Arc<Mutex<HashMap<Partition, Arc<Mutex<Vec<i64>>>>>>,
}

impl FakeGeneration {
    pub fn new(id: u64, records: Vec<RawMessage>) -> Self {
        let mut partitions: HashMap<Partition, Vec<RawMessage>> = HashMap::new();
        for record in records {
            partitions
                .entry(Partition::new(record.topic.clone(), record.partition))
                .or_default()
                .push(record);
        }
        Self {
            id,
            context: CancellationToken::new(),
            partitions,
            committer: Arc::default(),
            reads: Arc::default(),
        }
    }
}

#[async_trait]
impl OffsetCommitter for FakeGeneration {
    async fn commit_offsets(&self, offsets: &OffsetMap) -> Result<(), CommitError> {
        self.committer.commit_offsets(offsets).await
    }
}

impl Generation for FakeGeneration {
    type Reader = ScriptedReader;

    fn id(&self) -> u64 {
        self.id
    }

    /// Cancel it to revoke the generation.
    fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Partitions start from their last committed offset, like they would on a broker.
    fn assignments(&self) -> Vec<Assignment> {
        let mut assignments: Vec<Assignment> = self
            .partitions
            .keys()
            .map(|p| {
                let committed = self
                    .committer
                    .committed(p.topic(), p.partition_number())
                    .last()
                    .copied();
                Assignment::new(p.clone(), committed)
            })
            .collect();
        assignments.sort_by_key(|a| (a.topic().to_string(), a.partition_number()));
        assignments
    }

    fn reader(&self, assignment: &Assignment) -> Result<ScriptedReader, ReadError> {
        let records = self
            .partitions
            .get(assignment.partition())
            .cloned()
            .unwrap_or_default();
        let reads = self
            .reads
            .lock()
            .unwrap()
            .entry(assignment.partition().clone())
            .or_default()
            .clone();
        Ok(ScriptedReader::new(self.id, records)
            .starting_at(assignment.offset().unwrap_or(0))
            .with_read_log(reads))
    }
}

/// Group handing out scripted generations, then waiting forever.
pub struct FakeGenerationGroup {
    script: Mutex<VecDeque<Result<FakeGeneration, CoordinationError>>>,
    committer: Arc<RecordingCommitter>,
    reads: Arc<Mutex<HashMap<Partition, Arc<Mutex<Vec<i64>>>>>>,
    requests: AtomicUsize,
    fail_close: bool,
    closed: AtomicBool,
}

impl FakeGenerationGroup {
    pub fn new(script: Vec<Result<FakeGeneration, CoordinationError>>) -> Self {
        Self::with_committer(script, RecordingCommitter::default())
    }

    pub fn waiting() -> Self {
        Self::new(Vec::new())
    }

    /// Every generation commits through `committer`.
    pub fn with_committer(
        script: Vec<Result<FakeGeneration, CoordinationError>>,
        committer: RecordingCommitter,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            committer: Arc::new(committer),
            reads: Arc::default(),
            requests: AtomicUsize::new(0),
            fail_close: false,
            closed: AtomicBool::new(false),
        }
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn committer(&self) -> &RecordingCommitter {
        &self.committer
    }

    /// Offsets read from one partition across every generation, in read order
    pub fn reads(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.reads
            .lock()
            .unwrap()
            .get(&Partition::new(topic, partition))
            .map(|reads| reads.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationGroup for FakeGenerationGroup {
    type Generation = FakeGeneration;

    async fn next_generation(&self) -> Result<Arc<FakeGeneration>, CoordinationError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(mut generation)) => {
                generation.committer = self.committer.clone();
                generation.reads = self.reads.clone();
                Ok(Arc::new(generation))
            }
            Some(Err(e)) => Err(e),
            None => future::pending().await,
        }
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::BrokerTransportFailure));
        }
        Ok(())
    }
}

/// Session recording every marked offset.
pub struct FakeSession {
    id: u64,
    context: CancellationToken,
    marked: Arc<Mutex<Vec<(String, i32, i64)>>>,
}

impl FakeSession {
    pub fn new(id: u64, context: CancellationToken) -> Self {
        Self {
            id,
            context,
            marked: Arc::default(),
        }
    }

    pub fn marked(&self) -> Vec<(String, i32, i64)> {
        self.marked.lock().unwrap().clone()
    }
}

impl GroupSession for FakeSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn context(&self) -> &CancellationToken {
        &self.context
    }

    fn mark_message(&self, topic: &str, partition: i32, offset: i64) {
        self.marked
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, offset));
    }
}

/// Group running scripted sessions. Each session claims the partitions of its records,
/// which are delivered and then the claims close. Once the script is exhausted, `consume`
/// blocks until cancelled.
pub struct FakeConsumerGroup {
    script: Mutex<VecDeque<Result<Vec<RawMessage>, CoordinationError>>>,
    marked: Arc<Mutex<Vec<(String, i32, i64)>>>,
    sessions: AtomicUsize,
    fail_close: bool,
    closed: AtomicBool,
}

impl FakeConsumerGroup {
    pub fn new(script: Vec<Result<Vec<RawMessage>, CoordinationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            marked: Arc::default(),
            sessions: AtomicUsize::new(0),
            fail_close: false,
            closed: AtomicBool::new(false),
        }
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn marked(&self) -> Vec<(String, i32, i64)> {
        self.marked.lock().unwrap().clone()
    }

    /// Number of `consume` calls made so far
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerGroup for FakeConsumerGroup {
    type Session = FakeSession;

    async fn consume(
        &self,
        cancel: &CancellationToken,
        _topics: &[String],
        handler: Arc<dyn GroupHandler<FakeSession>>,
    ) -> Result<(), CoordinationError> {
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) as u64;

        let next = self.script.lock().unwrap().pop_front();
        let records = match next {
            Some(Ok(records)) => records,
            Some(Err(e)) => return Err(e),
            None => Vec::new(),
        };
        let exhausted = records.is_empty();

        let mut claimed: HashMap<Partition, Vec<RawMessage>> = HashMap::new();
        for record in records {
            claimed
                .entry(Partition::new(record.topic.clone(), record.partition))
                .or_default()
                .push(record);
        }

        let mut claims = Vec::new();
        for (partition, records) in claimed {
            let (tx, rx) = mpsc::channel(records.len().max(1));
            for record in records {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            claims.push(Claim::new(
                partition.topic(),
                partition.partition_number(),
                None,
                rx,
            ));
        }

        let session = Arc::new(FakeSession {
            id,
            context: cancel.child_token(),
            marked: self.marked.clone(),
        });

        if exhausted {
            let context = session.context().clone();
            handler.setup(&session).await?;
            context.cancelled().await;
            handler.cleanup(&session).await?;
            return Ok(());
        }

        run_session(session, claims, handler).await
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::BrokerTransportFailure));
        }
        Ok(())
    }
}

/// Dead-letter sink recording (destination topic, source topic, offset) per message.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, String, i64)>>,
}

impl RecordingSink {
    pub fn published(&self) -> Vec<(String, String, i64)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    async fn publish_failed(&self, failed: &FailedMessage) -> Result<(), ProduceError> {
        self.published.lock().unwrap().push((
            failed.topic().to_string(),
            failed.message().topic().to_string(),
            failed.offset(),
        ));
        Ok(())
    }
}
