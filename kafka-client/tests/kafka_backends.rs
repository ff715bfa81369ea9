//! Both rdkafka backends against a mock cluster: reading, rewinding, committing and
//! leaving the group.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::{DefaultProducerContext, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use kafka_client::codec::JsonCodec;
use kafka_client::config::{ConsumerBackend, ConsumerConfig, KafkaConfig, TopicList};
use kafka_client::coordinator::Coordinator;
use kafka_client::dead_letter::failed_message_channel;
use kafka_client::error::ConsumerError;
use kafka_client::generation::GenerationCoordinator;
use kafka_client::kafka::{KafkaConsumerGroup, KafkaGenerationGroup};
use kafka_client::message::Message;
use kafka_client::partition_loop::LoopContext;
use kafka_client::session::SessionCoordinator;
use kafka_client::test_utils::create_mock_kafka;
use kafka_client::topic::{TopicConfig, TopicRegistry};

const TOPIC: &str = "orders";
const RECORDS: i64 = 5;
const WAIT: Duration = Duration::from_secs(30);

/// Records every attempt and fails the configured offsets.
#[derive(Default)]
struct Outcomes {
    fail_once: Mutex<HashSet<i64>>,
    fail_always: HashSet<i64>,
    attempts: Mutex<Vec<i64>>,
}

impl Outcomes {
    fn failing_once(offsets: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            fail_once: Mutex::new(offsets.iter().copied().collect()),
            ..Default::default()
        })
    }

    fn failing(offsets: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            fail_always: offsets.iter().copied().collect(),
            ..Default::default()
        })
    }

    fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().unwrap().clone()
    }
}

async fn process(
    _: CancellationToken,
    outcomes: Arc<Outcomes>,
    message: Message,
) -> anyhow::Result<()> {
    let offset = message.offset();
    outcomes.attempts.lock().unwrap().push(offset);

    let failed_once = outcomes.fail_once.lock().unwrap().remove(&offset);
    anyhow::ensure!(
        !failed_once && !outcomes.fail_always.contains(&offset),
        "failed offset {}",
        offset
    );
    Ok(())
}

/// A single partition topic holding `RECORDS` JSON records at offsets 0 and up.
async fn seeded_cluster() -> MockCluster<'static, DefaultProducerContext> {
    let (cluster, producer) = create_mock_kafka().await;
    cluster
        .create_topic(TOPIC, 1, 1)
        .expect("failed to create topic");

    for n in 0..RECORDS {
        let payload = format!(r#"{{"n": {}}}"#, n);
        let record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(TOPIC).payload(payload.as_bytes());
        producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .expect("failed to seed record");
    }
    cluster
}

fn configs(
    cluster: &MockCluster<'static, DefaultProducerContext>,
    group: &str,
    backend: ConsumerBackend,
) -> (KafkaConfig, ConsumerConfig) {
    let kafka = KafkaConfig {
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_producer_queue_messages: 1000,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
        kafka_hosts: cluster.bootstrap_servers(),
    };
    let consumer = ConsumerConfig {
        kafka_consumer_group: group.to_string(),
        kafka_consumer_topics: TopicList(vec![TOPIC.to_string()]),
        kafka_consumer_backend: backend,
        kafka_consumer_offset_reset: "earliest".to_string(),
        // Room for a single record, so the pump has to hold the rest back
        kafka_consumer_partition_buffer: 1,
        kafka_consumer_failed_message_buffer: 10,
        kafka_consumer_auto_commit_interval_ms: 100,
    };
    (kafka, consumer)
}

fn loop_context(outcomes: Arc<Outcomes>, shutdown: CancellationToken) -> LoopContext<Outcomes> {
    let (router, _failed) = failed_message_channel(10);
    LoopContext {
        topics: Arc::new(
            TopicRegistry::new(vec![TopicConfig::new(TOPIC, Arc::new(JsonCodec), process)])
                .unwrap(),
        ),
        deps: outcomes,
        router,
        cancel: shutdown,
    }
}

fn start<C: Coordinator + 'static>(
    coordinator: &Arc<C>,
) -> JoinHandle<Result<(), ConsumerError>> {
    let coordinator = coordinator.clone();
    tokio::spawn(async move { coordinator.start().await })
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// The offset `group` has committed for partition 0, read by a separate client.
async fn committed_offset(bootstrap_servers: String, group: &str) -> Offset {
    let group = group.to_string();
    tokio::task::spawn_blocking(move || {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .create()
            .expect("failed to create offset reader");

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(TOPIC, 0);
        let committed = consumer
            .committed_offsets(tpl, Duration::from_secs(5))
            .expect("failed to read committed offsets");
        committed
            .find_partition(TOPIC, 0)
            .map(|elem| elem.offset())
            .unwrap_or(Offset::Invalid)
    })
    .await
    .unwrap()
}

async fn wait_for_commit(
    cluster: &MockCluster<'static, DefaultProducerContext>,
    group: &str,
    expected: Offset,
) {
    timeout(WAIT, async {
        while committed_offset(cluster.bootstrap_servers(), group).await != expected {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("offset was not committed in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_backend_rereads_failed_records_and_commits_them() {
    let cluster = seeded_cluster().await;
    let (kafka, config) = configs(&cluster, "generation-tests", ConsumerBackend::Generation);

    let shutdown = CancellationToken::new();
    let group = KafkaGenerationGroup::new(
        config.client_config(&kafka),
        config.topics(),
        config.kafka_consumer_partition_buffer,
        shutdown.clone(),
    )
    .expect("failed to create generation group");

    // Offset 0 exercises the skipped commit of -1, offset 2 a rewind past buffered records
    let outcomes = Outcomes::failing_once(&[0, 2]);
    let coordinator = Arc::new(GenerationCoordinator::new(
        group,
        loop_context(outcomes.clone(), shutdown),
    ));
    let handle = start(&coordinator);

    eventually(|| outcomes.attempts().len() == 7).await;
    assert_eq!(outcomes.attempts(), vec![0, 0, 1, 2, 2, 3, 4]);
    assert!(coordinator.is_ready());

    // Success commits the processed offset itself
    wait_for_commit(&cluster, "generation-tests", Offset::Offset(RECORDS - 1)).await;

    coordinator.stop();
    timeout(WAIT, handle)
        .await
        .expect("coordinator did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(outcomes.attempts().len(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_backend_commits_acknowledged_offsets_on_close() {
    let cluster = seeded_cluster().await;
    let (kafka, config) = configs(&cluster, "session-tests", ConsumerBackend::Session);

    let shutdown = CancellationToken::new();
    let group = KafkaConsumerGroup::new(
        config.client_config(&kafka),
        config.topics(),
        config.kafka_consumer_partition_buffer,
        config.kafka_consumer_auto_commit_interval_ms,
        shutdown.clone(),
    )
    .expect("failed to create consumer group");

    // The last record is never acknowledged
    let outcomes = Outcomes::failing(&[RECORDS - 1]);
    let coordinator = Arc::new(SessionCoordinator::new(
        group,
        config.topics().to_vec(),
        loop_context(outcomes.clone(), shutdown),
    ));
    let handle = start(&coordinator);

    eventually(|| outcomes.attempts().len() == RECORDS as usize).await;
    assert_eq!(outcomes.attempts(), (0..RECORDS).collect::<Vec<_>>());

    coordinator.stop();
    timeout(WAIT, handle)
        .await
        .expect("coordinator did not stop")
        .unwrap()
        .expect("group released cleanly");

    // The committed position is the one after the last acknowledged record
    assert_eq!(
        committed_offset(cluster.bootstrap_servers(), "session-tests").await,
        Offset::Offset(RECORDS - 1)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_backend_closes_cleanly_with_nothing_to_commit() {
    let cluster = seeded_cluster().await;
    let (kafka, config) = configs(&cluster, "session-rejects", ConsumerBackend::Session);

    let shutdown = CancellationToken::new();
    let group = KafkaConsumerGroup::new(
        config.client_config(&kafka),
        config.topics(),
        config.kafka_consumer_partition_buffer,
        config.kafka_consumer_auto_commit_interval_ms,
        shutdown.clone(),
    )
    .expect("failed to create consumer group");

    let outcomes = Outcomes::failing(&(0..RECORDS).collect::<Vec<_>>());
    let coordinator = Arc::new(SessionCoordinator::new(
        group,
        config.topics().to_vec(),
        loop_context(outcomes.clone(), shutdown),
    ));
    let handle = start(&coordinator);

    eventually(|| outcomes.attempts().len() == RECORDS as usize).await;

    coordinator.stop();
    timeout(WAIT, handle)
        .await
        .expect("coordinator did not stop")
        .unwrap()
        .expect("closing without acknowledged offsets is not an error");

    assert_eq!(
        committed_offset(cluster.bootstrap_servers(), "session-rejects").await,
        Offset::Invalid
    );
}
