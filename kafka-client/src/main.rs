use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_client::codec::{JsonCodec, MessageCodec};
use kafka_client::config::{ConsumerConfig, KafkaConfig, ProducerConfig};
use kafka_client::coordinator::{build_coordinator, Coordinator};
use kafka_client::dead_letter::{failed_message_channel, DeadLetterForwarder};
use kafka_client::message::Message;
use kafka_client::producer::{Payload, Producer};
use kafka_client::topic::{TopicConfig, TopicRegistry};

#[derive(Envconfig)]
struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "relay_output")]
    pub kafka_output_topic: String,

    // How long queued messages get to reach the brokers on shutdown
    #[envconfig(default = "10000")]
    pub kafka_producer_flush_timeout_ms: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub producer: ProducerConfig,
}

impl Config {
    fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Relay {
    producer: Arc<Producer>,
    output_topic: String,
}

async fn republish(_ctx: CancellationToken, relay: Arc<Relay>, message: Message) -> Result<()> {
    let value = message.value().context("payload is not valid JSON")?;
    anyhow::ensure!(value.is_object(), "payload is not a JSON object");

    relay
        .producer
        .produce(
            &relay.output_topic,
            message.key_str(),
            Payload::Struct(value.clone()),
        )
        .await?;
    Ok(())
}

fn start_server(config: &Config, coordinator: Arc<dyn Coordinator>) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(|| async { "kafka relay" }))
        .route(
            "/_readiness",
            get(move || {
                let ready = coordinator.is_ready();
                async move {
                    if ready {
                        (StatusCode::OK, "ok")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "waiting for partitions")
                    }
                }
            }),
        )
        .route("/_liveness", get(|| async { "ok" }));

    let router = if config.export_prometheus {
        let recorder_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install metrics recorder")?;
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    };

    let bind = config.bind();
    Ok(tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind {}: {}", bind, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!("http server failed: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting kafka relay");

    let topics = config.consumer.topics().to_vec();
    let json: Arc<dyn MessageCodec> = Arc::new(JsonCodec);

    let registry = TopicRegistry::new(topics.iter().map(|topic| {
        TopicConfig::new(topic.as_str(), json.clone(), republish)
            .with_failed_topic(format!("{}-failed", topic))
    }))?;

    let mut codecs = registry.codecs();
    codecs.insert(config.kafka_output_topic.clone(), json);

    let producer = Arc::new(
        Producer::new(&config.kafka, &config.producer, codecs)
            .await
            .context("Failed to create Kafka producer")?,
    );

    let shutdown = CancellationToken::new();
    let (router, failed_messages) =
        failed_message_channel(config.consumer.kafka_consumer_failed_message_buffer);

    let relay = Arc::new(Relay {
        producer: producer.clone(),
        output_topic: config.kafka_output_topic.clone(),
    });
    let coordinator: Arc<dyn Coordinator> = build_coordinator(
        &config.kafka,
        &config.consumer,
        registry,
        relay,
        router,
        shutdown.clone(),
    )
    .context("Failed to create Kafka consumer")?
    .into();

    let forwarder_shutdown = CancellationToken::new();
    let forwarder = tokio::spawn(
        DeadLetterForwarder::new(failed_messages, producer.clone()).run(forwarder_shutdown.clone()),
    );

    let server = start_server(&config, coordinator.clone())?;
    info!("Started http server on {}", config.bind());

    let mut term = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => {},
                _ = interrupt.recv() => {},
            };
            info!("Shutting down gracefully...");
            coordinator.stop();
        })
    };

    let consumed = coordinator.start().await;
    signals.abort();

    // Partition loops are done, forward what they left behind and flush
    forwarder_shutdown.cancel();
    if let Err(e) = forwarder.await {
        error!("dead-letter forwarder failed: {}", e);
    }
    producer
        .close(Duration::from_millis(config.kafka_producer_flush_timeout_ms))
        .await;
    server.abort();

    consumed.context("Failed to release consumer group")?;
    info!("Kafka relay stopped");
    Ok(())
}
