//! Outgoing messages.
//!
//! The caller resolves what it sends into a [`Payload`] variant; the producer turns it into
//! bytes with the destination topic's codec and hands it to Kafka either synchronously
//! (waiting for the broker acknowledgment) or asynchronously (delivery reports are consumed
//! by a background task for as long as the producer lives).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::future_producer::DeliveryFuture;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::codec::{CodecError, MessageCodec};
use crate::config::{KafkaConfig, ProducerConfig, ProducerMode};
use crate::dead_letter::DeadLetterSink;
use crate::error::ProduceError;
use crate::message::FailedMessage;
use crate::metrics_consts::{
    PRODUCER_ENCODE_ERRORS, PRODUCER_SEND_DURATION_MS, PRODUCER_SEND_ERRORS,
    PRODUCER_SEND_SUCCESS,
};

pub const SOURCE_TOPIC_HEADER: &str = "source_topic";
pub const SOURCE_PARTITION_HEADER: &str = "source_partition";
pub const SOURCE_OFFSET_HEADER: &str = "source_offset";
pub const ERROR_HEADER: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::I32(n) => write!(f, "{}", n),
            Numeric::I64(n) => write!(f, "{}", n),
            Numeric::F32(n) => write!(f, "{}", n),
            Numeric::F64(n) => write!(f, "{}", n),
        }
    }
}

/// What a caller can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as its UTF-8 bytes.
    Text(String),
    /// Already serialized; validated and re-encoded by the topic's codec.
    Bytes(Bytes),
    /// Sent as its decimal representation, without going through the codec.
    Numeric(Numeric),
    /// Encoded by the topic's codec. Only objects and arrays are accepted.
    Struct(Value),
}

impl Payload {
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, ProduceError> {
        let value =
            serde_json::to_value(value).map_err(|_| ProduceError::UnsupportedMessageType)?;
        Payload::try_from(value)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b.into())
    }
}

impl From<i32> for Payload {
    fn from(n: i32) -> Self {
        Payload::Numeric(Numeric::I32(n))
    }
}

impl From<i64> for Payload {
    fn from(n: i64) -> Self {
        Payload::Numeric(Numeric::I64(n))
    }
}

impl From<f32> for Payload {
    fn from(n: f32) -> Self {
        Payload::Numeric(Numeric::F32(n))
    }
}

impl From<f64> for Payload {
    fn from(n: f64) -> Self {
        Payload::Numeric(Numeric::F64(n))
    }
}

impl TryFrom<Value> for Payload {
    type Error = ProduceError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(Payload::Text(s)),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Ok(Payload::Numeric(Numeric::I64(i))),
                (None, Some(f)) => Ok(Payload::Numeric(Numeric::F64(f))),
                (None, None) => Err(ProduceError::UnsupportedMessageType),
            },
            Value::Object(_) | Value::Array(_) => Ok(Payload::Struct(value)),
            Value::Null | Value::Bool(_) => Err(ProduceError::UnsupportedMessageType),
        }
    }
}

/// Turns `payload` into the bytes sent to `topic`. Fails before encoding anything when
/// `topic` has no codec.
pub fn encode_payload(
    topic: &str,
    codecs: &HashMap<String, Arc<dyn MessageCodec>>,
    payload: &Payload,
) -> Result<Vec<u8>, ProduceError> {
    let codec = codecs
        .get(topic)
        .ok_or_else(|| ProduceError::MissingCodec(topic.to_string()))?;

    let tag = |error: CodecError| ProduceError::Encode {
        topic: topic.to_string(),
        error,
    };

    match payload {
        Payload::Text(s) => Ok(s.as_bytes().to_vec()),
        Payload::Bytes(b) => codec.wrap(b).map_err(tag),
        Payload::Numeric(n) => Ok(n.to_string().into_bytes()),
        Payload::Struct(v) if v.is_object() || v.is_array() => codec.encode(v).map_err(tag),
        Payload::Struct(_) => Err(ProduceError::UnsupportedMessageType),
    }
}

pub async fn create_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let client_config = config.producer_client_config();
    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer = client_config.create()?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

type PendingDelivery = (String, DeliveryFuture);

pub struct Producer {
    inner: FutureProducer,
    codecs: HashMap<String, Arc<dyn MessageCodec>>,
    mode: ProducerMode,
    enqueue_timeout: Duration,
    pending: Mutex<Option<mpsc::UnboundedSender<PendingDelivery>>>,
    responses: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Connects to the brokers. `codecs` maps every topic this producer may write to onto
    /// the codec used to encode its payloads.
    pub async fn new(
        kafka: &KafkaConfig,
        config: &ProducerConfig,
        codecs: HashMap<String, Arc<dyn MessageCodec>>,
    ) -> Result<Self, KafkaError> {
        let inner = create_kafka_producer(kafka).await?;
        Ok(Self::from_producer(
            inner,
            config.kafka_producer_mode,
            config.enqueue_timeout(),
            codecs,
        ))
    }

    /// Wraps an existing rdkafka producer. In async mode this spawns the delivery report
    /// task, so it must be called from within a tokio runtime.
    pub fn from_producer(
        inner: FutureProducer,
        mode: ProducerMode,
        enqueue_timeout: Duration,
        codecs: HashMap<String, Arc<dyn MessageCodec>>,
    ) -> Self {
        let (pending, responses) = match mode {
            ProducerMode::Sync => (None, None),
            ProducerMode::Async => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(tokio::spawn(handle_async_responses(rx))))
            }
        };

        Self {
            inner,
            codecs,
            mode,
            enqueue_timeout,
            pending: Mutex::new(pending),
            responses: Mutex::new(responses),
        }
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    pub async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Payload,
    ) -> Result<(), ProduceError> {
        let encoded = encode_payload(topic, &self.codecs, &payload).inspect_err(|e| {
            metrics::counter!(PRODUCER_ENCODE_ERRORS, "topic" => topic.to_string()).increment(1);
            error!(topic, "failed to encode message: {}", e);
        })?;

        self.produce_raw(topic, key.map(str::as_bytes), &encoded, None)
            .await
    }

    /// Sends already encoded bytes, bypassing every codec.
    pub(crate) async fn produce_raw(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: Option<OwnedHeaders>,
    ) -> Result<(), ProduceError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(headers) = headers {
            record = record.headers(headers);
        }

        match self.mode {
            ProducerMode::Sync => self.send_sync(topic, record).await,
            ProducerMode::Async => {
                self.send_async(topic, record);
                Ok(())
            }
        }
    }

    async fn send_sync(
        &self,
        topic: &str,
        record: FutureRecord<'_, [u8], [u8]>,
    ) -> Result<(), ProduceError> {
        let started = Instant::now();
        let result = self
            .inner
            .send(record, Timeout::After(self.enqueue_timeout))
            .await;
        metrics::histogram!(PRODUCER_SEND_DURATION_MS, "topic" => topic.to_string())
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(_) => {
                metrics::counter!(PRODUCER_SEND_SUCCESS, "topic" => topic.to_string())
                    .increment(1);
                debug!(topic, "message produced");
                Ok(())
            }
            Err((error, _)) => {
                metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => topic.to_string())
                    .increment(1);
                error!(topic, "failed to produce message: {}", error);
                Err(ProduceError::Kafka { error })
            }
        }
    }

    fn send_async(&self, topic: &str, record: FutureRecord<'_, [u8], [u8]>) {
        let delivery = match self.inner.send_result(record) {
            Ok(delivery) => delivery,
            Err((error, _)) => {
                metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => topic.to_string())
                    .increment(1);
                error!(topic, "failed to enqueue message: {}", error);
                return;
            }
        };

        let pending = self.pending.lock().ok().and_then(|p| p.clone());
        match pending {
            Some(tx) if tx.send((topic.to_string(), delivery)).is_ok() => {}
            _ => debug!(topic, "producer closing, delivery report not tracked"),
        }
    }

    /// Flushes queued messages and waits for the delivery report task to drain.
    pub async fn close(&self, timeout: Duration) {
        let inner = self.inner.clone();
        let flushed =
            tokio::task::spawn_blocking(move || inner.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => info!("producer flushed"),
            Ok(Err(e)) => error!("failed to flush producer: {}", e),
            Err(e) => error!("producer flush task failed: {}", e),
        }

        // Dropping the sender ends the delivery report task once it drained
        if let Ok(mut pending) = self.pending.lock() {
            drop(pending.take());
        }
        let responses = self.responses.lock().ok().and_then(|mut r| r.take());
        if let Some(responses) = responses {
            if let Err(e) = responses.await {
                error!("delivery report task failed: {}", e);
            }
        }
    }
}

/// Consumes delivery reports of asynchronously produced messages for the lifetime of the
/// producer. This is the only place async delivery failures surface.
async fn handle_async_responses(mut pending: mpsc::UnboundedReceiver<PendingDelivery>) {
    while let Some((topic, delivery)) = pending.recv().await {
        match delivery.await {
            Ok(Ok(_)) => {
                metrics::counter!(PRODUCER_SEND_SUCCESS, "topic" => topic.clone()).increment(1);
                debug!(topic = %topic, "message delivered");
            }
            Ok(Err((error, _))) => {
                metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => topic.clone()).increment(1);
                error!(topic = %topic, "failed to deliver message: {}", error);
            }
            Err(_) => {
                metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => topic.clone()).increment(1);
                error!(topic = %topic, "{}", ProduceError::Canceled);
            }
        }
    }
    debug!("delivery report task stopped");
}

fn failure_headers(failed: &FailedMessage) -> OwnedHeaders {
    let message = failed.message();
    let partition = message.partition().to_string();
    let offset = message.offset().to_string();
    let error = format!("{:#}", failed.error());

    OwnedHeaders::new()
        .insert(Header {
            key: SOURCE_TOPIC_HEADER,
            value: Some(message.topic()),
        })
        .insert(Header {
            key: SOURCE_PARTITION_HEADER,
            value: Some(partition.as_str()),
        })
        .insert(Header {
            key: SOURCE_OFFSET_HEADER,
            value: Some(offset.as_str()),
        })
        .insert(Header {
            key: ERROR_HEADER,
            value: Some(error.as_str()),
        })
}

#[async_trait]
impl DeadLetterSink for Producer {
    /// Republishes the original key and bytes untouched, the failure travels in headers.
    async fn publish_failed(&self, failed: &FailedMessage) -> Result<(), ProduceError> {
        let message = failed.message();
        self.produce_raw(
            failed.topic(),
            message.key(),
            &message.raw()[..],
            Some(failure_headers(failed)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::message::{Message, RawMessage};
    use rdkafka::message::Headers;
    use serde_json::json;

    fn codecs(topics: &[&str]) -> HashMap<String, Arc<dyn MessageCodec>> {
        topics
            .iter()
            .map(|t| (t.to_string(), Arc::new(JsonCodec) as Arc<dyn MessageCodec>))
            .collect()
    }

    #[test]
    fn text_is_sent_verbatim() {
        let encoded =
            encode_payload("orders", &codecs(&["orders"]), &Payload::from("not json")).unwrap();
        assert_eq!(encoded, b"not json");
    }

    #[test]
    fn numbers_bypass_the_codec() {
        let codecs = codecs(&["orders"]);
        assert_eq!(
            encode_payload("orders", &codecs, &Payload::from(7i64)).unwrap(),
            b"7"
        );
        assert_eq!(
            encode_payload("orders", &codecs, &Payload::from(-3i32)).unwrap(),
            b"-3"
        );
        assert_eq!(
            encode_payload("orders", &codecs, &Payload::from(1.5f64)).unwrap(),
            b"1.5"
        );
    }

    #[test]
    fn structs_go_through_the_codec() {
        let codecs = codecs(&["orders"]);
        let value = json!({"sku": "abc", "qty": 2});

        let encoded = encode_payload("orders", &codecs, &Payload::Struct(value.clone())).unwrap();

        assert_eq!(JsonCodec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn serializable_types_become_payloads() {
        #[derive(Serialize)]
        struct Order<'a> {
            sku: &'a str,
            qty: u32,
        }

        let payload = Payload::structured(&Order { sku: "abc", qty: 2 }).unwrap();
        assert_eq!(payload, Payload::Struct(json!({"sku": "abc", "qty": 2})));

        assert_eq!(
            Payload::structured(&"hello").unwrap(),
            Payload::Text("hello".to_string())
        );
        assert!(matches!(
            Payload::structured(&()),
            Err(ProduceError::UnsupportedMessageType)
        ));
    }

    #[test]
    fn bytes_are_wrapped_and_errors_name_the_topic() {
        let codecs = codecs(&["orders"]);

        let encoded =
            encode_payload("orders", &codecs, &Payload::from(br#"{"a":1}"#.to_vec())).unwrap();
        assert_eq!(JsonCodec.decode(&encoded).unwrap(), json!({"a": 1}));

        let err = encode_payload("orders", &codecs, &Payload::from(b"{oops".to_vec()))
            .unwrap_err();
        assert!(matches!(err, ProduceError::Encode { ref topic, .. } if topic == "orders"));
    }

    #[test]
    fn missing_codec_fails_before_encoding() {
        let err = encode_payload("refunds", &codecs(&["orders"]), &Payload::from("hi"))
            .unwrap_err();
        assert!(matches!(err, ProduceError::MissingCodec(topic) if topic == "refunds"));
    }

    #[test]
    fn scalar_structs_are_unsupported() {
        let codecs = codecs(&["orders"]);

        let err = encode_payload("orders", &codecs, &Payload::Struct(json!(true))).unwrap_err();
        assert_eq!(err.to_string(), "unsupported message type");

        assert!(matches!(
            Payload::try_from(Value::Null),
            Err(ProduceError::UnsupportedMessageType)
        ));
        assert_eq!(
            Payload::try_from(json!(7)).unwrap(),
            Payload::Numeric(Numeric::I64(7))
        );
    }

    #[test]
    fn failure_headers_describe_the_source_record() {
        let message = Message::new(
            RawMessage::new("orders", 3, 42, &b"{}"[..]),
            Arc::new(JsonCodec),
        );
        let failed = FailedMessage::new(message, "orders-failed", anyhow::anyhow!("boom"));

        let headers = failure_headers(&failed);

        let values: HashMap<&str, &[u8]> = headers
            .iter()
            .filter_map(|h| h.value.map(|v| (h.key, v)))
            .collect();
        assert_eq!(values[SOURCE_TOPIC_HEADER], b"orders");
        assert_eq!(values[SOURCE_PARTITION_HEADER], b"3");
        assert_eq!(values[SOURCE_OFFSET_HEADER], b"42");
        assert_eq!(values[ERROR_HEADER], b"boom");
    }
}
