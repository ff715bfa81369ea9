use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::codec::MessageCodec;
use crate::error::ConfigError;
use crate::message::Message;

/// Application logic invoked for every consumed message of a topic.
///
/// Implementations receive the cancellation context of the owning partition loop and must
/// not block past its cancellation. Any async closure with the matching signature is a
/// processor:
///
/// ```ignore
/// let processor = |_ctx: CancellationToken, deps: Arc<Deps>, message: Message| async move {
///     deps.store(message.value()?).await
/// };
/// ```
#[async_trait]
pub trait MessageProcessor<D>: Send + Sync {
    async fn process(
        &self,
        ctx: CancellationToken,
        deps: Arc<D>,
        message: Message,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<D, F, Fut> MessageProcessor<D> for F
where
    D: Send + Sync + 'static,
    F: Fn(CancellationToken, Arc<D>, Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(
        &self,
        ctx: CancellationToken,
        deps: Arc<D>,
        message: Message,
    ) -> anyhow::Result<()> {
        (self)(ctx, deps, message).await
    }
}

pub struct TopicConfig<D> {
    name: String,
    codec: Arc<dyn MessageCodec>,
    processor: Arc<dyn MessageProcessor<D>>,
    failed_topic: Option<String>,
}

impl<D> TopicConfig<D> {
    pub fn new(
        name: impl Into<String>,
        codec: Arc<dyn MessageCodec>,
        processor: impl MessageProcessor<D> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            codec,
            processor: Arc::new(processor),
            failed_topic: None,
        }
    }

    /// Messages failing processing are forwarded to `topic`.
    pub fn with_failed_topic(mut self, topic: impl Into<String>) -> Self {
        self.failed_topic = Some(topic.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.codec
    }

    pub fn processor(&self) -> &Arc<dyn MessageProcessor<D>> {
        &self.processor
    }

    pub fn failed_topic(&self) -> Option<&str> {
        self.failed_topic.as_deref()
    }
}

/// Topic configurations keyed by topic name. Built once before consumption starts and
/// shared read-only by every partition loop afterwards.
pub struct TopicRegistry<D> {
    topics: HashMap<String, TopicConfig<D>>,
}

impl<D> TopicRegistry<D> {
    pub fn new(configs: impl IntoIterator<Item = TopicConfig<D>>) -> Result<Self, ConfigError> {
        let mut topics = HashMap::new();
        for config in configs {
            if topics.contains_key(config.name()) {
                return Err(ConfigError::DuplicateTopic(config.name().to_string()));
            }
            topics.insert(config.name().to_string(), config);
        }
        Ok(Self { topics })
    }

    pub fn get(&self, topic: &str) -> Option<&TopicConfig<D>> {
        self.topics.get(topic)
    }

    /// Checks every topic we are about to subscribe to has a configuration.
    pub fn validate(&self, topics: &[String]) -> Result<(), ConfigError> {
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        match topics.iter().find(|t| !self.topics.contains_key(t.as_str())) {
            Some(missing) => Err(ConfigError::MissingTopic(missing.clone())),
            None => Ok(()),
        }
    }

    /// Producer codecs for every registered topic and its failed-message topic. A failed
    /// message is republished in its source topic's encoding.
    pub fn codecs(&self) -> HashMap<String, Arc<dyn MessageCodec>> {
        let mut codecs = HashMap::with_capacity(self.topics.len() * 2);
        for (name, config) in &self.topics {
            codecs.insert(name.clone(), config.codec.clone());
            if let Some(failed_topic) = config.failed_topic() {
                codecs.insert(failed_topic.to_string(), config.codec.clone());
            }
        }
        codecs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::message::RawMessage;

    async fn noop(_: CancellationToken, _: Arc<()>, _: Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn config(name: &str) -> TopicConfig<()> {
        TopicConfig::new(name, Arc::new(JsonCodec), noop)
    }

    #[test]
    fn registry_rejects_duplicates() {
        let result = TopicRegistry::new(vec![config("orders"), config("orders")]);

        assert!(matches!(result, Err(ConfigError::DuplicateTopic(t)) if t == "orders"));
    }

    #[test]
    fn validate_reports_first_unconfigured_topic() {
        let registry = TopicRegistry::new(vec![config("orders")]).unwrap();

        assert!(registry.validate(&["orders".to_string()]).is_ok());
        assert!(matches!(
            registry.validate(&["orders".to_string(), "refunds".to_string()]),
            Err(ConfigError::MissingTopic(t)) if t == "refunds"
        ));
        assert!(matches!(registry.validate(&[]), Err(ConfigError::NoTopics)));
    }

    #[test]
    fn codecs_cover_failed_message_topics() {
        let registry = TopicRegistry::new(vec![
            config("orders").with_failed_topic("orders-failed"),
            config("refunds"),
        ])
        .unwrap();

        let codecs = registry.codecs();

        let mut topics: Vec<&str> = codecs.keys().map(String::as_str).collect();
        topics.sort();
        assert_eq!(topics, vec!["orders", "orders-failed", "refunds"]);
    }

    #[tokio::test]
    async fn closures_are_processors() {
        let registry = TopicRegistry::new(vec![TopicConfig::new(
            "orders",
            Arc::new(JsonCodec),
            |_ctx: CancellationToken, deps: Arc<u64>, message: Message| async move {
                anyhow::ensure!(message.offset() < *deps, "offset past limit");
                Ok(())
            },
        )
        .with_failed_topic("orders-failed")])
        .unwrap();

        let topic = registry.get("orders").unwrap();
        assert_eq!(topic.failed_topic(), Some("orders-failed"));

        let message = |offset| {
            Message::new(
                RawMessage::new("orders", 0, offset, &b"{}"[..]),
                Arc::new(JsonCodec),
            )
        };
        let deps = Arc::new(10u64);
        let ctx = CancellationToken::new();

        assert!(topic
            .processor()
            .process(ctx.clone(), deps.clone(), message(3))
            .await
            .is_ok());
        assert!(topic
            .processor()
            .process(ctx, deps, message(12))
            .await
            .is_err());
    }
}
