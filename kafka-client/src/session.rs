//! Session-based consumption.
//!
//! The group drives membership through handler callbacks: `setup` when a session starts,
//! `consume_claim` once per claimed partition (concurrently), `cleanup` when the session
//! ends. Progress is acknowledged by marking messages on the session, which commits
//! marked offsets on its own schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, RETRY_BACKOFF};
use crate::error::{ConsumerError, CoordinationError, ReadError};
use crate::gate::ReadinessGate;
use crate::message::{Message, RawMessage};
use crate::metrics_consts::{COORDINATION_ERRORS, SESSIONS_STARTED};
use crate::partition_loop::{run_partition_loop, LoopContext, LoopExit, MessageSource};

pub trait GroupSession: Send + Sync + 'static {
    fn id(&self) -> u64;

    /// Cancelled when the session ends, on rebalance or shutdown.
    fn context(&self) -> &CancellationToken;

    /// Acknowledges the message at `offset`; the session commits it later.
    fn mark_message(&self, topic: &str, partition: i32, offset: i64);
}

/// A partition claimed for the duration of one session, with its message stream.
#[derive(Debug)]
pub struct Claim {
    topic: String,
    partition: i32,
    initial_offset: Option<i64>,
    messages: mpsc::Receiver<RawMessage>,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: Option<i64>,
        messages: mpsc::Receiver<RawMessage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn initial_offset(&self) -> Option<i64> {
        self.initial_offset
    }

    /// Next message, `None` once the claim's stream is closed.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        self.messages.recv().await
    }
}

#[async_trait]
pub trait GroupHandler<S: GroupSession>: Send + Sync {
    async fn setup(&self, session: &Arc<S>) -> Result<(), CoordinationError>;

    async fn consume_claim(&self, session: Arc<S>, claim: Claim) -> Result<(), CoordinationError>;

    async fn cleanup(&self, session: &Arc<S>) -> Result<(), CoordinationError>;
}

#[async_trait]
pub trait ConsumerGroup: Send + Sync + 'static {
    type Session: GroupSession;

    /// Joins the group and runs one session to completion. Returns `Ok` when the session
    /// ends on rebalance or because `cancel` fired.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler<Self::Session>>,
    ) -> Result<(), CoordinationError>;

    /// Releases the group. Commits whatever was acknowledged but not yet committed.
    async fn close(&self) -> Result<(), KafkaError>;
}

/// Runs the handler lifecycle for one session: setup, every claim concurrently, cleanup.
/// Cleanup runs even when a claim fails; the first error is returned.
pub async fn run_session<S: GroupSession>(
    session: Arc<S>,
    claims: Vec<Claim>,
    handler: Arc<dyn GroupHandler<S>>,
) -> Result<(), CoordinationError> {
    handler.setup(&session).await?;

    let mut tasks = JoinSet::new();
    for claim in claims {
        let handler = handler.clone();
        let session = session.clone();
        tasks.spawn(async move { handler.consume_claim(session, claim).await });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(CoordinationError::Handler(anyhow::anyhow!(
                "claim task failed: {}",
                e
            ))),
        };
        if let Err(e) = outcome {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    // The session is over once every claim returned
    session.context().cancel();

    if let Err(e) = handler.cleanup(&session).await {
        warn!(session = session.id(), "session cleanup failed: {}", e);
    }

    result
}

/// Reads a claim's stream and acknowledges by marking the session.
pub struct ClaimSource<S: GroupSession> {
    session: Arc<S>,
    claim: Claim,
}

impl<S: GroupSession> ClaimSource<S> {
    pub fn new(session: Arc<S>, claim: Claim) -> Self {
        Self { session, claim }
    }
}

#[async_trait]
impl<S: GroupSession> MessageSource for ClaimSource<S> {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, ReadError> {
        tokio::select! {
            biased;
            _ = self.session.context().cancelled() => Ok(None),
            message = self.claim.recv() => Ok(message),
        }
    }

    async fn acknowledge(&mut self, message: &Message) {
        self.session
            .mark_message(message.topic(), message.partition(), message.offset());
    }

    async fn reject(&mut self, message: &Message) {
        // Left unmarked, the record is redelivered once the session restarts
        debug!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "message not acknowledged"
        );
    }
}

/// Handler running the shared partition loop over every claim.
pub struct SessionHandler<D> {
    ctx: LoopContext<D>,
    gate: ReadinessGate,
}

impl<D> SessionHandler<D> {
    pub fn new(ctx: LoopContext<D>, gate: ReadinessGate) -> Self {
        Self { ctx, gate }
    }
}

#[async_trait]
impl<S, D> GroupHandler<S> for SessionHandler<D>
where
    S: GroupSession,
    D: Send + Sync + 'static,
{
    async fn setup(&self, session: &Arc<S>) -> Result<(), CoordinationError> {
        self.gate.open();
        metrics::counter!(SESSIONS_STARTED).increment(1);
        info!(session = session.id(), "session started");
        Ok(())
    }

    async fn consume_claim(&self, session: Arc<S>, claim: Claim) -> Result<(), CoordinationError> {
        let (topic, partition) = (claim.topic().to_string(), claim.partition());
        debug!(
            topic = %topic,
            partition,
            initial_offset = claim.initial_offset(),
            "consuming claim"
        );

        let ctx = self.ctx.with_cancel(session.context().clone());
        let mut source = ClaimSource::new(session, claim);

        if let LoopExit::ReadFailed(e) = run_partition_loop(&mut source, &ctx).await {
            warn!(topic = %topic, partition, "claim stopped after read error: {}", e);
        }
        Ok(())
    }

    async fn cleanup(&self, session: &Arc<S>) -> Result<(), CoordinationError> {
        info!(session = session.id(), "session ended");
        Ok(())
    }
}

pub struct SessionCoordinator<G, D> {
    group: Arc<G>,
    handler: Arc<SessionHandler<D>>,
    topics: Vec<String>,
    gate: ReadinessGate,
    shutdown: CancellationToken,
    started: AtomicBool,
    retry_backoff: Duration,
}

impl<G, D> SessionCoordinator<G, D>
where
    G: ConsumerGroup,
    D: Send + Sync + 'static,
{
    pub fn new(group: G, topics: Vec<String>, ctx: LoopContext<D>) -> Self {
        let gate = ReadinessGate::new();
        Self {
            group: Arc::new(group),
            shutdown: ctx.cancel.clone(),
            handler: Arc::new(SessionHandler::new(ctx, gate.clone())),
            topics,
            gate,
            started: AtomicBool::new(false),
            retry_backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn readiness(&self) -> ReadinessGate {
        self.gate.clone()
    }

    pub fn group(&self) -> &Arc<G> {
        &self.group
    }

    async fn drive(
        group: Arc<G>,
        topics: Vec<String>,
        handler: Arc<dyn GroupHandler<G::Session>>,
        shutdown: CancellationToken,
        retry_backoff: Duration,
    ) {
        while !shutdown.is_cancelled() {
            match group.consume(&shutdown, &topics, handler.clone()).await {
                Ok(()) => debug!("session finished, rejoining group"),
                Err(e) => {
                    error!(
                        "failed to consume session, retrying in {:?}: {}",
                        retry_backoff, e
                    );
                    metrics::counter!(COORDINATION_ERRORS, "backend" => "session").increment(1);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry_backoff) => {}
                    }
                }
            }
        }
        info!("session driver stopped");
    }
}

#[async_trait]
impl<G, D> Coordinator for SessionCoordinator<G, D>
where
    G: ConsumerGroup,
    D: Send + Sync + 'static,
{
    async fn start(&self) -> Result<(), ConsumerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }

        let driver = tokio::spawn(Self::drive(
            self.group.clone(),
            self.topics.clone(),
            self.handler.clone(),
            self.shutdown.clone(),
            self.retry_backoff,
        ));

        tokio::select! {
            _ = self.gate.wait() => info!(topics = ?self.topics, "consumer up and running"),
            _ = self.shutdown.cancelled() => {}
        }

        self.shutdown.cancelled().await;
        info!("session coordinator stopping");

        if let Err(e) = driver.await {
            error!("session driver task failed: {}", e);
        }

        self.group.close().await.map_err(ConsumerError::Release)
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn is_ready(&self) -> bool {
        self.gate.is_open()
    }
}
