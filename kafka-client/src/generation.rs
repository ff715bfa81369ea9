//! Generation-based consumption.
//!
//! The coordinator alternates between waiting for the group to hand out a generation and
//! consuming it: one partition loop per assigned partition, all of which must exit before
//! the next generation is requested. Offsets are committed explicitly through the
//! generation, which only accepts commits while it is still current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, RETRY_BACKOFF};
use crate::error::{ConsumerError, CoordinationError, ReadError};
use crate::gate::ReadinessGate;
use crate::message::{Assignment, Message, RawMessage};
use crate::metrics_consts::{ASSIGNED_PARTITIONS, COORDINATION_ERRORS, GENERATIONS_STARTED};
use crate::offsets::{commit_with_retry, OffsetCommitter};
use crate::partition_loop::{run_partition_loop, LoopContext, LoopExit, MessageSource};

/// Sequential reader over one partition of a generation.
#[async_trait]
pub trait PartitionReader: Send {
    /// Next record. Fails with [`ReadError::GenerationEnded`] once the generation is over.
    async fn read_message(&mut self) -> Result<RawMessage, ReadError>;

    /// Moves the read position so the next record returned is the one at `offset`.
    async fn set_offset(&mut self, offset: i64) -> Result<(), ReadError>;
}

/// One membership epoch of the generation backend.
pub trait Generation: OffsetCommitter + 'static {
    type Reader: PartitionReader + 'static;

    fn id(&self) -> u64;

    /// Cancelled once the generation is revoked or the group shuts down.
    fn context(&self) -> &CancellationToken;

    fn assignments(&self) -> Vec<Assignment>;

    /// Reader positioned at the assignment's starting offset.
    fn reader(&self, assignment: &Assignment) -> Result<Self::Reader, ReadError>;
}

#[async_trait]
pub trait GenerationGroup: Send + Sync + 'static {
    type Generation: Generation;

    /// Waits for the group to hand this member its next generation.
    async fn next_generation(&self) -> Result<Arc<Self::Generation>, CoordinationError>;

    /// Leaves the group and releases its resources.
    async fn close(&self) -> Result<(), KafkaError>;
}

/// Reads through a [`PartitionReader`] and commits through the owning generation.
pub struct GenerationSource<G: Generation> {
    generation: Arc<G>,
    reader: G::Reader,
    cancel: CancellationToken,
}

impl<G: Generation> GenerationSource<G> {
    pub fn new(generation: Arc<G>, reader: G::Reader, cancel: CancellationToken) -> Self {
        Self {
            generation,
            reader,
            cancel,
        }
    }
}

#[async_trait]
impl<G: Generation> MessageSource for GenerationSource<G> {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, ReadError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            read = self.reader.read_message() => read.map(Some),
        }
    }

    async fn acknowledge(&mut self, message: &Message) {
        // Failures are logged and counted by the committer, the loop moves on regardless
        if commit_with_retry(
            self.generation.as_ref(),
            message.topic(),
            message.partition(),
            message.offset(),
        )
        .await
        .is_err()
        {
            debug!(offset = message.offset(), "moving on without a commit");
        }
    }

    async fn reject(&mut self, message: &Message) {
        if let Err(e) = self.reader.set_offset(message.offset()).await {
            error!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "failed to rewind partition reader: {}",
                e
            );
        }

        if commit_with_retry(
            self.generation.as_ref(),
            message.topic(),
            message.partition(),
            message.offset() - 1,
        )
        .await
        .is_err()
        {
            debug!(offset = message.offset(), "moving on without a commit");
        }
    }
}

pub struct GenerationCoordinator<G, D> {
    group: Arc<G>,
    ctx: LoopContext<D>,
    gate: ReadinessGate,
    shutdown: CancellationToken,
    started: AtomicBool,
    retry_backoff: Duration,
}

impl<G, D> GenerationCoordinator<G, D>
where
    G: GenerationGroup,
    D: Send + Sync + 'static,
{
    pub fn new(group: G, ctx: LoopContext<D>) -> Self {
        Self {
            group: Arc::new(group),
            shutdown: ctx.cancel.clone(),
            ctx,
            gate: ReadinessGate::new(),
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

    async fn run(&self) -> Result<(), ConsumerError> {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.group.next_generation() => next,
            };

            match next {
                Ok(generation) => {
                    self.gate.open();
                    self.consume_generation(generation).await;
                }
                Err(e) => {
                    error!(
                        "failed to get next generation, retrying in {:?}: {}",
                        self.retry_backoff, e
                    );
                    metrics::counter!(COORDINATION_ERRORS, "backend" => "generation")
                        .increment(1);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        info!("generation coordinator stopping, leaving group");
        self.group.close().await.map_err(ConsumerError::Release)
    }

    async fn consume_generation(&self, generation: Arc<G::Generation>) {
        let assignments = generation.assignments();
        info!(
            generation = generation.id(),
            partitions = assignments.len(),
            "generation started"
        );
        metrics::counter!(GENERATIONS_STARTED).increment(1);
        metrics::gauge!(ASSIGNED_PARTITIONS).set(assignments.len() as f64);

        // Processors observe the generation ending as well as the coordinator stopping
        let epoch = self.shutdown.child_token();
        {
            let revoked = generation.context().clone();
            let epoch = epoch.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = revoked.cancelled() => epoch.cancel(),
                    _ = epoch.cancelled() => {}
                }
            });
        }

        let mut loops = JoinSet::new();
        for assignment in assignments {
            let reader = match generation.reader(&assignment) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(
                        topic = assignment.topic(),
                        partition = assignment.partition_number(),
                        "failed to open partition reader: {}",
                        e
                    );
                    continue;
                }
            };

            let ctx = self.ctx.with_cancel(epoch.clone());
            let mut source = GenerationSource::new(generation.clone(), reader, epoch.clone());
            loops.spawn(async move {
                let exit = run_partition_loop(&mut source, &ctx).await;
                (assignment, exit)
            });
        }

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok((assignment, LoopExit::Stopped)) => {
                    debug!(partition = %assignment.partition(), "partition loop stopped");
                }
                Ok((assignment, LoopExit::ReadFailed(e))) => {
                    debug!(partition = %assignment.partition(), "partition loop exited: {}", e);
                }
                Err(e) => error!("partition loop task failed: {}", e),
            }
        }
        epoch.cancel();

        info!(generation = generation.id(), "generation ended");
    }
}

#[async_trait]
impl<G, D> Coordinator for GenerationCoordinator<G, D>
where
    G: GenerationGroup,
    D: Send + Sync + 'static,
{
    async fn start(&self) -> Result<(), ConsumerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }
        self.run().await
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn is_ready(&self) -> bool {
        self.gate.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::error::CommitError;
    use crate::offsets::OffsetMap;
    use crate::test_utils::{json_message, RecordingCommitter, ScriptedReader};

    struct SingleGeneration {
        committer: RecordingCommitter,
        context: CancellationToken,
    }

    #[async_trait]
    impl OffsetCommitter for SingleGeneration {
        async fn commit_offsets(&self, offsets: &OffsetMap) -> Result<(), CommitError> {
            self.committer.commit_offsets(offsets).await
        }
    }

    impl Generation for SingleGeneration {
        type Reader = ScriptedReader;

        fn id(&self) -> u64 {
            1
        }

        fn context(&self) -> &CancellationToken {
            &self.context
        }

        fn assignments(&self) -> Vec<Assignment> {
            Vec::new()
        }

        fn reader(&self, _assignment: &Assignment) -> Result<ScriptedReader, ReadError> {
            Ok(ScriptedReader::new(1, Vec::new()))
        }
    }

    #[tokio::test]
    async fn rejected_message_rewinds_reader_and_commits_previous_offset() {
        let generation = Arc::new(SingleGeneration {
            committer: RecordingCommitter::default(),
            context: CancellationToken::new(),
        });
        let reader = ScriptedReader::new(
            1,
            vec![json_message("orders", 0, 42), json_message("orders", 0, 43)],
        );
        let mut source =
            GenerationSource::new(generation.clone(), reader, CancellationToken::new());

        let first = source.next_message().await.unwrap().unwrap();
        let message = Message::new(first, Arc::new(JsonCodec));
        source.reject(&message).await;

        assert_eq!(generation.committer.committed("orders", 0), vec![41]);
        let again = source.next_message().await.unwrap().unwrap();
        assert_eq!(again.offset, 42);

        source
            .acknowledge(&Message::new(again, Arc::new(JsonCodec)))
            .await;
        assert_eq!(generation.committer.committed("orders", 0), vec![41, 42]);
    }

    #[tokio::test]
    async fn cancelled_source_stops_cleanly() {
        let generation = Arc::new(SingleGeneration {
            committer: RecordingCommitter::default(),
            context: CancellationToken::new(),
        });
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(1, vec![json_message("orders", 0, 1)]);
        let mut source = GenerationSource::new(generation, reader, cancel.clone());

        cancel.cancel();

        assert!(source.next_message().await.unwrap().is_none());
    }
}
