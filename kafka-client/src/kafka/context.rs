use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::{Assignment, Partition, RawMessage};
use crate::metrics_consts::ASSIGNED_PARTITIONS;

pub type PartitionRoutes = DashMap<Partition, mpsc::Sender<RawMessage>>;

/// The partitions handed to this member by one assignment, each with its record stream.
#[derive(Debug)]
pub struct Epoch {
    pub id: u64,
    pub claims: Vec<(Assignment, mpsc::Receiver<RawMessage>)>,
    /// Cancelled when the assignment is revoked or the client shuts down.
    pub token: CancellationToken,
}

#[derive(Debug)]
pub enum EpochEvent {
    Assigned(Epoch),
    Revoked(u64),
    Failed(String),
}

/// Turns librdkafka's assign/revoke callbacks into epochs.
///
/// Both callbacks run synchronously on the polling thread, before records of the new
/// assignment can arrive and after records of the revoked one stop, so the routing table
/// is always in step with the assignment.
pub struct RebalanceContext {
    routes: Arc<PartitionRoutes>,
    events: mpsc::UnboundedSender<EpochEvent>,
    current: Mutex<Option<(u64, CancellationToken)>>,
    epochs: AtomicU64,
    partition_buffer: usize,
    shutdown: CancellationToken,
}

impl RebalanceContext {
    pub fn new(
        routes: Arc<PartitionRoutes>,
        events: mpsc::UnboundedSender<EpochEvent>,
        partition_buffer: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            routes,
            events,
            current: Mutex::new(None),
            epochs: AtomicU64::new(0),
            partition_buffer: partition_buffer.max(1),
            shutdown,
        }
    }

    fn assign(&self, partitions: &TopicPartitionList) {
        let id = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();

        let mut claims = Vec::with_capacity(partitions.count());
        for elem in partitions.elements() {
            let assignment = Assignment::from(elem);
            let (tx, rx) = mpsc::channel(self.partition_buffer);
            self.routes.insert(assignment.partition().clone(), tx);
            claims.push((assignment, rx));
        }

        if let Ok(mut current) = self.current.lock() {
            if let Some((_, previous)) = current.replace((id, token.clone())) {
                previous.cancel();
            }
        }

        metrics::gauge!(ASSIGNED_PARTITIONS).set(claims.len() as f64);
        info!(epoch = id, partitions = claims.len(), "partitions assigned");

        if self
            .events
            .send(EpochEvent::Assigned(Epoch { id, claims, token }))
            .is_err()
        {
            warn!(epoch = id, "no one is waiting for assignments, dropping epoch");
        }
    }

    fn revoke(&self, partitions: &TopicPartitionList) {
        for elem in partitions.elements() {
            self.routes.remove(&Partition::from(elem));
        }

        let revoked = self.current.lock().ok().and_then(|mut c| c.take());
        let Some((id, token)) = revoked else {
            debug!("revoke without an active epoch");
            return;
        };

        token.cancel();
        metrics::gauge!(ASSIGNED_PARTITIONS).set(0.0);
        info!(
            epoch = id,
            partitions = partitions.count(),
            "partitions revoked"
        );
        if self.events.send(EpochEvent::Revoked(id)).is_err() {
            debug!(epoch = id, "no listener for revoked epoch");
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("skipping empty revoke");
                    return;
                }
                self.revoke(partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!("pre-rebalance assign of {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
                if self.events.send(EpochEvent::Failed(e.to_string())).is_err() {
                    debug!("no listener for rebalance error");
                }
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() == 0 {
                debug!("skipping empty assign");
                return;
            }
            // A partition paused under an earlier claim starts the new one fetching
            if let Err(e) = base_consumer.resume(partitions) {
                error!(
                    "failed to resume {} assigned partitions: {}",
                    partitions.count(),
                    e
                );
            }
            self.assign(partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("failed to commit offsets: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    fn context() -> (
        RebalanceContext,
        Arc<PartitionRoutes>,
        mpsc::UnboundedReceiver<EpochEvent>,
    ) {
        let routes = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let context = RebalanceContext::new(routes.clone(), tx, 4, CancellationToken::new());
        (context, routes, rx)
    }

    fn partitions(numbers: &[i32]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for n in numbers {
            tpl.add_partition_offset("orders", *n, Offset::Invalid)
                .unwrap();
        }
        tpl
    }

    #[test]
    fn assign_opens_a_route_per_partition() {
        let (context, routes, mut events) = context();

        context.assign(&partitions(&[0, 1]));

        assert_eq!(routes.len(), 2);
        assert!(routes.contains_key(&Partition::new("orders", 1)));
        let Ok(EpochEvent::Assigned(epoch)) = events.try_recv() else {
            panic!("expected an assignment");
        };
        assert_eq!(epoch.id, 1);
        assert_eq!(epoch.claims.len(), 2);
        assert!(!epoch.token.is_cancelled());
    }

    #[test]
    fn revoke_ends_the_epoch_and_closes_routes() {
        let (context, routes, mut events) = context();
        context.assign(&partitions(&[0]));
        let Ok(EpochEvent::Assigned(mut epoch)) = events.try_recv() else {
            panic!("expected an assignment");
        };

        context.revoke(&partitions(&[0]));

        assert!(routes.is_empty());
        assert!(epoch.token.is_cancelled());
        assert!(matches!(events.try_recv(), Ok(EpochEvent::Revoked(1))));
        // Route senders are gone, so the claim's stream is closed
        let (_, rx) = &mut epoch.claims[0];
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn reassignment_replaces_the_previous_epoch() {
        let (context, _routes, mut events) = context();
        context.assign(&partitions(&[0]));
        context.assign(&partitions(&[0, 1]));

        let Ok(EpochEvent::Assigned(first)) = events.try_recv() else {
            panic!("expected an assignment");
        };
        let Ok(EpochEvent::Assigned(second)) = events.try_recv() else {
            panic!("expected a second assignment");
        };
        assert!(first.token.is_cancelled());
        assert_eq!(second.id, 2);
        assert!(!second.token.is_cancelled());
    }
}
