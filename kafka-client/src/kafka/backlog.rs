//! Records the pump could not hand over because a claim's buffer was full.
//!
//! The pump never waits on a claim. A full claim gets its partition paused and the records
//! already fetched for it are held here, in order, until the claim catches up. Every other
//! partition keeps flowing and the consumer keeps being polled, which is what runs the
//! rebalance callbacks.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::kafka::context::PartitionRoutes;
use crate::message::{Partition, RawMessage};
use crate::metrics_consts::UNROUTED_MESSAGES;

#[derive(Debug, PartialEq, Eq)]
pub enum Routed {
    /// Handed to the claim.
    Sent,
    /// The claim is full. The partition should stop fetching until its backlog drains.
    Full,
    /// Queued behind records already held for the partition.
    Held,
    /// The claim is gone and the record was dropped.
    Closed,
}

struct Held {
    tx: mpsc::Sender<RawMessage>,
    records: VecDeque<RawMessage>,
}

#[derive(Default)]
pub struct Backlogs {
    held: HashMap<Partition, Held>,
}

impl Backlogs {
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Hands `record` to the claim behind `tx`, unless earlier records of the partition are
    /// still waiting.
    pub fn route(
        &mut self,
        partition: &Partition,
        tx: &mpsc::Sender<RawMessage>,
        record: RawMessage,
    ) -> Routed {
        if let Some(held) = self.held.get_mut(partition) {
            if held.tx.same_channel(tx) {
                held.records.push_back(record);
                return Routed::Held;
            }
            // Left over from an earlier claim on the same partition
            discard(partition, held);
            self.held.remove(partition);
        }

        match tx.try_send(record) {
            Ok(()) => Routed::Sent,
            Err(TrySendError::Full(record)) => {
                self.held.insert(
                    partition.clone(),
                    Held {
                        tx: tx.clone(),
                        records: VecDeque::from([record]),
                    },
                );
                Routed::Full
            }
            Err(TrySendError::Closed(_)) => Routed::Closed,
        }
    }

    /// Moves held records into their claims. Returns the partitions whose backlog drained
    /// and can fetch again. Backlogs whose claim was revoked are discarded, their records
    /// are read again from the committed offset by the next owner.
    pub fn flush(&mut self, routes: &PartitionRoutes) -> Vec<Partition> {
        let mut drained = Vec::new();
        self.held.retain(|partition, held| {
            let claimed = routes
                .get(partition)
                .is_some_and(|tx| tx.same_channel(&held.tx));
            if !claimed {
                discard(partition, held);
                return false;
            }

            while let Some(record) = held.records.pop_front() {
                match held.tx.try_send(record) {
                    Ok(()) => {}
                    Err(TrySendError::Full(record)) => {
                        held.records.push_front(record);
                        return true;
                    }
                    Err(TrySendError::Closed(record)) => {
                        held.records.push_front(record);
                        discard(partition, held);
                        break;
                    }
                }
            }
            drained.push(partition.clone());
            false
        });
        drained
    }
}

fn discard(partition: &Partition, held: &mut Held) {
    let dropped = held.records.len();
    debug!(%partition, dropped, "claim closed, dropping held records");
    metrics::counter!(UNROUTED_MESSAGES).increment(dropped as u64);
    held.records.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    fn record(offset: i64) -> RawMessage {
        RawMessage::new("orders", 0, offset, &b"{}"[..])
    }

    fn orders() -> Partition {
        Partition::new("orders", 0)
    }

    fn held(backlogs: &Backlogs, partition: &Partition) -> usize {
        backlogs
            .held
            .get(partition)
            .map_or(0, |held| held.records.len())
    }

    #[test]
    fn full_claim_holds_records_in_order_until_it_drains() {
        let routes = DashMap::new();
        let (tx, mut rx) = mpsc::channel(1);
        routes.insert(orders(), tx.clone());
        let mut backlogs = Backlogs::default();

        assert_eq!(backlogs.route(&orders(), &tx, record(0)), Routed::Sent);
        assert_eq!(backlogs.route(&orders(), &tx, record(1)), Routed::Full);
        assert_eq!(backlogs.route(&orders(), &tx, record(2)), Routed::Held);
        assert_eq!(held(&backlogs, &orders()), 2);

        // Still full, nothing moves
        assert!(backlogs.flush(&routes).is_empty());
        assert_eq!(held(&backlogs, &orders()), 2);

        assert_eq!(rx.try_recv().unwrap().offset, 0);
        assert!(backlogs.flush(&routes).is_empty());
        assert_eq!(rx.try_recv().unwrap().offset, 1);
        assert_eq!(backlogs.flush(&routes), vec![orders()]);
        assert_eq!(rx.try_recv().unwrap().offset, 2);
        assert!(backlogs.is_empty());
    }

    #[test]
    fn other_partitions_flow_while_one_is_held() {
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let fast = Partition::new("orders", 1);
        let mut backlogs = Backlogs::default();

        assert_eq!(backlogs.route(&orders(), &slow_tx, record(0)), Routed::Sent);
        assert_eq!(backlogs.route(&orders(), &slow_tx, record(1)), Routed::Full);

        for offset in 0..4 {
            let sent = backlogs.route(
                &fast,
                &fast_tx,
                RawMessage::new("orders", 1, offset, &b"{}"[..]),
            );
            assert_eq!(sent, Routed::Sent);
        }
        for offset in 0..4 {
            assert_eq!(fast_rx.try_recv().unwrap().offset, offset);
        }
        assert_eq!(held(&backlogs, &fast), 0);
    }

    #[test]
    fn revoked_claims_lose_their_backlog() {
        let routes = DashMap::new();
        let (tx, _rx) = mpsc::channel(1);
        routes.insert(orders(), tx.clone());
        let mut backlogs = Backlogs::default();
        backlogs.route(&orders(), &tx, record(0));
        backlogs.route(&orders(), &tx, record(1));

        routes.remove(&orders());

        assert!(backlogs.flush(&routes).is_empty());
        assert!(backlogs.is_empty());
    }

    #[test]
    fn new_claim_on_the_same_partition_starts_fresh() {
        let (old_tx, _old_rx) = mpsc::channel(1);
        let mut backlogs = Backlogs::default();
        backlogs.route(&orders(), &old_tx, record(0));
        backlogs.route(&orders(), &old_tx, record(1));

        let (new_tx, mut new_rx) = mpsc::channel(4);
        assert_eq!(backlogs.route(&orders(), &new_tx, record(0)), Routed::Sent);

        assert!(backlogs.is_empty());
        assert_eq!(new_rx.try_recv().unwrap().offset, 0);
    }

    #[test]
    fn closed_claims_drop_records() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut backlogs = Backlogs::default();

        assert_eq!(backlogs.route(&orders(), &tx, record(0)), Routed::Closed);
        assert!(backlogs.is_empty());
    }
}
