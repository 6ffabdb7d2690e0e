use std::sync::Arc;
use tokio::sync::watch;

use crate::models::{MarketSnapshot, Tick};

/// Create the single-writer / many-reader snapshot cache
pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(MarketSnapshot::default()));
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

/// Write side, owned by the market data connection
///
/// Every update builds a complete new snapshot and swaps it in, so readers
/// only ever hold whole values.
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<MarketSnapshot>>,
}

impl SnapshotPublisher {
    /// Apply a tick and publish the resulting snapshot
    pub fn apply(&self, tick: &Tick) -> u64 {
        let next = {
            let current = self.tx.borrow();
            current.with_tick(tick)
        };
        let sequence = next.sequence;
        self.tx.send_replace(Arc::new(next));

        tracing::trace!(
            pair = %tick.pair,
            price = %tick.price,
            sequence,
            "Published market snapshot"
        );

        sequence
    }

    /// Replace the whole snapshot (restores, tests)
    pub fn publish(&self, snapshot: MarketSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side, cloned into the engine and paper exchange
#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<MarketSnapshot>>,
}

impl SnapshotReader {
    /// Latest complete snapshot
    pub fn latest(&self) -> Arc<MarketSnapshot> {
        self.rx.borrow().clone()
    }

    /// Wait until a newer snapshot is published
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tick(pair: &str, price: f64) -> Tick {
        Tick {
            pair: pair.to_string(),
            price,
            volume: 10.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_reader_sees_published_ticks() {
        let (publisher, reader) = snapshot_channel();
        assert_eq!(reader.latest().sequence, 0);

        publisher.apply(&tick("BTC/USD", 100.0));
        publisher.apply(&tick("BTC/USD", 101.0));

        let snapshot = reader.latest();
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.price("BTC/USD"), Some(101.0));
    }

    #[test]
    fn test_held_snapshot_is_not_mutated() {
        let (publisher, reader) = snapshot_channel();
        publisher.apply(&tick("BTC/USD", 100.0));

        let held = reader.latest();
        publisher.apply(&tick("BTC/USD", 200.0));

        assert_eq!(held.price("BTC/USD"), Some(100.0));
        assert_eq!(reader.latest().price("BTC/USD"), Some(200.0));
    }

    #[tokio::test]
    async fn test_changed_wakes_on_publish() {
        let (publisher, mut reader) = snapshot_channel();

        let waiter = tokio::spawn(async move {
            let woke = reader.changed().await;
            (woke, reader.latest().sequence)
        });

        tokio::task::yield_now().await;
        publisher.apply(&tick("ETH/USD", 10.0));

        let (woke, sequence) = waiter.await.unwrap();
        assert!(woke);
        assert_eq!(sequence, 1);
    }
}
