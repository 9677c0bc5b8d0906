use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{BusError, Envelope, MessageBus};
use crate::db::blocking;
use crate::domain::errors::DomainError;
use crate::domain::outbox::{DispatchReport, OutboxMessage};
use crate::domain::ports::OutboxStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// How long a claimed row stays invisible to other dispatchers.
    pub claim_lease: Duration,
    /// Delivered rows older than this are deleted.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            claim_lease: Duration::from_secs(60),
            retention: Duration::from_secs(30 * 60),
        }
    }
}

/// Moves outbox rows onto the bus.
///
/// Each cycle claims pending rows in commit order, publishes them and marks
/// them delivered once the bus accepts them. A row that fails stays pending
/// and is retried on a later cycle without limit.
pub struct OutboxDispatcher<S> {
    store: S,
    bus: Arc<dyn MessageBus>,
    config: DispatcherConfig,
    wake: Arc<Notify>,
}

impl<S> OutboxDispatcher<S>
where
    S: OutboxStore + Clone,
{
    pub fn new(store: S, bus: Arc<dyn MessageBus>, config: DispatcherConfig) -> Self {
        Self {
            store,
            bus,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle that starts a cycle right away instead of waiting for the next tick.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub async fn dispatch_once(&self) -> Result<DispatchReport, DomainError> {
        let store = self.store.clone();
        let (limit, lease) = (self.config.batch_size, self.config.claim_lease);
        let batch = blocking(move || store.claim_pending(limit, lease)).await?;

        let mut report = DispatchReport {
            claimed: batch.len(),
            ..DispatchReport::default()
        };
        // Aggregates with a failed message in this cycle; their later messages wait.
        let mut blocked: HashSet<String> = HashSet::new();

        for message in batch {
            if blocked.contains(&message.aggregate_id) {
                self.release(message.id).await?;
                report.deferred += 1;
                continue;
            }

            match self.publish(&message).await {
                Ok(()) => {
                    let store = self.store.clone();
                    let id = message.id;
                    blocking(move || store.mark_delivered(id)).await?;
                    report.delivered += 1;
                    log::debug!(
                        "Delivered {} {} (seq {})",
                        message.event_type,
                        message.aggregate_id,
                        message.seq
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Failed to publish {} {} (seq {}), will retry: {}",
                        message.event_type,
                        message.aggregate_id,
                        message.seq,
                        e
                    );
                    self.release(message.id).await?;
                    blocked.insert(message.aggregate_id);
                    report.failed += 1;
                }
            }
        }

        report.purged = self.purge().await?;
        Ok(report)
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), BusError> {
        let envelope = Envelope::from_outbox(message);
        let topic = envelope.topic().ok_or_else(|| {
            BusError::Unsupported(format!("no topic for message type '{}'", message.event_type))
        })?;
        self.bus.publish(topic, &envelope).await
    }

    async fn release(&self, id: Uuid) -> Result<(), DomainError> {
        let store = self.store.clone();
        blocking(move || store.release(id)).await
    }

    async fn purge(&self) -> Result<usize, DomainError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| DomainError::InvalidInput(format!("outbox retention: {e}")))?;
        let cutoff = Utc::now() - retention;
        let store = self.store.clone();
        blocking(move || store.purge_delivered(cutoff)).await
    }

    /// Runs cycles on the poll interval, or sooner when woken, until `shutdown`
    /// fires. A cycle in progress always completes.
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!(
            "Outbox dispatcher started (poll interval {:?}, batch {})",
            self.config.poll_interval,
            self.config.batch_size
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            match self.dispatch_once().await {
                Ok(report) if report.claimed > 0 || report.purged > 0 => {
                    log::debug!("Outbox cycle: {:?}", report)
                }
                Ok(_) => {}
                Err(e) => log::warn!("Outbox cycle failed: {}", e),
            }
        }
        log::info!("Outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::bus::{InMemoryBus, Subscription};
    use crate::domain::auction::fixtures::new_auction;
    use crate::domain::auction::ItemChanges;
    use crate::domain::ports::AuctionRepository;
    use crate::infrastructure::memory::InMemoryAuctionStore;

    /// Rejects the first `failures` publishes, then forwards to the in-memory bus.
    struct FlakyBus {
        inner: InMemoryBus,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(BusError::Unavailable("flaky".to_string()));
            }
            self.inner.publish(topic, envelope).await
        }

        async fn subscribe(&self, queue: &str, topics: &[&str]) -> Result<Subscription, BusError> {
            self.inner.subscribe(queue, topics).await
        }

        async fn declare(&self, queue: &str, topics: &[&str]) -> Result<(), BusError> {
            self.inner.declare(queue, topics).await
        }
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn bus_outage_keeps_rows_pending_until_a_later_cycle() {
        let store = InMemoryAuctionStore::new();
        let bus = InMemoryBus::recording();
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(bus.clone()), quick_config());
        store.create(new_auction()).unwrap();

        bus.set_available(false);
        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(store.pending_count().unwrap(), 1);

        bus.set_available(true);
        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(bus.published_to("auction-created").len(), 1);
    }

    #[tokio::test]
    async fn failed_aggregate_defers_its_later_messages_only() {
        let store = InMemoryAuctionStore::new();
        let bus = InMemoryBus::recording();
        let flaky = FlakyBus {
            inner: bus.clone(),
            failures: AtomicUsize::new(1),
        };
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(flaky), quick_config());

        let a = store.create(new_auction()).unwrap();
        store
            .update(
                a.id,
                ItemChanges {
                    color: Some("Red".to_string()),
                    ..ItemChanges::default()
                },
            )
            .unwrap();
        let b = store.create(new_auction()).unwrap();

        let first = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(first.claimed, 3);
        assert_eq!(first.failed, 1);
        assert_eq!(first.deferred, 1);
        assert_eq!(first.delivered, 1);
        let sent: Vec<_> = bus.published().into_iter().map(|(_, e)| e.aggregate_id).collect();
        assert_eq!(sent, [b.id.to_string()]);

        let second = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(second.delivered, 2);
        let types: Vec<_> = bus
            .published()
            .into_iter()
            .filter(|(_, e)| e.aggregate_id == a.id.to_string())
            .map(|(_, e)| e.message_type)
            .collect();
        assert_eq!(types, ["AuctionCreated", "AuctionUpdated"]);
    }

    #[tokio::test]
    async fn envelope_reuses_outbox_id() {
        let store = InMemoryAuctionStore::new();
        let bus = InMemoryBus::recording();
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(bus.clone()), quick_config());
        store.create(new_auction()).unwrap();
        let row_id = store.outbox().unwrap()[0].id;

        dispatcher.dispatch_once().await.unwrap();

        assert_eq!(bus.published_to("auction-created")[0].message_id, row_id);
    }

    #[tokio::test]
    async fn delivered_rows_are_purged_after_retention() {
        let store = InMemoryAuctionStore::new();
        let bus = InMemoryBus::recording();
        let config = DispatcherConfig {
            retention: Duration::ZERO,
            ..quick_config()
        };
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(bus), config);
        store.create(new_auction()).unwrap();

        let first = dispatcher.dispatch_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = dispatcher.dispatch_once().await.unwrap();

        assert_eq!(first.purged + second.purged, 1);
        assert!(store.outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_wakes_on_notify_and_stops_on_cancel() {
        let store = InMemoryAuctionStore::new();
        let bus = InMemoryBus::recording();
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(bus.clone()), quick_config());
        let wake = dispatcher.waker();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        store.create(new_auction()).unwrap();
        wake.notify_one();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.pending_count().unwrap() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "wake-up did not dispatch");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
        assert_eq!(bus.published_to("auction-created").len(), 1);
    }
}
