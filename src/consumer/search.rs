use std::sync::Arc;

use async_trait::async_trait;

use super::{ConsumeError, EventHandler, ReceiveEndpoint, RedeliveryPolicy};
use crate::db::blocking;
use crate::domain::auction::SearchItem;
use crate::domain::events::{DomainEvent, EventType};
use crate::domain::ports::SearchItemStore;

/// Projects auction events into the search read model.
///
/// Every arm is idempotent and order-tolerant; update and bid events for an
/// item that is not there yet fail with `NotFound` so redelivery can retry.
#[derive(Clone)]
pub struct SearchProjector<S> {
    store: S,
}

impl<S: SearchItemStore + Clone> SearchProjector<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> EventHandler for SearchProjector<S>
where
    S: SearchItemStore + Clone,
{
    async fn handle(&self, event: DomainEvent) -> Result<(), ConsumeError> {
        let store = self.store.clone();
        let id = event.aggregate_id();
        let changed = match event {
            DomainEvent::AuctionCreated(snapshot) => {
                blocking(move || store.insert_if_absent(SearchItem::from(snapshot))).await?
            }
            DomainEvent::AuctionUpdated(update) => {
                blocking(move || store.apply_update(&update)).await?
            }
            DomainEvent::AuctionDeleted(deleted) => {
                blocking(move || store.remove(deleted.id)).await?
            }
            DomainEvent::BidPlaced(bid) => blocking(move || store.apply_bid(&bid)).await?,
        };
        if !changed {
            log::debug!("Search item {} already up to date", id);
        }
        Ok(())
    }
}

pub fn queue_name(event_type: EventType) -> String {
    format!("search-{}", event_type.topic())
}

/// One receive endpoint per event type, all sharing the projector.
pub fn search_endpoints<S>(
    store: S,
    policy: RedeliveryPolicy,
    concurrency: usize,
) -> Vec<ReceiveEndpoint>
where
    S: SearchItemStore + Clone,
{
    let projector = Arc::new(SearchProjector::new(store));
    EventType::ALL
        .into_iter()
        .map(|event_type| ReceiveEndpoint {
            queue: queue_name(event_type),
            event_type,
            policy,
            concurrency,
            handler: projector.clone(),
        })
        .collect()
}
