use std::sync::Arc;

use async_trait::async_trait;

use super::{ConsumeError, EventHandler, ReceiveEndpoint, RedeliveryPolicy};
use crate::db::blocking;
use crate::domain::events::{DomainEvent, EventType};
use crate::domain::ports::AuctionRepository;

pub const BID_QUEUE: &str = "auction-bid-placed";

/// Folds placed bids into the system-of-record's `current_high_bid`.
#[derive(Clone)]
pub struct BidAggregator<R> {
    repo: R,
}

impl<R: AuctionRepository + Clone> BidAggregator<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<R> EventHandler for BidAggregator<R>
where
    R: AuctionRepository + Clone,
{
    async fn handle(&self, event: DomainEvent) -> Result<(), ConsumeError> {
        let bid = match event {
            DomainEvent::BidPlaced(bid) => bid,
            other => return Err(ConsumeError::Unexpected(other.event_type().as_str())),
        };
        let repo = self.repo.clone();
        let auction_id = bid.auction_id;
        if blocking(move || repo.apply_bid(&bid)).await? {
            log::debug!("Raised high bid of auction {}", auction_id);
        }
        Ok(())
    }
}

pub fn bid_endpoint<R>(repo: R, policy: RedeliveryPolicy, concurrency: usize) -> ReceiveEndpoint
where
    R: AuctionRepository + Clone,
{
    ReceiveEndpoint {
        queue: BID_QUEUE.to_string(),
        event_type: EventType::BidPlaced,
        policy,
        concurrency,
        handler: Arc::new(BidAggregator::new(repo)),
    }
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;
    use uuid::Uuid;

    use super::*;
    use crate::domain::auction::fixtures::{new_auction, t};
    use crate::domain::errors::DomainError;
    use crate::domain::events::{AuctionDeleted, BidPlaced, BidStatus};
    use crate::infrastructure::memory::InMemoryAuctionStore;

    fn bid(auction_id: Uuid, amount: i64, status: BidStatus) -> DomainEvent {
        DomainEvent::BidPlaced(BidPlaced {
            id: Uuid::new_v4(),
            auction_id,
            bidder: "alice".to_string(),
            bid_time: t(30),
            amount: BigDecimal::from(amount),
            bid_status: status,
        })
    }

    #[tokio::test]
    async fn keeps_highest_accepted_bid_in_any_order() {
        let repo = InMemoryAuctionStore::new();
        let auction = repo.create(new_auction()).unwrap();
        let aggregator = BidAggregator::new(repo.clone());

        aggregator.handle(bid(auction.id, 120, BidStatus::Accepted)).await.unwrap();
        aggregator.handle(bid(auction.id, 100, BidStatus::Accepted)).await.unwrap();
        aggregator.handle(bid(auction.id, 150, BidStatus::TooLow)).await.unwrap();

        let stored = repo.find_by_id(auction.id).unwrap().unwrap();
        assert_eq!(stored.current_high_bid, Some(BigDecimal::from(120)));
    }

    #[tokio::test]
    async fn unknown_auction_fails_for_redelivery() {
        let aggregator = BidAggregator::new(InMemoryAuctionStore::new());
        let err = aggregator
            .handle(bid(Uuid::new_v4(), 10, BidStatus::Accepted))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Domain(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejects_other_event_types() {
        let aggregator = BidAggregator::new(InMemoryAuctionStore::new());
        let err = aggregator
            .handle(DomainEvent::AuctionDeleted(AuctionDeleted { id: Uuid::new_v4() }))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Unexpected("AuctionDeleted")));
    }
}
