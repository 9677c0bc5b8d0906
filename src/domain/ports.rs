use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::auction::{Auction, ItemChanges, NewAuction, SearchItem};
use super::errors::DomainError;
use super::events::{AuctionUpdated, BidPlaced};
use super::outbox::OutboxMessage;

/// System-of-record storage. Every write that changes what other services
/// see appends its event to the outbox inside the same transaction.
pub trait AuctionRepository: Send + Sync + 'static {
    fn create(&self, input: NewAuction) -> Result<Auction, DomainError>;
    fn update(&self, id: Uuid, changes: ItemChanges) -> Result<Auction, DomainError>;
    fn delete(&self, id: Uuid) -> Result<(), DomainError>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<Auction>, DomainError>;
    /// Auctions with `updated_at` strictly after `since` (all when `None`),
    /// ordered by `(updated_at, id)`.
    fn updated_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Auction>, DomainError>;
    /// Folds a bid into `current_high_bid`. Returns whether the row changed.
    fn apply_bid(&self, bid: &BidPlaced) -> Result<bool, DomainError>;
}

/// Dispatcher side of the outbox.
pub trait OutboxStore: Send + Sync + 'static {
    /// Leases up to `limit` claimable rows in `seq` order.
    fn claim_pending(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxMessage>, DomainError>;
    fn mark_delivered(&self, id: Uuid) -> Result<(), DomainError>;
    /// Drops the lease so the row is claimable on the next cycle.
    fn release(&self, id: Uuid) -> Result<(), DomainError>;
    fn purge_delivered(&self, older_than: DateTime<Utc>) -> Result<usize, DomainError>;
    fn pending_count(&self) -> Result<i64, DomainError>;
}

/// Read-model storage owned by the search service.
pub trait SearchItemStore: Send + Sync + 'static {
    /// Returns `false` when a row with the same id already exists.
    fn insert_if_absent(&self, item: SearchItem) -> Result<bool, DomainError>;
    fn apply_update(&self, update: &AuctionUpdated) -> Result<bool, DomainError>;
    fn remove(&self, id: Uuid) -> Result<bool, DomainError>;
    fn apply_bid(&self, bid: &BidPlaced) -> Result<bool, DomainError>;
    /// Merges pulled snapshots; returns how many rows were inserted or changed.
    fn upsert_many(&self, items: Vec<SearchItem>) -> Result<usize, DomainError>;
    /// Largest `updated_at` stored, `None` for an empty store.
    fn watermark(&self) -> Result<Option<DateTime<Utc>>, DomainError>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<SearchItem>, DomainError>;
    fn count(&self) -> Result<i64, DomainError>;
}
