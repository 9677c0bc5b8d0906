//! In-process implementations of the storage ports.
//!
//! They keep the same guarantees as the Postgres repositories: a publish
//! commits the mutation and its outbox rows together, and every
//! read-modify-write on a row happens under one lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::auction::{Auction, AuctionSnapshot, ItemChanges, NewAuction, SearchItem};
use crate::domain::errors::DomainError;
use crate::domain::events::{AuctionDeleted, AuctionUpdated, BidPlaced, DomainEvent};
use crate::domain::merge::{apply_item_update, merge_high_bid, merge_snapshot};
use crate::domain::outbox::{DeliveryState, LeasedAggregates, NewOutboxMessage, OutboxMessage};
use crate::domain::ports::{AuctionRepository, OutboxStore, SearchItemStore};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, DomainError> {
    mutex
        .lock()
        .map_err(|_| DomainError::Internal("in-memory store lock poisoned".to_string()))
}

// ── Auction store + outbox ───────────────────────────────────────────────────

#[derive(Default)]
struct AuctionState {
    auctions: HashMap<Uuid, Auction>,
    outbox: Vec<OutboxMessage>,
    next_seq: i64,
}

/// System-of-record storage and its outbox behind a single lock.
#[derive(Clone, Default)]
pub struct InMemoryAuctionStore {
    state: Arc<Mutex<AuctionState>>,
}

impl InMemoryAuctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `mutation` and commits its changes together with the returned
    /// events. Nothing is kept when either step fails.
    pub fn publish<T, F>(&self, mutation: F) -> Result<T, DomainError>
    where
        F: FnOnce(&mut Staged<'_>) -> Result<(T, Vec<DomainEvent>), DomainError>,
    {
        let mut guard = lock(&self.state)?;
        let state = &mut *guard;
        let mut staged = Staged {
            auctions: &mut state.auctions,
            originals: HashMap::new(),
        };
        let (value, rows) = match mutation(&mut staged).and_then(|(value, events)| {
            let now = Utc::now();
            let rows = events
                .iter()
                .map(|event| NewOutboxMessage::from_event(event, now))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((value, rows))
        }) {
            Ok(done) => done,
            Err(e) => {
                staged.rollback();
                return Err(e);
            }
        };

        for row in rows {
            state.next_seq += 1;
            let seq = state.next_seq;
            state.outbox.push(OutboxMessage {
                id: row.id,
                seq,
                aggregate_type: row.aggregate_type,
                aggregate_id: row.aggregate_id,
                event_type: row.event_type,
                version: row.version,
                payload: row.payload,
                created_at: row.created_at,
                state: DeliveryState::Pending,
                claimed_until: None,
                delivered_at: None,
            });
        }
        Ok(value)
    }

    /// Copy of every outbox row still held, in `seq` order.
    pub fn outbox(&self) -> Result<Vec<OutboxMessage>, DomainError> {
        Ok(lock(&self.state)?.outbox.clone())
    }
}

/// The auctions as one publish sees them. Keeps the original of every entry
/// it touches so a failed publish can be undone.
pub struct Staged<'a> {
    auctions: &'a mut HashMap<Uuid, Auction>,
    originals: HashMap<Uuid, Option<Auction>>,
}

impl Staged<'_> {
    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Auction> {
        self.remember(*id);
        self.auctions.get_mut(id)
    }

    pub fn insert(&mut self, auction: Auction) {
        self.remember(auction.id);
        self.auctions.insert(auction.id, auction);
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Auction> {
        self.remember(*id);
        self.auctions.remove(id)
    }

    fn remember(&mut self, id: Uuid) {
        let auctions = &*self.auctions;
        self.originals
            .entry(id)
            .or_insert_with(|| auctions.get(&id).cloned());
    }

    fn rollback(self) {
        for (id, original) in self.originals {
            match original {
                Some(auction) => {
                    self.auctions.insert(id, auction);
                }
                None => {
                    self.auctions.remove(&id);
                }
            }
        }
    }
}

impl AuctionRepository for InMemoryAuctionStore {
    fn create(&self, input: NewAuction) -> Result<Auction, DomainError> {
        self.publish(|auctions| {
            let auction = Auction::open(input, Utc::now());
            auctions.insert(auction.clone());
            let event = DomainEvent::AuctionCreated(AuctionSnapshot::from(&auction));
            Ok((auction, vec![event]))
        })
    }

    fn update(&self, id: Uuid, changes: ItemChanges) -> Result<Auction, DomainError> {
        self.publish(|auctions| {
            let auction = auctions.get_mut(&id).ok_or(DomainError::NotFound(id))?;
            auction.apply_changes(changes, Utc::now());
            let event = DomainEvent::AuctionUpdated(AuctionUpdated::from(&*auction));
            Ok((auction.clone(), vec![event]))
        })
    }

    fn delete(&self, id: Uuid) -> Result<(), DomainError> {
        self.publish(|auctions| {
            auctions.remove(&id).ok_or(DomainError::NotFound(id))?;
            Ok(((), vec![DomainEvent::AuctionDeleted(AuctionDeleted { id })]))
        })
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Auction>, DomainError> {
        Ok(lock(&self.state)?.auctions.get(&id).cloned())
    }

    fn updated_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Auction>, DomainError> {
        let state = lock(&self.state)?;
        let mut found: Vec<Auction> = state
            .auctions
            .values()
            .filter(|a| since.map_or(true, |since| a.updated_at > since))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn apply_bid(&self, bid: &BidPlaced) -> Result<bool, DomainError> {
        let mut state = lock(&self.state)?;
        let auction = state
            .auctions
            .get_mut(&bid.auction_id)
            .ok_or(DomainError::NotFound(bid.auction_id))?;
        match merge_high_bid(auction.current_high_bid.as_ref(), bid.bid_status, &bid.amount) {
            Some(high_bid) => {
                auction.current_high_bid = Some(high_bid);
                auction.touch(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl OutboxStore for InMemoryAuctionStore {
    fn claim_pending(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxMessage>, DomainError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| DomainError::InvalidInput(format!("claim lease: {e}")))?;
        let limit = usize::try_from(limit).unwrap_or(0);
        let now = Utc::now();
        let until = now + lease;

        let mut state = lock(&self.state)?;
        let leased: LeasedAggregates = state
            .outbox
            .iter()
            .filter(|row| row.state == DeliveryState::Pending && !row.is_claimable(now))
            .map(|row| (row.aggregate_id.clone(), row.seq))
            .collect();
        let mut claimed = Vec::new();
        for row in state.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if row.is_claimable(now) && leased.admits(row) {
                row.claimed_until = Some(until);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_delivered(&self, id: Uuid) -> Result<(), DomainError> {
        let mut state = lock(&self.state)?;
        if let Some(row) = state.outbox.iter_mut().find(|row| row.id == id) {
            row.state = DeliveryState::Delivered;
            row.delivered_at = Some(Utc::now());
            row.claimed_until = None;
        }
        Ok(())
    }

    fn release(&self, id: Uuid) -> Result<(), DomainError> {
        let mut state = lock(&self.state)?;
        if let Some(row) = state
            .outbox
            .iter_mut()
            .find(|row| row.id == id && row.state == DeliveryState::Pending)
        {
            row.claimed_until = None;
        }
        Ok(())
    }

    fn purge_delivered(&self, older_than: DateTime<Utc>) -> Result<usize, DomainError> {
        let mut state = lock(&self.state)?;
        let before = state.outbox.len();
        state.outbox.retain(|row| {
            !(row.state == DeliveryState::Delivered
                && row.delivered_at.map_or(false, |at| at < older_than))
        });
        Ok(before - state.outbox.len())
    }

    fn pending_count(&self) -> Result<i64, DomainError> {
        let state = lock(&self.state)?;
        let pending = state
            .outbox
            .iter()
            .filter(|row| row.state == DeliveryState::Pending)
            .count();
        Ok(pending as i64)
    }
}

// ── Search read model ────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct InMemorySearchStore {
    items: Arc<Mutex<HashMap<Uuid, SearchItem>>>,
}

impl InMemorySearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_item<F>(&self, id: Uuid, merge: F) -> Result<bool, DomainError>
    where
        F: FnOnce(&mut SearchItem) -> bool,
    {
        let mut items = lock(&self.items)?;
        let item = items.get_mut(&id).ok_or(DomainError::NotFound(id))?;
        Ok(merge(item))
    }
}

impl SearchItemStore for InMemorySearchStore {
    fn insert_if_absent(&self, item: SearchItem) -> Result<bool, DomainError> {
        let mut items = lock(&self.items)?;
        if items.contains_key(&item.id) {
            return Ok(false);
        }
        items.insert(item.id, item);
        Ok(true)
    }

    fn apply_update(&self, update: &AuctionUpdated) -> Result<bool, DomainError> {
        self.with_item(update.id, |item| apply_item_update(item, update))
    }

    fn remove(&self, id: Uuid) -> Result<bool, DomainError> {
        Ok(lock(&self.items)?.remove(&id).is_some())
    }

    fn apply_bid(&self, bid: &BidPlaced) -> Result<bool, DomainError> {
        self.with_item(bid.auction_id, |item| {
            match merge_high_bid(item.current_high_bid.as_ref(), bid.bid_status, &bid.amount) {
                Some(high_bid) => {
                    item.current_high_bid = Some(high_bid);
                    true
                }
                None => false,
            }
        })
    }

    fn upsert_many(&self, incoming: Vec<SearchItem>) -> Result<usize, DomainError> {
        let mut items = lock(&self.items)?;
        let mut changed = 0;
        for item in incoming {
            match items.get_mut(&item.id) {
                Some(local) => {
                    if merge_snapshot(local, item) {
                        changed += 1;
                    }
                }
                None => {
                    items.insert(item.id, item);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    fn watermark(&self) -> Result<Option<DateTime<Utc>>, DomainError> {
        Ok(lock(&self.items)?.values().map(|item| item.updated_at).max())
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<SearchItem>, DomainError> {
        Ok(lock(&self.items)?.get(&id).cloned())
    }

    fn count(&self) -> Result<i64, DomainError> {
        Ok(lock(&self.items)?.len() as i64)
    }
}
