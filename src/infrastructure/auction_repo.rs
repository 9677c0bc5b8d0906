use chrono::{DateTime, SubsecRound, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::auction::{Auction, AuctionSnapshot, ItemChanges, NewAuction};
use crate::domain::errors::DomainError;
use crate::domain::events::{AuctionDeleted, AuctionUpdated, BidPlaced, DomainEvent};
use crate::domain::merge::merge_high_bid;
use crate::domain::ports::AuctionRepository;
use crate::schema::auctions;

use super::models::AuctionRow;
use super::outbox_repo::DieselPublisher;

// ── Error conversions (infrastructure concern only) ──────────────────────────

impl From<diesel::result::Error> for DomainError {
    fn from(e: diesel::result::Error) -> Self {
        DomainError::Internal(e.to_string())
    }
}

impl From<r2d2::Error> for DomainError {
    fn from(e: r2d2::Error) -> Self {
        DomainError::Internal(e.to_string())
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DieselAuctionRepository {
    pool: DbPool,
    publisher: DieselPublisher,
}

impl DieselAuctionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self {
            publisher: DieselPublisher::new(pool.clone()),
            pool,
        }
    }
}

/// Postgres keeps microseconds; events must carry exactly what is stored.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn lock_auction(conn: &mut PgConnection, id: Uuid) -> Result<Auction, DomainError> {
    let row = auctions::table
        .find(id)
        .select(AuctionRow::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .ok_or(DomainError::NotFound(id))?;
    Auction::try_from(row)
}

impl AuctionRepository for DieselAuctionRepository {
    fn create(&self, input: NewAuction) -> Result<Auction, DomainError> {
        self.publisher.publish(|conn| {
            let auction = Auction::open(input, now());
            diesel::insert_into(auctions::table)
                .values(&AuctionRow::from(&auction))
                .execute(conn)?;

            let event = DomainEvent::AuctionCreated(AuctionSnapshot::from(&auction));
            Ok((auction, vec![event]))
        })
    }

    fn update(&self, id: Uuid, changes: ItemChanges) -> Result<Auction, DomainError> {
        self.publisher.publish(|conn| {
            let mut auction = lock_auction(conn, id)?;
            auction.apply_changes(changes, now());
            diesel::update(auctions::table.find(id))
                .set(&AuctionRow::from(&auction))
                .execute(conn)?;

            let event = DomainEvent::AuctionUpdated(AuctionUpdated::from(&auction));
            Ok((auction, vec![event]))
        })
    }

    fn delete(&self, id: Uuid) -> Result<(), DomainError> {
        self.publisher.publish(|conn| {
            let removed = diesel::delete(auctions::table.find(id)).execute(conn)?;
            if removed == 0 {
                return Err(DomainError::NotFound(id));
            }
            Ok(((), vec![DomainEvent::AuctionDeleted(AuctionDeleted { id })]))
        })
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Auction>, DomainError> {
        let mut conn = self.pool.get()?;

        auctions::table
            .find(id)
            .select(AuctionRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Auction::try_from)
            .transpose()
    }

    fn updated_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Auction>, DomainError> {
        let mut conn = self.pool.get()?;

        let mut query = auctions::table
            .select(AuctionRow::as_select())
            .order((auctions::updated_at.asc(), auctions::id.asc()))
            .into_boxed();
        if let Some(since) = since {
            query = query.filter(auctions::updated_at.gt(since));
        }

        query
            .load(&mut conn)?
            .into_iter()
            .map(Auction::try_from)
            .collect()
    }

    fn apply_bid(&self, bid: &BidPlaced) -> Result<bool, DomainError> {
        let mut pooled = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, DomainError, _>(|conn| {
            let mut auction = lock_auction(conn, bid.auction_id)?;
            let Some(high_bid) =
                merge_high_bid(auction.current_high_bid.as_ref(), bid.bid_status, &bid.amount)
            else {
                return Ok(false);
            };

            auction.current_high_bid = Some(high_bid);
            auction.touch(now());
            diesel::update(auctions::table.find(auction.id))
                .set((
                    auctions::current_high_bid.eq(&auction.current_high_bid),
                    auctions::updated_at.eq(auction.updated_at),
                ))
                .execute(conn)?;
            Ok(true)
        })
    }
}
