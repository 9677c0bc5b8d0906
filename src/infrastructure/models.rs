use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::auction::{Auction, Item, SearchItem};
use crate::domain::errors::DomainError;
use crate::domain::outbox::{NewOutboxMessage, OutboxMessage};
use crate::schema::{auctions, outbox_messages, search_items};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = auctions)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AuctionRow {
    pub id: Uuid,
    pub seller: String,
    pub reserve_price: BigDecimal,
    pub current_high_bid: Option<BigDecimal>,
    pub status: String,
    pub auction_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    pub image_url: String,
}

impl From<&Auction> for AuctionRow {
    fn from(a: &Auction) -> Self {
        Self {
            id: a.id,
            seller: a.seller.clone(),
            reserve_price: a.reserve_price.clone(),
            current_high_bid: a.current_high_bid.clone(),
            status: a.status.to_string(),
            auction_end: a.auction_end,
            created_at: a.created_at,
            updated_at: a.updated_at,
            make: a.item.make.clone(),
            model: a.item.model.clone(),
            year: a.item.year,
            color: a.item.color.clone(),
            mileage: a.item.mileage,
            image_url: a.item.image_url.clone(),
        }
    }
}

impl TryFrom<AuctionRow> for Auction {
    type Error = DomainError;

    fn try_from(row: AuctionRow) -> Result<Self, Self::Error> {
        Ok(Auction {
            id: row.id,
            seller: row.seller,
            reserve_price: row.reserve_price,
            current_high_bid: row.current_high_bid,
            status: row.status.parse()?,
            auction_end: row.auction_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
            item: Item {
                make: row.make,
                model: row.model,
                year: row.year,
                color: row.color,
                mileage: row.mileage,
                image_url: row.image_url,
            },
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = search_items)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SearchItemRow {
    pub id: Uuid,
    pub seller: String,
    pub current_high_bid: Option<BigDecimal>,
    pub status: String,
    pub auction_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    pub image_url: String,
}

impl From<&SearchItem> for SearchItemRow {
    fn from(i: &SearchItem) -> Self {
        Self {
            id: i.id,
            seller: i.seller.clone(),
            current_high_bid: i.current_high_bid.clone(),
            status: i.status.to_string(),
            auction_end: i.auction_end,
            created_at: i.created_at,
            updated_at: i.updated_at,
            make: i.make.clone(),
            model: i.model.clone(),
            year: i.year,
            color: i.color.clone(),
            mileage: i.mileage,
            image_url: i.image_url.clone(),
        }
    }
}

impl TryFrom<SearchItemRow> for SearchItem {
    type Error = DomainError;

    fn try_from(row: SearchItemRow) -> Result<Self, Self::Error> {
        Ok(SearchItem {
            id: row.id,
            seller: row.seller,
            current_high_bid: row.current_high_bid,
            status: row.status.parse()?,
            auction_end: row.auction_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
            make: row.make,
            model: row.model,
            year: row.year,
            color: row.color,
            mileage: row.mileage,
            image_url: row.image_url,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = outbox_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxMessageRow {
    pub id: Uuid,
    pub seq: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub version: i32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub state: String,
    pub claimed_until: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxMessageRow> for OutboxMessage {
    type Error = DomainError;

    fn try_from(row: OutboxMessageRow) -> Result<Self, Self::Error> {
        Ok(OutboxMessage {
            id: row.id,
            seq: row.seq,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            version: u32::try_from(row.version)
                .map_err(|_| DomainError::Internal(format!("negative version {}", row.version)))?,
            payload: row.payload,
            created_at: row.created_at,
            state: row.state.parse()?,
            claimed_until: row.claimed_until,
            delivered_at: row.delivered_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outbox_messages)]
pub struct NewOutboxMessageRow {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub version: i32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<NewOutboxMessage> for NewOutboxMessageRow {
    type Error = DomainError;

    fn try_from(m: NewOutboxMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: m.id,
            aggregate_type: m.aggregate_type,
            aggregate_id: m.aggregate_id,
            event_type: m.event_type,
            version: i32::try_from(m.version)
                .map_err(|_| DomainError::Internal(format!("version {} out of range", m.version)))?,
            payload: m.payload,
            created_at: m.created_at,
        })
    }
}
