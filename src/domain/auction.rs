use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::errors::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum AuctionStatus {
    Live,
    Finished,
    ReserveNotMet,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Live => "Live",
            AuctionStatus::Finished => "Finished",
            AuctionStatus::ReserveNotMet => "ReserveNotMet",
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuctionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Live" => Ok(AuctionStatus::Live),
            "Finished" => Ok(AuctionStatus::Finished),
            "ReserveNotMet" => Ok(AuctionStatus::ReserveNotMet),
            other => Err(DomainError::Internal(format!(
                "unknown auction status '{other}'"
            ))),
        }
    }
}

/// The vehicle being sold. Owned by exactly one auction.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    pub image_url: String,
}

/// Aggregate root owned by the auction service.
#[derive(Debug, Clone, PartialEq)]
pub struct Auction {
    pub id: Uuid,
    pub seller: String,
    pub reserve_price: BigDecimal,
    pub current_high_bid: Option<BigDecimal>,
    pub status: AuctionStatus,
    pub auction_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub item: Item,
}

#[derive(Debug, Clone)]
pub struct NewAuction {
    pub seller: String,
    pub reserve_price: BigDecimal,
    pub auction_end: DateTime<Utc>,
    pub item: Item,
}

/// Partial update of the item's descriptive fields; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemChanges {
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub mileage: Option<i32>,
    pub year: Option<i32>,
}

impl Auction {
    pub fn open(input: NewAuction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seller: input.seller,
            reserve_price: input.reserve_price,
            current_high_bid: None,
            status: AuctionStatus::Live,
            auction_end: input.auction_end,
            created_at: now,
            updated_at: now,
            item: input.item,
        }
    }

    /// Applies `changes` and advances `updated_at`, never moving it backwards.
    pub fn apply_changes(&mut self, changes: ItemChanges, now: DateTime<Utc>) {
        if let Some(make) = changes.make {
            self.item.make = make;
        }
        if let Some(model) = changes.model {
            self.item.model = model;
        }
        if let Some(color) = changes.color {
            self.item.color = color;
        }
        if let Some(mileage) = changes.mileage {
            self.item.mileage = mileage;
        }
        if let Some(year) = changes.year {
            self.item.year = year;
        }
        self.touch(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Flattened auction as it travels between services: the `AuctionCreated`
/// payload and the pull endpoint's response rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub id: Uuid,
    pub seller: String,
    #[schema(value_type = String)]
    pub reserve_price: BigDecimal,
    #[schema(value_type = Option<String>)]
    pub current_high_bid: Option<BigDecimal>,
    pub status: AuctionStatus,
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

impl From<&Auction> for AuctionSnapshot {
    fn from(a: &Auction) -> Self {
        Self {
            id: a.id,
            seller: a.seller.clone(),
            reserve_price: a.reserve_price.clone(),
            current_high_bid: a.current_high_bid.clone(),
            status: a.status,
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

/// Denormalised row of the search read model. Keyed by the auction id.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchItem {
    pub id: Uuid,
    pub seller: String,
    pub current_high_bid: Option<BigDecimal>,
    pub status: AuctionStatus,
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

impl From<AuctionSnapshot> for SearchItem {
    fn from(s: AuctionSnapshot) -> Self {
        Self {
            id: s.id,
            seller: s.seller,
            current_high_bid: s.current_high_bid,
            status: s.status,
            auction_end: s.auction_end,
            created_at: s.created_at,
            updated_at: s.updated_at,
            make: s.make,
            model: s.model,
            year: s.year,
            color: s.color,
            mileage: s.mileage,
            image_url: s.image_url,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{Duration, TimeZone};

    use super::*;

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    pub fn item() -> Item {
        Item {
            make: "Ford".to_string(),
            model: "GT".to_string(),
            year: 2020,
            color: "White".to_string(),
            mileage: 50_000,
            image_url: "https://cdn.example.com/ford-gt.jpg".to_string(),
        }
    }

    pub fn new_auction() -> NewAuction {
        NewAuction {
            seller: "bob".to_string(),
            reserve_price: BigDecimal::from(20_000),
            auction_end: t(86_400),
            item: item(),
        }
    }

    pub fn snapshot(updated_at: DateTime<Utc>) -> AuctionSnapshot {
        let mut auction = Auction::open(new_auction(), t(0));
        auction.updated_at = updated_at;
        AuctionSnapshot::from(&auction)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn apply_changes_touches_only_provided_fields() {
        let mut auction = Auction::open(new_auction(), t(0));
        auction.apply_changes(
            ItemChanges {
                color: Some("Red".to_string()),
                mileage: Some(51_000),
                ..ItemChanges::default()
            },
            t(10),
        );

        assert_eq!(auction.item.color, "Red");
        assert_eq!(auction.item.mileage, 51_000);
        assert_eq!(auction.item.make, "Ford");
        assert_eq!(auction.updated_at, t(10));
    }

    #[test]
    fn touch_never_moves_updated_at_backwards() {
        let mut auction = Auction::open(new_auction(), t(100));
        auction.touch(t(50));
        assert_eq!(auction.updated_at, t(100));
    }

    #[test]
    fn status_parses_its_own_display() {
        for status in [
            AuctionStatus::Live,
            AuctionStatus::Finished,
            AuctionStatus::ReserveNotMet,
        ] {
            assert_eq!(status.to_string().parse::<AuctionStatus>().ok(), Some(status));
        }
        assert!("Paused".parse::<AuctionStatus>().is_err());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(snapshot(t(5))).expect("serialize");
        assert!(json.get("currentHighBid").is_some());
        assert!(json.get("updatedAt").is_some());
        assert_eq!(json["status"], "Live");
    }
}
