use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::auction::{Auction, AuctionSnapshot};

/// Current schema version stamped on every published payload.
pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    AuctionCreated,
    AuctionUpdated,
    AuctionDeleted,
    BidPlaced,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::AuctionCreated,
        EventType::AuctionUpdated,
        EventType::AuctionDeleted,
        EventType::BidPlaced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AuctionCreated => "AuctionCreated",
            EventType::AuctionUpdated => "AuctionUpdated",
            EventType::AuctionDeleted => "AuctionDeleted",
            EventType::BidPlaced => "BidPlaced",
        }
    }

    /// Bus topic the event type is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::AuctionCreated => "auction-created",
            EventType::AuctionUpdated => "auction-updated",
            EventType::AuctionDeleted => "auction-deleted",
            EventType::BidPlaced => "bid-placed",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

/// Outcome the bidding side attached to a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidStatus {
    Accepted,
    AcceptedBelowReserve,
    TooLow,
    Finished,
    #[serde(other)]
    Unknown,
}

impl BidStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BidStatus::Accepted | BidStatus::AcceptedBelowReserve)
    }
}

/// Item fields after an update. Absent fields are left untouched by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionUpdated {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Auction> for AuctionUpdated {
    fn from(a: &Auction) -> Self {
        Self {
            id: a.id,
            make: Some(a.item.make.clone()),
            model: Some(a.item.model.clone()),
            color: Some(a.item.color.clone()),
            mileage: Some(a.item.mileage),
            year: Some(a.item.year),
            updated_at: a.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionDeleted {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPlaced {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub bidder: String,
    pub bid_time: DateTime<Utc>,
    pub amount: BigDecimal,
    pub bid_status: BidStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    AuctionCreated(AuctionSnapshot),
    AuctionUpdated(AuctionUpdated),
    AuctionDeleted(AuctionDeleted),
    BidPlaced(BidPlaced),
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event type '{0}'")]
    UnknownType(String),
    #[error("unsupported version {version} for {event_type}")]
    UnsupportedVersion { event_type: String, version: u32 },
    #[error("malformed {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::AuctionCreated(_) => EventType::AuctionCreated,
            DomainEvent::AuctionUpdated(_) => EventType::AuctionUpdated,
            DomainEvent::AuctionDeleted(_) => EventType::AuctionDeleted,
            DomainEvent::BidPlaced(_) => EventType::BidPlaced,
        }
    }

    /// Id of the auction the event belongs to.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            DomainEvent::AuctionCreated(e) => e.id,
            DomainEvent::AuctionUpdated(e) => e.id,
            DomainEvent::AuctionDeleted(e) => e.id,
            DomainEvent::BidPlaced(e) => e.auction_id,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            DomainEvent::AuctionCreated(e) => serde_json::to_value(e),
            DomainEvent::AuctionUpdated(e) => serde_json::to_value(e),
            DomainEvent::AuctionDeleted(e) => serde_json::to_value(e),
            DomainEvent::BidPlaced(e) => serde_json::to_value(e),
        }
    }

    pub fn decode(tag: &str, version: u32, payload: Value) -> Result<Self, EventDecodeError> {
        let event_type =
            EventType::parse(tag).ok_or_else(|| EventDecodeError::UnknownType(tag.to_string()))?;
        if version != EVENT_VERSION {
            return Err(EventDecodeError::UnsupportedVersion {
                event_type: tag.to_string(),
                version,
            });
        }
        let malformed = |source: serde_json::Error| EventDecodeError::Payload {
            event_type: tag.to_string(),
            source,
        };
        Ok(match event_type {
            EventType::AuctionCreated => {
                DomainEvent::AuctionCreated(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::AuctionUpdated => {
                DomainEvent::AuctionUpdated(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::AuctionDeleted => {
                DomainEvent::AuctionDeleted(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::BidPlaced => {
                DomainEvent::BidPlaced(serde_json::from_value(payload).map_err(malformed)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::domain::auction::fixtures::{snapshot, t};

    #[test]
    fn topics_and_tags_are_distinct() {
        let topics: HashSet<_> = EventType::ALL.iter().map(|t| t.topic()).collect();
        assert_eq!(topics.len(), EventType::ALL.len());
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
    }

    #[test]
    fn decode_recovers_created_event() {
        let event = DomainEvent::AuctionCreated(snapshot(t(1)));
        let payload = event.to_payload().expect("encode");

        let decoded = DomainEvent::decode("AuctionCreated", EVENT_VERSION, payload).expect("decode");

        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = DomainEvent::decode("AuctionFinished", EVENT_VERSION, json!({})).unwrap_err();
        assert!(matches!(err, EventDecodeError::UnknownType(_)));
    }

    #[test]
    fn decode_rejects_future_version() {
        let err = DomainEvent::decode("AuctionDeleted", 2, json!({ "id": Uuid::new_v4() }))
            .unwrap_err();
        assert!(matches!(err, EventDecodeError::UnsupportedVersion { version: 2, .. }));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let err = DomainEvent::decode("BidPlaced", EVENT_VERSION, json!({ "amount": "x" }))
            .unwrap_err();
        assert!(matches!(err, EventDecodeError::Payload { .. }));
    }

    #[test]
    fn bid_placed_reads_wire_format() {
        let auction_id = Uuid::new_v4();
        let payload = json!({
            "id": Uuid::new_v4(),
            "auctionId": auction_id,
            "bidder": "alice",
            "bidTime": "2024-01-01T10:00:00Z",
            "amount": "120",
            "bidStatus": "AcceptedBelowReserve"
        });

        let event = DomainEvent::decode("BidPlaced", EVENT_VERSION, payload).expect("decode");

        assert_eq!(event.aggregate_id(), auction_id);
        let DomainEvent::BidPlaced(bid) = event else {
            panic!("expected BidPlaced");
        };
        assert_eq!(bid.amount, BigDecimal::from(120));
        assert!(bid.bid_status.is_accepted());
    }

    #[test]
    fn unrecognised_bid_status_is_not_accepted() {
        let status: BidStatus = serde_json::from_value(json!("Cancelled")).expect("decode");
        assert_eq!(status, BidStatus::Unknown);
        assert!(!status.is_accepted());
        assert!(!BidStatus::TooLow.is_accepted());
    }

    #[test]
    fn auction_updated_omits_absent_fields() {
        let update = AuctionUpdated {
            id: Uuid::new_v4(),
            make: None,
            model: None,
            color: Some("Blue".to_string()),
            mileage: None,
            year: None,
            updated_at: t(3),
        };
        let json = serde_json::to_value(&update).expect("encode");
        assert!(json.get("make").is_none());
        assert_eq!(json["color"], "Blue");
    }
}
