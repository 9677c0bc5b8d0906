use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::errors::DomainError;
use super::events::{DomainEvent, EVENT_VERSION};

pub const AGGREGATE_TYPE: &str = "Auction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "Pending",
            DeliveryState::Delivered => "Delivered",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(DeliveryState::Pending),
            "Delivered" => Ok(DeliveryState::Delivered),
            other => Err(DomainError::Internal(format!(
                "unknown delivery state '{other}'"
            ))),
        }
    }
}

/// A row of the outbox, written in the same transaction as the change it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    /// Insertion order; the dispatcher delivers in ascending `seq`.
    pub seq: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub version: u32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
    pub claimed_until: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Outbox row before storage assigns its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub version: u32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxMessage {
    pub fn from_event(event: &DomainEvent, now: DateTime<Utc>) -> Result<Self, DomainError> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_type: AGGREGATE_TYPE.to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            event_type: event.event_type().as_str().to_string(),
            version: EVENT_VERSION,
            payload: event.to_payload()?,
            created_at: now,
        })
    }
}

impl OutboxMessage {
    /// Claimable when pending and not held by an unexpired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == DeliveryState::Pending && self.claimed_until.map_or(true, |until| until <= now)
    }
}

/// Earliest pending `seq` per aggregate that is held by an unexpired lease,
/// usually another dispatcher's. Later messages of that aggregate must not be
/// claimed until it is delivered or released.
#[derive(Debug, Default)]
pub struct LeasedAggregates(HashMap<String, i64>);

impl LeasedAggregates {
    pub fn hold(&mut self, aggregate_id: &str, seq: i64) {
        self.0
            .entry(aggregate_id.to_string())
            .and_modify(|first| *first = (*first).min(seq))
            .or_insert(seq);
    }

    pub fn admits(&self, message: &OutboxMessage) -> bool {
        self.0
            .get(&message.aggregate_id)
            .map_or(true, |&first| message.seq < first)
    }
}

impl FromIterator<(String, i64)> for LeasedAggregates {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        let mut leased = Self::default();
        for (aggregate_id, seq) in iter {
            leased.hold(&aggregate_id, seq);
        }
        leased
    }
}

/// What one dispatcher cycle achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub deferred: usize,
    pub purged: usize,
}
