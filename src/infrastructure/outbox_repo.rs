use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::dsl::min;
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::errors::DomainError;
use crate::domain::events::DomainEvent;
use crate::domain::outbox::{DeliveryState, LeasedAggregates, NewOutboxMessage, OutboxMessage};
use crate::domain::ports::OutboxStore;
use crate::schema::outbox_messages;

use super::models::{NewOutboxMessageRow, OutboxMessageRow};

/// Append `events` to the outbox on an open connection. Only call this inside
/// the transaction that performs the state change the events describe.
pub fn append_events(conn: &mut PgConnection, events: &[DomainEvent]) -> Result<usize, DomainError> {
    let now = Utc::now();
    let rows = events
        .iter()
        .map(|event| NewOutboxMessage::from_event(event, now).and_then(NewOutboxMessageRow::try_from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(diesel::insert_into(outbox_messages::table)
        .values(&rows)
        .execute(conn)?)
}

// ── Transactional publisher ──────────────────────────────────────────────────

/// Runs a state mutation and records the events it returns in one transaction.
///
/// Either both the mutation and its outbox rows commit, or neither does.
#[derive(Clone)]
pub struct DieselPublisher {
    pool: DbPool,
}

impl DieselPublisher {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn publish<T, F>(&self, mutation: F) -> Result<T, DomainError>
    where
        F: FnOnce(&mut PgConnection) -> Result<(T, Vec<DomainEvent>), DomainError>,
    {
        let mut pooled = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, DomainError, _>(|conn| {
            let (value, events) = mutation(conn)?;
            append_events(conn, &events)?;
            Ok(value)
        })
    }
}

// ── Dispatcher-side store ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DieselOutboxStore {
    pool: DbPool,
}

impl DieselOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl OutboxStore for DieselOutboxStore {
    fn claim_pending(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxMessage>, DomainError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| DomainError::InvalidInput(format!("claim lease: {e}")))?;
        let mut pooled = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, DomainError, _>(|conn| {
            let now = Utc::now();
            let leased: LeasedAggregates = outbox_messages::table
                .filter(outbox_messages::state.eq(DeliveryState::Pending.as_str()))
                .filter(outbox_messages::claimed_until.gt(now))
                .group_by(outbox_messages::aggregate_id)
                .select((outbox_messages::aggregate_id, min(outbox_messages::seq)))
                .load::<(String, Option<i64>)>(conn)?
                .into_iter()
                .filter_map(|(aggregate_id, seq)| seq.map(|seq| (aggregate_id, seq)))
                .collect();

            // SKIP LOCKED keeps concurrent dispatchers from claiming the same rows.
            let rows: Vec<OutboxMessageRow> = outbox_messages::table
                .filter(outbox_messages::state.eq(DeliveryState::Pending.as_str()))
                .filter(
                    outbox_messages::claimed_until
                        .is_null()
                        .or(outbox_messages::claimed_until.le(now)),
                )
                .order(outbox_messages::seq.asc())
                .limit(limit)
                .select(OutboxMessageRow::as_select())
                .for_update()
                .skip_locked()
                .load(conn)?;

            let until = now + lease;
            let claimed: Vec<OutboxMessage> = rows
                .into_iter()
                .map(|mut row| {
                    row.claimed_until = Some(until);
                    OutboxMessage::try_from(row)
                })
                .filter(|message| message.as_ref().map_or(true, |m| leased.admits(m)))
                .collect::<Result<_, _>>()?;

            let ids: Vec<Uuid> = claimed.iter().map(|m| m.id).collect();
            diesel::update(outbox_messages::table.filter(outbox_messages::id.eq_any(&ids)))
                .set(outbox_messages::claimed_until.eq(Some(until)))
                .execute(conn)?;
            Ok(claimed)
        })
    }

    fn mark_delivered(&self, id: Uuid) -> Result<(), DomainError> {
        let mut conn = self.pool.get()?;
        diesel::update(outbox_messages::table.find(id))
            .set((
                outbox_messages::state.eq(DeliveryState::Delivered.as_str()),
                outbox_messages::delivered_at.eq(Some(Utc::now())),
                outbox_messages::claimed_until.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn release(&self, id: Uuid) -> Result<(), DomainError> {
        let mut conn = self.pool.get()?;
        diesel::update(
            outbox_messages::table
                .find(id)
                .filter(outbox_messages::state.eq(DeliveryState::Pending.as_str())),
        )
        .set(outbox_messages::claimed_until.eq(None::<DateTime<Utc>>))
        .execute(&mut conn)?;
        Ok(())
    }

    fn purge_delivered(&self, older_than: DateTime<Utc>) -> Result<usize, DomainError> {
        let mut conn = self.pool.get()?;
        Ok(diesel::delete(
            outbox_messages::table
                .filter(outbox_messages::state.eq(DeliveryState::Delivered.as_str()))
                .filter(outbox_messages::delivered_at.lt(older_than)),
        )
        .execute(&mut conn)?)
    }

    fn pending_count(&self) -> Result<i64, DomainError> {
        let mut conn = self.pool.get()?;
        Ok(outbox_messages::table
            .filter(outbox_messages::state.eq(DeliveryState::Pending.as_str()))
            .count()
            .get_result(&mut conn)?)
    }
}
