use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::auction::SearchItem;
use crate::domain::errors::DomainError;
use crate::domain::events::{AuctionUpdated, BidPlaced};
use crate::domain::merge::{apply_item_update, merge_high_bid, merge_snapshot};
use crate::domain::ports::SearchItemStore;
use crate::schema::search_items;

use super::models::SearchItemRow;

/// Postgres-backed search read model. Every read-modify-write holds the row
/// lock (`SELECT ... FOR UPDATE`) for the duration of the merge.
#[derive(Clone)]
pub struct DieselSearchRepository {
    pool: DbPool,
}

impl DieselSearchRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn with_locked<F>(&self, id: Uuid, merge: F) -> Result<bool, DomainError>
    where
        F: FnOnce(&mut SearchItem) -> bool,
    {
        let mut pooled = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, DomainError, _>(|conn| {
            let mut item = lock_item(conn, id)?.ok_or(DomainError::NotFound(id))?;
            if !merge(&mut item) {
                return Ok(false);
            }
            save_item(conn, &item)?;
            Ok(true)
        })
    }
}

fn lock_item(conn: &mut PgConnection, id: Uuid) -> Result<Option<SearchItem>, DomainError> {
    search_items::table
        .find(id)
        .select(SearchItemRow::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .map(SearchItem::try_from)
        .transpose()
}

fn save_item(conn: &mut PgConnection, item: &SearchItem) -> Result<(), DomainError> {
    diesel::update(search_items::table.find(item.id))
        .set(&SearchItemRow::from(item))
        .execute(conn)?;
    Ok(())
}

impl SearchItemStore for DieselSearchRepository {
    fn insert_if_absent(&self, item: SearchItem) -> Result<bool, DomainError> {
        let mut conn = self.pool.get()?;
        let inserted = diesel::insert_into(search_items::table)
            .values(&SearchItemRow::from(&item))
            .on_conflict(search_items::id)
            .do_nothing()
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    fn apply_update(&self, update: &AuctionUpdated) -> Result<bool, DomainError> {
        self.with_locked(update.id, |item| apply_item_update(item, update))
    }

    fn remove(&self, id: Uuid) -> Result<bool, DomainError> {
        let mut conn = self.pool.get()?;
        let removed = diesel::delete(search_items::table.find(id)).execute(&mut conn)?;
        Ok(removed > 0)
    }

    fn apply_bid(&self, bid: &BidPlaced) -> Result<bool, DomainError> {
        self.with_locked(bid.auction_id, |item| {
            match merge_high_bid(item.current_high_bid.as_ref(), bid.bid_status, &bid.amount) {
                Some(high_bid) => {
                    item.current_high_bid = Some(high_bid);
                    true
                }
                None => false,
            }
        })
    }

    fn upsert_many(&self, items: Vec<SearchItem>) -> Result<usize, DomainError> {
        let mut pooled = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, DomainError, _>(|conn| {
            let mut changed = 0;
            for incoming in items {
                match lock_item(conn, incoming.id)? {
                    Some(mut local) => {
                        if merge_snapshot(&mut local, incoming) {
                            save_item(conn, &local)?;
                            changed += 1;
                        }
                    }
                    None => {
                        changed += diesel::insert_into(search_items::table)
                            .values(&SearchItemRow::from(&incoming))
                            .on_conflict(search_items::id)
                            .do_nothing()
                            .execute(conn)?;
                    }
                }
            }
            Ok(changed)
        })
    }

    fn watermark(&self) -> Result<Option<DateTime<Utc>>, DomainError> {
        let mut conn = self.pool.get()?;
        Ok(search_items::table
            .select(max(search_items::updated_at))
            .first(&mut conn)?)
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<SearchItem>, DomainError> {
        let mut conn = self.pool.get()?;
        search_items::table
            .find(id)
            .select(SearchItemRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(SearchItem::try_from)
            .transpose()
    }

    fn count(&self) -> Result<i64, DomainError> {
        let mut conn = self.pool.get()?;
        Ok(search_items::table.count().get_result(&mut conn)?)
    }
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;
    use chrono::{Duration, SubsecRound, Utc};
    use uuid::Uuid;

    use super::DieselSearchRepository;
    use crate::domain::auction::{AuctionStatus, SearchItem};
    use crate::domain::errors::DomainError;
    use crate::domain::events::{AuctionUpdated, BidPlaced, BidStatus};
    use crate::domain::ports::SearchItemStore;
    use crate::infrastructure::test_support::setup_search_db;

    fn item(updated_at: chrono::DateTime<Utc>) -> SearchItem {
        // Postgres keeps microseconds.
        let updated_at = updated_at.trunc_subsecs(6);
        SearchItem {
            id: Uuid::new_v4(),
            seller: "bob".to_string(),
            current_high_bid: None,
            status: AuctionStatus::Live,
            auction_end: updated_at + Duration::days(7),
            created_at: updated_at,
            updated_at,
            make: "Ford".to_string(),
            model: "GT".to_string(),
            year: 2020,
            color: "White".to_string(),
            mileage: 50_000,
            image_url: "https://cdn.example.com/ford-gt.jpg".to_string(),
        }
    }

    fn bid(auction_id: Uuid, amount: i64) -> BidPlaced {
        BidPlaced {
            id: Uuid::new_v4(),
            auction_id,
            bidder: "alice".to_string(),
            bid_time: Utc::now(),
            amount: BigDecimal::from(amount),
            bid_status: BidStatus::Accepted,
        }
    }

    #[tokio::test]
    #[ignore = "requires a container runtime"]
    async fn duplicate_insert_is_a_no_op() {
        let (_container, pool) = setup_search_db().await;
        let repo = DieselSearchRepository::new(pool);
        let row = item(Utc::now());

        assert!(repo.insert_if_absent(row.clone()).expect("insert failed"));
        assert!(!repo.insert_if_absent(row).expect("insert failed"));
        assert_eq!(repo.count().expect("count failed"), 1);
    }

    #[tokio::test]
    #[ignore = "requires a container runtime"]
    async fn bids_in_reverse_order_keep_the_maximum() {
        let (_container, pool) = setup_search_db().await;
        let repo = DieselSearchRepository::new(pool);
        let row = item(Utc::now());
        repo.insert_if_absent(row.clone()).expect("insert failed");

        repo.apply_bid(&bid(row.id, 120)).expect("bid failed");
        repo.apply_bid(&bid(row.id, 100)).expect("bid failed");

        let stored = repo.find_by_id(row.id).expect("find failed").expect("row exists");
        assert_eq!(stored.current_high_bid, Some(BigDecimal::from(120)));
    }

    #[tokio::test]
    #[ignore = "requires a container runtime"]
    async fn update_of_missing_row_is_not_found() {
        let (_container, pool) = setup_search_db().await;
        let repo = DieselSearchRepository::new(pool);
        let update = AuctionUpdated {
            id: Uuid::new_v4(),
            make: None,
            model: None,
            color: Some("Red".to_string()),
            mileage: None,
            year: None,
            updated_at: Utc::now(),
        };

        let err = repo.apply_update(&update).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[tokio::test]
    #[ignore = "requires a container runtime"]
    async fn watermark_tracks_newest_row() {
        let (_container, pool) = setup_search_db().await;
        let repo = DieselSearchRepository::new(pool);
        assert!(repo.watermark().expect("watermark failed").is_none());

        let older = item(Utc::now() - Duration::hours(1));
        let newer = item(Utc::now());
        let changed = repo
            .upsert_many(vec![older, newer.clone()])
            .expect("upsert failed");

        assert_eq!(changed, 2);
        let watermark = repo.watermark().expect("watermark failed").expect("non-empty");
        assert_eq!(watermark.timestamp_micros(), newer.updated_at.timestamp_micros());
        assert_eq!(repo.upsert_many(vec![newer]).expect("upsert failed"), 0);
    }
}
