//! Merge rules shared by every consumer of auction events.
//!
//! Each function is pure and only ever moves state forward (higher bid, newer
//! `updated_at`), so replaying or reordering events converges to the same
//! result. Callers run them under a per-row lock.

use bigdecimal::BigDecimal;

use super::auction::SearchItem;
use super::events::{AuctionUpdated, BidStatus};

/// Returns the new high bid when the bid raises it, `None` when state is unchanged.
///
/// Only accepted bids count. A bid that was not accepted leaves the current
/// value alone, including when there is none yet.
pub fn merge_high_bid(
    current: Option<&BigDecimal>,
    status: BidStatus,
    amount: &BigDecimal,
) -> Option<BigDecimal> {
    if !status.is_accepted() {
        return None;
    }
    match current {
        Some(current) if amount <= current => None,
        _ => Some(amount.clone()),
    }
}

/// Applies the fields an update carries when it is not older than the stored row.
pub fn apply_item_update(item: &mut SearchItem, update: &AuctionUpdated) -> bool {
    if update.updated_at < item.updated_at {
        return false;
    }
    let before = item.clone();
    if let Some(make) = &update.make {
        item.make = make.clone();
    }
    if let Some(model) = &update.model {
        item.model = model.clone();
    }
    if let Some(color) = &update.color {
        item.color = color.clone();
    }
    if let Some(mileage) = update.mileage {
        item.mileage = mileage;
    }
    if let Some(year) = update.year {
        item.year = year;
    }
    item.updated_at = update.updated_at;
    *item != before
}

/// Folds an upstream snapshot into the local row: descriptive fields follow the
/// newer `updated_at`, the high bid keeps the larger of the two.
pub fn merge_snapshot(local: &mut SearchItem, incoming: SearchItem) -> bool {
    let before = local.clone();
    let high_bid = max_bid(local.current_high_bid.take(), incoming.current_high_bid.clone());
    if incoming.updated_at > before.updated_at {
        *local = incoming;
    }
    local.current_high_bid = high_bid;
    *local != before
}

fn max_bid(a: Option<BigDecimal>, b: Option<BigDecimal>) -> Option<BigDecimal> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::auction::fixtures::{snapshot, t};

    fn bid(amount: i64) -> BigDecimal {
        BigDecimal::from(amount)
    }

    fn fold_bids(bids: &[(i64, BidStatus)]) -> Option<BigDecimal> {
        let mut current: Option<BigDecimal> = None;
        for (amount, status) in bids {
            if let Some(next) = merge_high_bid(current.as_ref(), *status, &bid(*amount)) {
                current = Some(next);
            }
        }
        current
    }

    fn item_at(secs: i64) -> SearchItem {
        SearchItem::from(snapshot(t(secs)))
    }

    fn update(id: Uuid, color: &str, secs: i64) -> AuctionUpdated {
        AuctionUpdated {
            id,
            make: None,
            model: None,
            color: Some(color.to_string()),
            mileage: None,
            year: None,
            updated_at: t(secs),
        }
    }

    #[test]
    fn first_accepted_bid_sets_high_bid() {
        assert_eq!(merge_high_bid(None, BidStatus::Accepted, &bid(100)), Some(bid(100)));
    }

    #[test]
    fn accepted_bids_converge_to_maximum_in_either_order() {
        let forward = fold_bids(&[(100, BidStatus::Accepted), (120, BidStatus::Accepted)]);
        let reversed = fold_bids(&[(120, BidStatus::Accepted), (100, BidStatus::Accepted)]);
        assert_eq!(forward, Some(bid(120)));
        assert_eq!(reversed, Some(bid(120)));
    }

    #[test]
    fn replayed_bid_is_a_no_op() {
        let current = bid(120);
        assert_eq!(merge_high_bid(Some(&current), BidStatus::Accepted, &bid(120)), None);
    }

    #[test]
    fn rejected_bid_never_changes_state() {
        let current = bid(50);
        assert_eq!(merge_high_bid(Some(&current), BidStatus::TooLow, &bid(100)), None);
        assert_eq!(merge_high_bid(None, BidStatus::TooLow, &bid(100)), None);
        assert_eq!(fold_bids(&[(100, BidStatus::Finished), (50, BidStatus::Accepted)]), Some(bid(50)));
    }

    #[test]
    fn below_reserve_bids_count_as_accepted() {
        let current = bid(50);
        assert_eq!(
            merge_high_bid(Some(&current), BidStatus::AcceptedBelowReserve, &bid(60)),
            Some(bid(60))
        );
    }

    #[test]
    fn update_applies_carried_fields_only() {
        let mut item = item_at(0);
        let id = item.id;
        assert!(apply_item_update(&mut item, &update(id, "Red", 5)));
        assert_eq!(item.color, "Red");
        assert_eq!(item.make, "Ford");
        assert_eq!(item.updated_at, t(5));
    }

    #[test]
    fn update_replay_is_idempotent() {
        let mut item = item_at(0);
        let event = update(item.id, "Red", 5);
        apply_item_update(&mut item, &event);
        let once = item.clone();

        assert!(!apply_item_update(&mut item, &event));
        assert_eq!(item, once);
    }

    #[test]
    fn reordered_updates_converge_on_newest() {
        let mut a = item_at(0);
        let mut b = a.clone();
        let older = update(a.id, "Red", 5);
        let newer = update(a.id, "Blue", 9);

        apply_item_update(&mut a, &older);
        apply_item_update(&mut a, &newer);
        apply_item_update(&mut b, &newer);
        apply_item_update(&mut b, &older);

        assert_eq!(a, b);
        assert_eq!(a.color, "Blue");
    }

    #[test]
    fn snapshot_merge_takes_newer_fields_and_higher_bid() {
        let mut local = item_at(5);
        local.current_high_bid = Some(bid(300));
        let mut incoming = local.clone();
        incoming.updated_at = t(9);
        incoming.color = "Green".to_string();
        incoming.current_high_bid = Some(bid(200));

        assert!(merge_snapshot(&mut local, incoming));
        assert_eq!(local.color, "Green");
        assert_eq!(local.updated_at, t(9));
        assert_eq!(local.current_high_bid, Some(bid(300)));
    }

    #[test]
    fn stale_snapshot_only_raises_bid() {
        let mut local = item_at(9);
        let mut incoming = local.clone();
        incoming.updated_at = t(5);
        incoming.color = "Green".to_string();
        incoming.current_high_bid = Some(bid(10));

        assert!(merge_snapshot(&mut local, incoming.clone()));
        assert_eq!(local.color, "White");
        assert_eq!(local.current_high_bid, Some(bid(10)));
        assert!(!merge_snapshot(&mut local, incoming));
    }
}
