use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::auction::{Auction, AuctionSnapshot, ItemChanges, NewAuction};
use crate::domain::errors::DomainError;
use crate::domain::ports::AuctionRepository;

/// Write side of the auction service. Every write commits its outbox event in
/// the same transaction and then nudges the dispatcher.
#[derive(Clone)]
pub struct AuctionService {
    repo: Arc<dyn AuctionRepository>,
    dispatch: Option<Arc<Notify>>,
}

impl AuctionService {
    pub fn new(repo: Arc<dyn AuctionRepository>) -> Self {
        Self {
            repo,
            dispatch: None,
        }
    }

    /// Wakes the outbox dispatcher after each committed write.
    pub fn with_dispatch_hint(mut self, wake: Arc<Notify>) -> Self {
        self.dispatch = Some(wake);
        self
    }

    fn committed(&self) {
        if let Some(wake) = &self.dispatch {
            wake.notify_one();
        }
    }

    pub fn create_auction(&self, input: NewAuction) -> Result<Auction, DomainError> {
        validate_new(&input)?;
        let auction = self.repo.create(input)?;
        self.committed();
        Ok(auction)
    }

    pub fn update_auction(&self, id: Uuid, changes: ItemChanges) -> Result<Auction, DomainError> {
        validate_changes(&changes)?;
        let auction = self.repo.update(id, changes)?;
        self.committed();
        Ok(auction)
    }

    pub fn delete_auction(&self, id: Uuid) -> Result<(), DomainError> {
        self.repo.delete(id)?;
        self.committed();
        Ok(())
    }

    pub fn get_auction(&self, id: Uuid) -> Result<AuctionSnapshot, DomainError> {
        self.repo
            .find_by_id(id)?
            .map(|auction| AuctionSnapshot::from(&auction))
            .ok_or(DomainError::NotFound(id))
    }

    /// Backs the catch-up pull endpoint.
    pub fn auctions_updated_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuctionSnapshot>, DomainError> {
        Ok(self
            .repo
            .updated_since(since)?
            .iter()
            .map(AuctionSnapshot::from)
            .collect())
    }
}

fn require(value: &str, field: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_new(input: &NewAuction) -> Result<(), DomainError> {
    require(&input.seller, "seller")?;
    require(&input.item.make, "make")?;
    require(&input.item.model, "model")?;
    require(&input.item.color, "color")?;
    if input.item.mileage < 0 {
        return Err(DomainError::InvalidInput("mileage must not be negative".to_string()));
    }
    if input.reserve_price < BigDecimal::from(0) {
        return Err(DomainError::InvalidInput(
            "reserve price must not be negative".to_string(),
        ));
    }
    Ok(())
}

fn validate_changes(changes: &ItemChanges) -> Result<(), DomainError> {
    for (value, field) in [
        (&changes.make, "make"),
        (&changes.model, "model"),
        (&changes.color, "color"),
    ] {
        if let Some(value) = value {
            require(value, field)?;
        }
    }
    if changes.mileage.is_some_and(|m| m < 0) {
        return Err(DomainError::InvalidInput("mileage must not be negative".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::auction::fixtures::new_auction;
    use crate::domain::ports::OutboxStore;
    use crate::infrastructure::memory::InMemoryAuctionStore;

    fn service() -> (AuctionService, InMemoryAuctionStore, Arc<Notify>) {
        let store = InMemoryAuctionStore::new();
        let wake = Arc::new(Notify::new());
        let service = AuctionService::new(Arc::new(store.clone())).with_dispatch_hint(wake.clone());
        (service, store, wake)
    }

    #[tokio::test]
    async fn committed_write_wakes_dispatcher() {
        let (service, store, wake) = service();

        service.create_auction(new_auction()).unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(100), wake.notified())
            .await
            .expect("dispatcher was not woken");
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn rejected_input_writes_nothing() {
        let (service, store, _) = service();
        let mut input = new_auction();
        input.reserve_price = BigDecimal::from(-1);

        let err = service.create_auction(input).unwrap_err();

        assert!(matches!(err, DomainError::InvalidInput(_)));
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn update_rejects_blank_fields() {
        let (service, _, _) = service();
        let auction = service.create_auction(new_auction()).unwrap();

        let err = service
            .update_auction(
                auction.id,
                ItemChanges {
                    make: Some("  ".to_string()),
                    ..ItemChanges::default()
                },
            )
            .unwrap_err();

        assert!(matches!(err, DomainError::InvalidInput(_)));
    }

    #[test]
    fn get_missing_auction_is_not_found() {
        let (service, _, _) = service();
        assert!(matches!(
            service.get_auction(Uuid::new_v4()),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn delete_then_pull_omits_auction() {
        let (service, _, _) = service();
        let kept = service.create_auction(new_auction()).unwrap();
        let gone = service.create_auction(new_auction()).unwrap();

        service.delete_auction(gone.id).unwrap();

        let ids: Vec<_> = service
            .auctions_updated_since(None)
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, [kept.id]);
    }
}
