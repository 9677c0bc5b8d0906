//! Startup catch-up for the search read model.
//!
//! Events published while the search service was down (or before its queues
//! existed) never reach it through the bus. On startup it asks the auction
//! service directly for everything newer than its own watermark and merges
//! the answer into the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::blocking;
use crate::domain::auction::{AuctionSnapshot, SearchItem};
use crate::domain::errors::DomainError;
use crate::domain::ports::SearchItemStore;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("auction service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Where catch-up pulls auctions from.
#[async_trait]
pub trait AuctionSource: Send + Sync {
    /// Auctions with `updated_at` strictly after `since`, all of them for `None`.
    async fn fetch_updated_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuctionSnapshot>, SyncError>;
}

/// Calls `GET {base}/api/auctions?date=...` on the auction service.
#[derive(Clone)]
pub struct AuctionServiceHttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl AuctionServiceHttpClient {
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AuctionSource for AuctionServiceHttpClient {
    async fn fetch_updated_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuctionSnapshot>, SyncError> {
        let mut request = self.client.get(format!("{}/api/auctions", self.base_url));
        if let Some(since) = since {
            request = request.query(&[("date", since.to_rfc3339_opts(SecondsFormat::AutoSi, true))]);
        }
        Ok(request.send().await?.error_for_status()?.json().await?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Watermark the request was bounded by.
    pub watermark: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub upserted: usize,
}

pub struct CatchUpSynchronizer<S> {
    store: S,
    source: Arc<dyn AuctionSource>,
    retry_interval: Duration,
}

impl<S> CatchUpSynchronizer<S>
where
    S: SearchItemStore + Clone,
{
    pub fn new(store: S, source: Arc<dyn AuctionSource>, retry_interval: Duration) -> Self {
        Self {
            store,
            source,
            retry_interval,
        }
    }

    /// One watermark-bounded pull and merge.
    pub async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        let store = self.store.clone();
        let watermark = blocking(move || store.watermark()).await?;

        let snapshots = self.source.fetch_updated_since(watermark).await?;
        let fetched = snapshots.len();
        let items: Vec<SearchItem> = snapshots.into_iter().map(SearchItem::from).collect();

        let store = self.store.clone();
        let upserted = blocking(move || store.upsert_many(items)).await?;

        Ok(SyncReport {
            watermark,
            fetched,
            upserted,
        })
    }

    /// Retries [`sync_once`](Self::sync_once) until it succeeds. Returns `None`
    /// only when `shutdown` fires first.
    pub async fn run(&self, shutdown: &CancellationToken) -> Option<SyncReport> {
        let mut attempt = 1u32;
        loop {
            match self.sync_once().await {
                Ok(report) => {
                    log::info!(
                        "Catch-up complete: {} fetched, {} upserted (watermark {:?})",
                        report.fetched,
                        report.upserted,
                        report.watermark
                    );
                    return Some(report);
                }
                Err(e) => log::warn!(
                    "Catch-up attempt {} failed, retrying in {:?}: {}",
                    attempt,
                    self.retry_interval,
                    e
                ),
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use bigdecimal::BigDecimal;

    use super::*;
    use crate::domain::auction::fixtures::new_auction;
    use crate::domain::events::{BidPlaced, BidStatus};
    use crate::domain::ports::AuctionRepository;
    use crate::infrastructure::memory::{InMemoryAuctionStore, InMemorySearchStore};

    /// Serves from an auction store after failing `failures` times.
    struct Upstream {
        auctions: InMemoryAuctionStore,
        failures: AtomicUsize,
        requests: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl Upstream {
        fn new(auctions: InMemoryAuctionStore, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                auctions,
                failures: AtomicUsize::new(failures),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Option<DateTime<Utc>>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuctionSource for Upstream {
        async fn fetch_updated_since(
            &self,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<AuctionSnapshot>, SyncError> {
            self.requests.lock().unwrap().push(since);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DomainError::Internal("upstream not ready".to_string()).into());
            }
            Ok(self
                .auctions
                .updated_since(since)?
                .iter()
                .map(AuctionSnapshot::from)
                .collect())
        }
    }

    fn seeded(n: usize) -> InMemoryAuctionStore {
        let auctions = InMemoryAuctionStore::new();
        for _ in 0..n {
            auctions.create(new_auction()).unwrap();
        }
        auctions
    }

    #[tokio::test]
    async fn empty_store_gets_everything_then_nothing() {
        let auctions = seeded(3);
        let upstream = Upstream::new(auctions.clone(), 0);
        let store = InMemorySearchStore::new();
        let sync = CatchUpSynchronizer::new(store.clone(), upstream.clone(), Duration::from_millis(1));

        let first = sync.sync_once().await.unwrap();
        assert_eq!(first.watermark, None);
        assert_eq!((first.fetched, first.upserted), (3, 3));
        assert_eq!(store.count().unwrap(), 3);
        for auction in auctions.updated_since(None).unwrap() {
            let item = store.find_by_id(auction.id).unwrap().unwrap();
            assert_eq!(item.updated_at, auction.updated_at);
        }

        let second = sync.sync_once().await.unwrap();
        assert_eq!((second.fetched, second.upserted), (0, 0));
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(upstream.requests()[1], store.watermark().unwrap());
    }

    #[tokio::test]
    async fn later_run_pulls_only_newer_changes() {
        let auctions = seeded(2);
        let upstream = Upstream::new(auctions.clone(), 0);
        let store = InMemorySearchStore::new();
        let sync = CatchUpSynchronizer::new(store.clone(), upstream, Duration::from_millis(1));
        sync.sync_once().await.unwrap();

        let target = auctions.updated_since(None).unwrap()[0].id;
        auctions
            .apply_bid(&BidPlaced {
                id: uuid::Uuid::new_v4(),
                auction_id: target,
                bidder: "alice".to_string(),
                bid_time: Utc::now(),
                amount: BigDecimal::from(300),
                bid_status: BidStatus::Accepted,
            })
            .unwrap();

        let report = sync.sync_once().await.unwrap();
        assert_eq!((report.fetched, report.upserted), (1, 1));
        let item = store.find_by_id(target).unwrap().unwrap();
        assert_eq!(item.current_high_bid, Some(BigDecimal::from(300)));
    }

    #[tokio::test]
    async fn run_retries_until_upstream_answers() {
        let upstream = Upstream::new(seeded(1), 2);
        let store = InMemorySearchStore::new();
        let sync = CatchUpSynchronizer::new(store.clone(), upstream.clone(), Duration::from_millis(1));

        let report = sync.run(&CancellationToken::new()).await;

        assert_eq!(report.map(|r| r.fetched), Some(1));
        assert_eq!(upstream.requests().len(), 3);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn run_gives_up_only_on_shutdown() {
        let upstream = Upstream::new(seeded(1), usize::MAX);
        let sync = CatchUpSynchronizer::new(
            InMemorySearchStore::new(),
            upstream,
            Duration::from_secs(3600),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert_eq!(sync.run(&shutdown).await, None);
    }
}
