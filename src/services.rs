//! Process wiring: which background tasks and HTTP servers each service runs,
//! and how they are stopped.

use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::ServerHandle;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::auction_service::AuctionService;
use crate::bus::{self, BusError, MessageBus};
use crate::config::{Config, ConfigError};
use crate::consumer::auction::bid_endpoint;
use crate::consumer::search::search_endpoints;
use crate::consumer::ConsumerHost;
use crate::db::{create_pool, run_migrations};
use crate::domain::errors::DomainError;
use crate::domain::ports::{AuctionRepository, OutboxStore, SearchItemStore};
use crate::handlers::health::Readiness;
use crate::infrastructure::auction_repo::DieselAuctionRepository;
use crate::infrastructure::outbox_repo::DieselOutboxStore;
use crate::infrastructure::search_repo::DieselSearchRepository;
use crate::outbox::OutboxDispatcher;
use crate::sync::{AuctionServiceHttpClient, AuctionSource, CatchUpSynchronizer, SyncError};
use crate::{auction_server, search_server, AUCTION_MIGRATIONS, SEARCH_MIGRATIONS};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("database pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("storage: {0}")]
    Storage(#[from] DomainError),
    #[error("message bus: {0}")]
    Bus(#[from] BusError),
    #[error("auction service client: {0}")]
    Client(#[from] SyncError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A started service: its HTTP server and the background tasks beside it.
pub struct Running {
    server: ServerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    /// Stops the HTTP server gracefully and waits for the background tasks,
    /// which must already have been told to stop through their shutdown token.
    pub async fn stop(self) {
        self.server.stop(true).await;
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Background task failed: {}", e);
            }
        }
    }
}

/// Starts the system of record: HTTP API, outbox dispatcher and the
/// bid-placed consumer.
pub async fn start_auction_service<R, O>(
    config: &Config,
    repo: R,
    outbox: O,
    bus: Arc<dyn MessageBus>,
    listener: TcpListener,
    shutdown: &CancellationToken,
) -> Result<Running, StartupError>
where
    R: AuctionRepository + Clone,
    O: OutboxStore + Clone,
{
    let consumers = ConsumerHost::new(bus.clone())
        .endpoint(bid_endpoint(
            repo.clone(),
            config.redelivery,
            config.consumer_concurrency,
        ))
        .bind()
        .await?;

    let dispatcher = OutboxDispatcher::new(outbox, bus, config.dispatcher.clone());
    let service = AuctionService::new(Arc::new(repo)).with_dispatch_hint(dispatcher.waker());

    log::info!("Auction service listening on http://{}", listener.local_addr()?);
    let server = auction_server(service, listener)?;
    let handle = server.handle();

    let tasks = vec![
        tokio::spawn(dispatcher.run(shutdown.clone())),
        tokio::spawn(consumers.run(shutdown.clone())),
        actix_web::rt::spawn(async move {
            if let Err(e) = server.await {
                log::error!("Auction HTTP server failed: {}", e);
            }
        }),
    ];

    Ok(Running {
        server: handle,
        tasks,
    })
}

/// Starts the search read model. Queues are bound first so nothing published
/// during catch-up is lost; consumers only run once catch-up has succeeded,
/// which is also when the service reports ready.
pub async fn start_search_service<S>(
    config: &Config,
    store: S,
    source: Arc<dyn AuctionSource>,
    bus: Arc<dyn MessageBus>,
    listener: TcpListener,
    shutdown: &CancellationToken,
) -> Result<(Running, Readiness), StartupError>
where
    S: SearchItemStore + Clone,
{
    let consumers = ConsumerHost::new(bus)
        .endpoints(search_endpoints(
            store.clone(),
            config.redelivery,
            config.consumer_concurrency,
        ))
        .bind()
        .await?;

    let readiness = Readiness::new();
    log::info!("Search service listening on http://{}", listener.local_addr()?);
    let server = search_server(readiness.clone(), listener)?;
    let handle = server.handle();

    let synchronizer = CatchUpSynchronizer::new(store, source, config.catch_up_retry);
    let ready = readiness.clone();
    let token = shutdown.clone();
    let pipeline = tokio::spawn(async move {
        if synchronizer.run(&token).await.is_none() {
            log::info!("Search service stopped before catch-up completed");
            return;
        }
        ready.mark_ready();
        log::info!("Search service ready");
        consumers.run(token).await;
    });

    let tasks = vec![
        pipeline,
        actix_web::rt::spawn(async move {
            if let Err(e) = server.await {
                log::error!("Search HTTP server failed: {}", e);
            }
        }),
    ];

    Ok((
        Running {
            server: handle,
            tasks,
        },
        readiness,
    ))
}

/// Runs the configured services against Postgres until Ctrl-C.
pub async fn run(config: Config) -> Result<(), StartupError> {
    let bus = bus::connect(&config.bus)?;
    let shutdown = CancellationToken::new();
    let mut running = Vec::new();

    if config.role.runs_auction() {
        let url = config
            .auction_database_url
            .as_deref()
            .ok_or(ConfigError::Missing("AUCTION_DATABASE_URL"))?;
        let pool = create_pool(url)?;
        run_migrations(&pool, AUCTION_MIGRATIONS)?;
        let listener = TcpListener::bind((config.host.as_str(), config.auction_port))?;
        running.push(
            start_auction_service(
                &config,
                DieselAuctionRepository::new(pool.clone()),
                DieselOutboxStore::new(pool),
                bus.clone(),
                listener,
                &shutdown,
            )
            .await?,
        );
    }

    if config.role.runs_search() {
        let url = config
            .search_database_url
            .as_deref()
            .ok_or(ConfigError::Missing("SEARCH_DATABASE_URL"))?;
        let pool = create_pool(url)?;
        run_migrations(&pool, SEARCH_MIGRATIONS)?;
        let source = Arc::new(AuctionServiceHttpClient::new(&config.auction_service_url)?);
        let listener = TcpListener::bind((config.host.as_str(), config.search_port))?;
        let (search, _) = start_search_service(
            &config,
            DieselSearchRepository::new(pool),
            source,
            bus.clone(),
            listener,
            &shutdown,
        )
        .await?;
        running.push(search);
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    shutdown.cancel();
    for service in running {
        service.stop().await;
    }
    log::info!("Shutdown complete");
    Ok(())
}
