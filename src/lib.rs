pub mod application;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod db;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod infrastructure;
pub mod outbox;
pub mod schema;
pub mod services;
pub mod sync;

use std::net::TcpListener;

use actix_web::{middleware::Logger, web, App, HttpServer};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};

use application::auction_service::AuctionService;
use handlers::health::Readiness;

pub use db::{create_pool, run_migrations, DbPool};

/// Schema of the system of record: auctions and the outbox.
pub const AUCTION_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/auction");
/// Schema of the search read model.
pub const SEARCH_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/search");

/// Build the auction service's actix-web `Server` on an already bound listener.
///
/// The caller is responsible for `.await`-ing (or spawning) the returned
/// server and for stopping it through its handle; OS signals are not hooked.
pub fn auction_server(
    service: AuctionService,
    listener: TcpListener,
) -> std::io::Result<actix_web::dev::Server> {
    let service = web::Data::new(service);
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .wrap(Logger::default())
            .configure(handlers::auctions::configure)
            .route("/api-docs/openapi.json", web::get().to(handlers::openapi_json))
    })
    .disable_signals()
    .listen(listener)?
    .run())
}

/// Build the search service's actix-web `Server`: liveness and readiness.
pub fn search_server(
    readiness: Readiness,
    listener: TcpListener,
) -> std::io::Result<actix_web::dev::Server> {
    let readiness = web::Data::new(readiness);
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(readiness.clone())
            .wrap(Logger::default())
            .configure(handlers::health::configure)
    })
    .disable_signals()
    .listen(listener)?
    .run())
}
