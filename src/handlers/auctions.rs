use actix_web::{web, HttpResponse};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::application::auction_service::AuctionService;
use crate::domain::auction::{AuctionSnapshot, Item, ItemChanges, NewAuction};
use crate::errors::AppError;

// ── Request DTOs ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuctionRequest {
    pub seller: String,
    /// Decimal price as a string to avoid floating-point issues, e.g. "20000.00"
    pub reserve_price: String,
    pub auction_end: DateTime<Utc>,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    #[serde(default)]
    pub image_url: String,
}

impl TryFrom<CreateAuctionRequest> for NewAuction {
    type Error = AppError;

    fn try_from(body: CreateAuctionRequest) -> Result<Self, Self::Error> {
        let reserve_price = BigDecimal::from_str(&body.reserve_price).map_err(|e| {
            AppError::BadRequest(format!(
                "Invalid reservePrice '{}': {}",
                body.reserve_price, e
            ))
        })?;
        Ok(NewAuction {
            seller: body.seller,
            reserve_price,
            auction_end: body.auction_end,
            item: Item {
                make: body.make,
                model: body.model,
                year: body.year,
                color: body.color,
                mileage: body.mileage,
                image_url: body.image_url,
            },
        })
    }
}

/// Omitted fields keep their stored value.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAuctionRequest {
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub mileage: Option<i32>,
    pub year: Option<i32>,
}

impl From<UpdateAuctionRequest> for ItemChanges {
    fn from(body: UpdateAuctionRequest) -> Self {
        ItemChanges {
            make: body.make,
            model: body.model,
            color: body.color,
            mileage: body.mileage,
            year: body.year,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UpdatedSinceParams {
    /// RFC 3339 timestamp; only auctions updated strictly after it are returned.
    pub date: Option<DateTime<Utc>>,
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET /api/auctions
///
/// Pull endpoint used by read models to catch up. Rows come back ordered by
/// `(updatedAt, id)`.
#[utoipa::path(
    get,
    path = "/api/auctions",
    params(UpdatedSinceParams),
    responses(
        (status = 200, description = "Auctions changed after `date`", body = [AuctionSnapshot]),
        (status = 400, description = "Malformed date"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "auctions"
)]
pub async fn list_auctions(
    service: web::Data<AuctionService>,
    query: web::Query<UpdatedSinceParams>,
) -> Result<HttpResponse, AppError> {
    let since = query.into_inner().date;

    let auctions = web::block(move || service.auctions_updated_since(since)).await??;

    Ok(HttpResponse::Ok().json(auctions))
}

/// GET /api/auctions/{id}
#[utoipa::path(
    get,
    path = "/api/auctions/{id}",
    params(
        ("id" = Uuid, Path, description = "Auction UUID"),
    ),
    responses(
        (status = 200, description = "Auction found", body = AuctionSnapshot),
        (status = 404, description = "Auction not found"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "auctions"
)]
pub async fn get_auction(
    service: web::Data<AuctionService>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();

    let auction = web::block(move || service.get_auction(id)).await??;

    Ok(HttpResponse::Ok().json(auction))
}

/// POST /api/auctions
///
/// The auction row and its `AuctionCreated` outbox entry commit together.
#[utoipa::path(
    post,
    path = "/api/auctions",
    request_body = CreateAuctionRequest,
    responses(
        (status = 201, description = "Auction created", body = AuctionSnapshot),
        (status = 400, description = "Invalid input"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "auctions"
)]
pub async fn create_auction(
    service: web::Data<AuctionService>,
    body: web::Json<CreateAuctionRequest>,
) -> Result<HttpResponse, AppError> {
    let input = NewAuction::try_from(body.into_inner())?;

    let auction = web::block(move || service.create_auction(input)).await??;

    Ok(HttpResponse::Created().json(AuctionSnapshot::from(&auction)))
}

/// PUT /api/auctions/{id}
#[utoipa::path(
    put,
    path = "/api/auctions/{id}",
    params(
        ("id" = Uuid, Path, description = "Auction UUID"),
    ),
    request_body = UpdateAuctionRequest,
    responses(
        (status = 200, description = "Auction updated", body = AuctionSnapshot),
        (status = 400, description = "Invalid input"),
        (status = 404, description = "Auction not found"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "auctions"
)]
pub async fn update_auction(
    service: web::Data<AuctionService>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateAuctionRequest>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let changes = ItemChanges::from(body.into_inner());

    let auction = web::block(move || service.update_auction(id, changes)).await??;

    Ok(HttpResponse::Ok().json(AuctionSnapshot::from(&auction)))
}

/// DELETE /api/auctions/{id}
#[utoipa::path(
    delete,
    path = "/api/auctions/{id}",
    params(
        ("id" = Uuid, Path, description = "Auction UUID"),
    ),
    responses(
        (status = 204, description = "Auction deleted"),
        (status = 404, description = "Auction not found"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "auctions"
)]
pub async fn delete_auction(
    service: web::Data<AuctionService>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();

    web::block(move || service.delete_auction(id)).await??;

    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auctions")
            .route("", web::get().to(list_auctions))
            .route("", web::post().to(create_auction))
            .route("/{id}", web::get().to(get_auction))
            .route("/{id}", web::put().to(update_auction))
            .route("/{id}", web::delete().to(delete_auction)),
    );
}
