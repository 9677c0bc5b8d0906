pub mod auctions;
pub mod health;

use utoipa::OpenApi;

use crate::domain::auction::{AuctionSnapshot, AuctionStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        auctions::list_auctions,
        auctions::get_auction,
        auctions::create_auction,
        auctions::update_auction,
        auctions::delete_auction,
    ),
    components(schemas(
        AuctionSnapshot,
        AuctionStatus,
        auctions::CreateAuctionRequest,
        auctions::UpdateAuctionRequest,
    )),
    tags((name = "auctions", description = "Auction system of record"))
)]
pub struct ApiDoc;

pub async fn openapi_json() -> actix_web::HttpResponse {
    actix_web::HttpResponse::Ok().json(ApiDoc::openapi())
}
