use actix_web::{HttpRequest, HttpResponse, get, post, web};
use payloads::AuctionId;
use sqlx::PgPool;

use crate::routes::{APIError, get_caller_id, get_optional_caller_id};
use crate::{
    EngineConfig, fanout::EventFanout, projection::Projection, store,
    time::TimeSource,
};

#[tracing::instrument(skip(req, pool, fanout, time_source), ret)]
#[post("/create_auction")]
pub async fn create_auction(
    req: HttpRequest,
    details: web::Json<payloads::requests::CreateAuction>,
    pool: web::Data<PgPool>,
    fanout: web::Data<EventFanout>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let caller_id = get_caller_id(&req)?;
    let auction =
        store::create_auction(&details, &caller_id, &pool, &time_source)
            .await?;
    fanout.emit_auctions_list_update();
    Ok(HttpResponse::Ok().json(auction.auction_id))
}

#[tracing::instrument(
    skip(req, pool, fanout, projection, time_source),
    ret
)]
#[post("/start_auction")]
pub async fn start_auction(
    req: HttpRequest,
    auction_id: web::Json<AuctionId>,
    pool: web::Data<PgPool>,
    fanout: web::Data<EventFanout>,
    projection: web::Data<Projection>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let caller_id = get_caller_id(&req)?;
    let auction =
        store::start_auction(&auction_id, &caller_id, &pool, &time_source)
            .await?;
    projection.invalidate(&auction_id);
    fanout.emit_auction_update(auction.clone()).await;
    fanout.emit_auctions_list_update();
    Ok(HttpResponse::Ok().json(auction))
}

#[tracing::instrument(
    skip(req, pool, fanout, projection, config, time_source)
)]
#[post("/place_bid")]
pub async fn place_bid(
    req: HttpRequest,
    details: web::Json<payloads::requests::PlaceBid>,
    pool: web::Data<PgPool>,
    fanout: web::Data<EventFanout>,
    projection: web::Data<Projection>,
    config: web::Data<EngineConfig>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let caller_id = get_caller_id(&req)?;
    let bid = store::place_bid(
        &caller_id,
        &details.auction_id,
        details.amount,
        config.scheduler_max_retries,
        &pool,
        &time_source,
    )
    .await?;
    projection.invalidate(&details.auction_id);
    fanout.enqueue_bid_update(details.auction_id, bid.clone());
    Ok(HttpResponse::Ok().json(bid))
}

#[tracing::instrument(skip(pool), ret)]
#[post("/auction")]
pub async fn get_auction(
    auction_id: web::Json<AuctionId>,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let auction = store::read_auction(&auction_id, &pool).await?;
    Ok(HttpResponse::Ok().json(auction))
}

#[tracing::instrument(skip(pool))]
#[get("/auctions")]
pub async fn list_auctions(
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let auctions = store::list_auctions(&pool).await?;
    Ok(HttpResponse::Ok().json(auctions))
}

#[tracing::instrument(skip(pool))]
#[post("/auction_rounds")]
pub async fn list_auction_rounds(
    auction_id: web::Json<AuctionId>,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let rounds = store::list_rounds(&auction_id, &pool).await?;
    Ok(HttpResponse::Ok().json(rounds))
}

#[tracing::instrument(skip(req, projection))]
#[post("/dashboard")]
pub async fn get_dashboard(
    req: HttpRequest,
    details: web::Json<payloads::requests::GetDashboard>,
    projection: web::Data<Projection>,
) -> Result<HttpResponse, APIError> {
    let viewer = get_optional_caller_id(&req);
    let dashboard = projection
        .get_dashboard(&details.auction_id, viewer.as_ref())
        .await?;
    Ok(HttpResponse::Ok().json(dashboard))
}

#[tracing::instrument(skip(req, pool), ret)]
#[get("/balance")]
pub async fn get_balance(
    req: HttpRequest,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let caller_id = get_caller_id(&req)?;
    let balance = store::get_balance(&caller_id, &pool).await?;
    Ok(HttpResponse::Ok().json(balance))
}
