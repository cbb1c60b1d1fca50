//! Bot-simulation surface for load testing.
//!
//! These routes accept an explicit user id with no identity check, so they
//! are only served when `ENABLE_BOT_API` is set. Production deployments
//! leave the flag off and every request here 404s.

use actix_web::{HttpResponse, post, web};
use sqlx::PgPool;
use uuid::Uuid;

use crate::routes::APIError;
use crate::{
    EngineConfig, fanout::EventFanout, projection::Projection, store,
    time::TimeSource,
};

fn require_enabled(config: &EngineConfig) -> Result<(), APIError> {
    if config.enable_bot_api {
        Ok(())
    } else {
        Err(APIError::NotFound("not_found", "Not found".into()))
    }
}

#[tracing::instrument(skip(pool, config, time_source), ret)]
#[post("/create_user")]
pub async fn create_user(
    details: web::Json<payloads::requests::BotCreateUser>,
    pool: web::Data<PgPool>,
    config: web::Data<EngineConfig>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    require_enabled(&config)?;
    let user =
        store::create_user(&details.username, &pool, &time_source).await?;
    Ok(HttpResponse::Ok().json(payloads::responses::UserCreated {
        user_id: user.id,
        username: user.username,
    }))
}

#[tracing::instrument(skip(pool, config, time_source), ret)]
#[post("/deposit")]
pub async fn deposit(
    details: web::Json<payloads::requests::BotDeposit>,
    pool: web::Data<PgPool>,
    config: web::Data<EngineConfig>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    require_enabled(&config)?;
    // Each call is its own business event, so it gets a fresh reference id.
    let reference_id = format!("deposit-{}", Uuid::new_v4());
    store::deposit(
        &details.user_id,
        details.amount,
        &reference_id,
        &pool,
        &time_source,
    )
    .await?;
    let balance = store::get_balance(&details.user_id, &pool).await?;
    Ok(HttpResponse::Ok().json(balance))
}

#[tracing::instrument(skip(pool, fanout, projection, config, time_source))]
#[post("/place_bid")]
pub async fn place_bid(
    details: web::Json<payloads::requests::BotPlaceBid>,
    pool: web::Data<PgPool>,
    fanout: web::Data<EventFanout>,
    projection: web::Data<Projection>,
    config: web::Data<EngineConfig>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    require_enabled(&config)?;
    let bid = store::place_bid(
        &details.user_id,
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
