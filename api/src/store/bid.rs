//! Bid placement.
//!
//! One active bid per (user, auction). A fresh bid locks its full amount; an
//! increase locks only the delta, under a strictly-increasing amount rule.
//! Concurrent placements by the same user serialize on the user row lock
//! taken by the ledger; races with round closure resolve through the
//! status-conditional bid update (a bid that just left ACTIVE can no longer
//! be modified, and the whole transaction rolls back).

use std::time::Duration;

use jiff_sqlx::ToSqlx;
use payloads::{AuctionId, AuctionStatus, UserId, responses};
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::{Auction, Bid, Round, StoreError, ledger};
use crate::time::TimeSource;

/// Place or increase a bid, retrying bounded times on conflict.
#[tracing::instrument(skip(pool, time_source))]
pub async fn place_bid(
    user_id: &UserId,
    auction_id: &AuctionId,
    amount: Decimal,
    max_retries: u32,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Bid, StoreError> {
    let mut attempt = 0;
    loop {
        match place_bid_once(user_id, auction_id, amount, pool, time_source)
            .await
        {
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                tracing::debug!(
                    "bid conflict for user {user_id}, retry {attempt}: {e}"
                );
                tokio::time::sleep(backoff_with_jitter(attempt)).await;
            }
            other => return other,
        }
    }
}

/// Exponential backoff with jitter so colliding bidders don't re-collide.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 25u64 * 2u64.pow(attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..25);
    Duration::from_millis(base + jitter)
}

async fn place_bid_once(
    user_id: &UserId,
    auction_id: &AuctionId,
    amount: Decimal,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Bid, StoreError> {
    let mut tx = pool.begin().await?;

    let auction = sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions WHERE id = $1",
    )
    .bind(auction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::AuctionNotFound)?;

    if auction.status != AuctionStatus::Running {
        return Err(StoreError::AuctionNotRunning);
    }

    let round = sqlx::query_as::<_, Round>(
        "SELECT * FROM rounds WHERE auction_id = $1 AND round_index = $2",
    )
    .bind(auction_id)
    .bind(auction.current_round)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::RoundNotFound)?;

    let now = time_source.now();
    if round.closed || now >= round.end_at {
        return Err(StoreError::RoundExpired);
    }

    if amount < auction.min_bid {
        return Err(StoreError::BidTooLow);
    }

    let existing = sqlx::query_as::<_, Bid>(
        "SELECT * FROM bids
        WHERE auction_id = $1 AND user_id = $2 AND status = 'active'
        FOR UPDATE",
    )
    .bind(auction_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?;

    let bid = match existing {
        None => {
            let bid = sqlx::query_as::<_, Bid>(
                "INSERT INTO bids (
                    auction_id,
                    user_id,
                    amount,
                    status,
                    round_index,
                    created_at,
                    updated_at
                ) VALUES ($1, $2, $3, 'active', $4, $5, $5)
                RETURNING *",
            )
            .bind(auction_id)
            .bind(user_id)
            .bind(amount)
            .bind(auction.current_round)
            .bind(now.to_sqlx())
            .fetch_one(&mut *tx)
            .await
            .map_err(as_conflict)?;

            ledger::lock_tx(
                user_id,
                amount,
                &bid.id.to_string(),
                &mut tx,
                time_source,
            )
            .await?;
            bid
        }
        Some(existing) => {
            if amount <= existing.amount {
                return Err(StoreError::MustIncrease);
            }
            let delta = amount - existing.amount;

            // Flip the row before moving money so a bid that just won or
            // got refunded aborts the whole attempt.
            let bid = sqlx::query_as::<_, Bid>(
                "UPDATE bids
                SET amount = $2,
                    round_index = $3,
                    increases = increases + 1,
                    updated_at = $4
                WHERE id = $1 AND status = 'active'
                RETURNING *",
            )
            .bind(existing.id)
            .bind(amount)
            .bind(auction.current_round)
            .bind(now.to_sqlx())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::RoundExpired)?;

            // Delta-indexed reference id keeps each increase idempotent
            // across retries without colliding with the original lock.
            let reference_id =
                format!("{}#delta-{}", bid.id, bid.increases);
            ledger::lock_tx(
                user_id,
                delta,
                &reference_id,
                &mut tx,
                time_source,
            )
            .await?;
            bid
        }
    };

    tx.commit().await?;
    Ok(bid.into_response())
}

/// Two users racing the partial unique active-bid index surface as a
/// retryable conflict rather than a generic constraint error.
fn as_conflict(e: sqlx::Error) -> StoreError {
    match StoreError::from(e) {
        StoreError::NotUnique(e) => StoreError::Conflict(e),
        other => other,
    }
}

pub async fn find_active_bid(
    auction_id: &AuctionId,
    user_id: &UserId,
    pool: &PgPool,
) -> Result<Option<Bid>, StoreError> {
    Ok(sqlx::query_as::<_, Bid>(
        "SELECT * FROM bids
        WHERE auction_id = $1 AND user_id = $2 AND status = 'active'",
    )
    .bind(auction_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?)
}

/// Leading active bids with usernames, served straight off the
/// (auction_id, status, amount DESC, created_at ASC, id ASC) index.
pub async fn top_bids(
    auction_id: &AuctionId,
    limit: i64,
    pool: &PgPool,
) -> Result<Vec<responses::TopBid>, StoreError> {
    Ok(sqlx::query_as::<_, responses::TopBid>(
        "SELECT b.user_id, u.username, b.amount, b.created_at
        FROM bids b
        JOIN users u ON b.user_id = u.id
        WHERE b.auction_id = $1 AND b.status = 'active'
        ORDER BY b.amount DESC, b.created_at ASC, b.id ASC
        LIMIT $2",
    )
    .bind(auction_id)
    .bind(limit)
    .fetch_all(pool)
    .await?)
}
