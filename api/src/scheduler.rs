//! Top-level orchestration of deadline-driven round progress.
//!
//! ```text
//!        round_duration
//!              v
//! |----------|----|----|  < auction completed once the last round closes
//!      ^     ^    ^         and remaining active bids are refunded
//!      |     |    round deadline passes; the sweeper closes the round,
//!      |     |    pays winners, then advances or finalizes
//!      |     auction started (round 0 opens)
//!      |
//! auction created
//! ```
//!
//! One sweep runs per tick. Each overdue round is claimed with a
//! transaction-scoped advisory lock so concurrent scheduler instances never
//! process the same auction twice; the actual work happens in its own
//! transaction, and failures are recorded with exponential backoff so a
//! broken auction cannot monopolize the sweeper.

use anyhow::Context;
use jiff_sqlx::ToSqlx;
use payloads::AuctionStatus;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time;

use crate::{
    EngineConfig, fanout::EventFanout, store, telemetry::log_error,
    time::TimeSource,
};

/// How long a FINALIZING auction may sit untouched before the sweeper
/// assumes its finalizer died and re-invokes finalization.
const FINALIZE_RECOVERY_WINDOW: jiff::SignedDuration =
    jiff::SignedDuration::from_secs(5 * 60);

pub struct Scheduler {
    pool: PgPool,
    time_source: TimeSource,
    fanout: EventFanout,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        fanout: EventFanout,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            time_source,
            fanout,
            config,
        }
    }

    pub async fn run(&self) {
        let mut interval =
            time::interval(Duration::from_millis(self.config.scheduler_tick_ms));
        loop {
            interval.tick().await;
            let _ = schedule_tick(
                &self.pool,
                &self.time_source,
                &self.fanout,
                &self.config,
            )
            .await
            .map_err(log_error);
        }
    }
}

/// Update state once right now.
#[tracing::instrument(skip_all)]
pub async fn schedule_tick(
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    // Close rounds whose deadline has passed.
    process_due_rounds(pool, time_source, fanout, config).await?;

    // Move auctions whose current round is closed but which have not yet
    // advanced or finalized (e.g. after a crash between the two steps).
    process_stalled_auctions(pool, time_source, fanout, config).await?;

    Ok(())
}

/// Startup recovery: one immediate sweep plus re-invocation of finalization
/// for FINALIZING auctions that went stale past the recovery window.
#[tracing::instrument(skip_all)]
pub async fn recover(
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let stale: Vec<store::Auction> = sqlx::query_as(
        "SELECT * FROM auctions
        WHERE status = 'finalizing' AND updated_at <= $1",
    )
    .bind((time_source.now() - FINALIZE_RECOVERY_WINDOW).to_sqlx())
    .fetch_all(pool)
    .await?;

    for auction in stale {
        tracing::info!("recovering stale finalization of auction {}", auction.id);
        let result = store::finalize_auction(
            &auction.id,
            config.finalize_batch_size,
            pool,
            time_source,
        )
        .await;
        match result {
            Ok(auction) => {
                fanout.emit_auction_update(auction).await;
                fanout.emit_auctions_list_update();
            }
            Err(e) => {
                // Leave it for the next sweep.
                log_error(anyhow::Error::from(e).context(format!(
                    "failed to recover finalization of auction {}",
                    auction.id
                )));
            }
        }
    }

    schedule_tick(pool, time_source, fanout, config).await
}

/// Process all overdue rounds sequentially. Advisory locks prevent
/// concurrent processing by multiple scheduler instances.
#[tracing::instrument(skip_all)]
async fn process_due_rounds(
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    loop {
        match process_next_due_round(pool, time_source, fanout, config).await {
            Ok(true) => continue, // Processed one, try for more
            Ok(false) => break,   // No more rounds to process
            Err(e) => {
                // Log error but continue to the next round
                tracing::error!("Failed to process due round: {:#}", e);
                continue;
            }
        }
    }
    Ok(())
}

/// Lock and process the next overdue round.
/// Returns Ok(true) if a round was processed, Ok(false) if none are due.
async fn process_next_due_round(
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<bool> {
    // This transaction is ONLY used to hold the advisory lock for
    // coordination. No other database operations attach to it.
    let mut coordination_tx = pool.begin().await?;

    let auction = match lock_next_auction_with_due_round(
        &mut coordination_tx,
        time_source,
    )
    .await?
    {
        Some(a) => a,
        None => return Ok(false),
    };

    let auction_id = auction.id;

    match step_auction(&auction, pool, time_source, fanout, config).await {
        Ok(()) => {
            clear_failure_tracking(&auction_id, pool).await?;
            coordination_tx.commit().await?;
            Ok(true)
        }
        Err(e) => {
            // Record the failure in its own transaction before releasing
            // the lock, so the backoff is visible to the next claimant.
            let _ = record_failure(&auction_id, pool, time_source)
                .await
                .context("Failed to record auction failure")
                .map_err(log_error);
            let _ = coordination_tx.commit().await;
            Err(e)
        }
    }
}

/// Claim one auction whose current round is past its deadline, oldest
/// deadline first, skipping auctions inside their failure backoff.
async fn lock_next_auction_with_due_round(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    time_source: &TimeSource,
) -> anyhow::Result<Option<store::Auction>> {
    // Exponential backoff: 5 seconds * 2^failure_count, exponent capped so
    // the worst case stays at a few minutes.
    sqlx::query_as::<_, store::Auction>(
        "SELECT auctions.* FROM auctions
        JOIN rounds ON rounds.auction_id = auctions.id
            AND rounds.round_index = auctions.current_round
        WHERE auctions.status = 'running'
            AND rounds.closed = false
            AND rounds.end_at <= $1
            AND (
                scheduler_failure_count = 0
                OR scheduler_last_failed_at IS NULL
                OR $1 > scheduler_last_failed_at +
                    INTERVAL '5 seconds' * POW(2, LEAST(scheduler_failure_count, 5))
            )
            AND pg_try_advisory_xact_lock(
                hashtextextended('round_close:' || auctions.id::text, 0)
            )
        ORDER BY rounds.end_at ASC
        LIMIT 1",
    )
    .bind(time_source.now().to_sqlx())
    .fetch_optional(&mut **tx)
    .await
    .map_err(Into::into)
}

/// Close the auction's current round, then advance or finalize.
#[tracing::instrument(skip_all, fields(auction_id = %auction.id))]
async fn step_auction(
    auction: &store::Auction,
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let closed = close_round_with_retries(auction, pool, time_source, config)
        .await
        .context("failed to close round")?;

    fanout
        .emit_round_closed(
            auction.id,
            closed.round.clone(),
            closed.winners.clone(),
        )
        .await;

    if closed.auction_exhausted() {
        let updated = store::finalize_auction(
            &auction.id,
            config.finalize_batch_size,
            pool,
            time_source,
        )
        .await
        .context("failed to finalize auction")?;
        fanout.emit_auction_update(updated).await;
        fanout.emit_auctions_list_update();
    } else {
        store::advance_round(&auction.id, pool, time_source)
            .await
            .context("failed to advance round")?;
        let updated = store::read_auction(&auction.id, pool).await?;
        fanout.emit_auction_update(updated).await;
    }

    Ok(())
}

/// Transient conflicts (two closers racing, bid/close row contention) are
/// absorbed inline; anything else goes to the backoff columns.
async fn close_round_with_retries(
    auction: &store::Auction,
    pool: &PgPool,
    time_source: &TimeSource,
    config: &EngineConfig,
) -> Result<store::ClosedRound, store::StoreError> {
    let mut attempt = 0;
    loop {
        match store::close_current_round(&auction.id, pool, time_source).await
        {
            Err(e)
                if e.is_retryable()
                    && attempt < config.scheduler_max_retries =>
            {
                attempt += 1;
                tracing::debug!(
                    "conflict closing round of {}, retry {attempt}: {e}",
                    auction.id
                );
                tokio::time::sleep(Duration::from_millis(
                    50 * attempt as u64,
                ))
                .await;
            }
            other => return other,
        }
    }
}

/// Process auctions that are RUNNING with a closed current round (crashed
/// between close and advance) or stuck in FINALIZING past the recovery
/// window.
#[tracing::instrument(skip_all)]
async fn process_stalled_auctions(
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    loop {
        let mut coordination_tx = pool.begin().await?;

        let auction: Option<store::Auction> = sqlx::query_as(
            "SELECT auctions.* FROM auctions
            WHERE (
                (
                    status = 'running'
                    AND EXISTS (
                        SELECT 1 FROM rounds
                        WHERE auction_id = auctions.id
                            AND round_index = auctions.current_round
                            AND closed
                    )
                )
                OR (status = 'finalizing' AND updated_at <= $2)
            )
            AND (
                scheduler_failure_count = 0
                OR scheduler_last_failed_at IS NULL
                OR $1 > scheduler_last_failed_at +
                    INTERVAL '5 seconds' * POW(2, LEAST(scheduler_failure_count, 5))
            )
            AND pg_try_advisory_xact_lock(
                hashtextextended('round_close:' || auctions.id::text, 0)
            )
            LIMIT 1",
        )
        .bind(time_source.now().to_sqlx())
        .bind((time_source.now() - FINALIZE_RECOVERY_WINDOW).to_sqlx())
        .fetch_optional(&mut *coordination_tx)
        .await?;

        let Some(auction) = auction else { break };

        let result =
            resume_auction(&auction, pool, time_source, fanout, config).await;
        match result {
            Ok(()) => {
                clear_failure_tracking(&auction.id, pool).await?;
                coordination_tx.commit().await?;
            }
            Err(e) => {
                let _ = record_failure(&auction.id, pool, time_source)
                    .await
                    .map_err(log_error);
                let _ = coordination_tx.commit().await;
                tracing::error!(
                    "Failed to resume auction {}: {:#}",
                    auction.id,
                    e
                );
            }
        }
    }
    Ok(())
}

async fn resume_auction(
    auction: &store::Auction,
    pool: &PgPool,
    time_source: &TimeSource,
    fanout: &EventFanout,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let awarded: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(winners_count), 0)
        FROM rounds WHERE auction_id = $1 AND closed",
    )
    .bind(auction.id)
    .fetch_one(pool)
    .await?;

    let exhausted = auction.status == AuctionStatus::Finalizing
        || auction.is_last_round()
        || awarded >= auction.total_gifts as i64;

    if exhausted {
        let updated = store::finalize_auction(
            &auction.id,
            config.finalize_batch_size,
            pool,
            time_source,
        )
        .await
        .context("failed to finalize stalled auction")?;
        fanout.emit_auction_update(updated).await;
        fanout.emit_auctions_list_update();
    } else {
        store::advance_round(&auction.id, pool, time_source)
            .await
            .context("failed to advance stalled auction")?;
        let updated = store::read_auction(&auction.id, pool).await?;
        fanout.emit_auction_update(updated).await;
    }
    Ok(())
}

/// Record a failure so the backoff interval applies to the next claim.
async fn record_failure(
    auction_id: &payloads::AuctionId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE auctions
        SET scheduler_failure_count = scheduler_failure_count + 1,
            scheduler_last_failed_at = $1
        WHERE id = $2",
    )
    .bind(time_source.now().to_sqlx())
    .bind(auction_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn clear_failure_tracking(
    auction_id: &payloads::AuctionId,
    pool: &PgPool,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE auctions
        SET scheduler_failure_count = 0, scheduler_last_failed_at = NULL
        WHERE id = $1 AND scheduler_failure_count <> 0",
    )
    .bind(auction_id)
    .execute(pool)
    .await?;
    Ok(())
}
