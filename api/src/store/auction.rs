//! Auction lifecycle: creation, the round state machine, winner selection,
//! carry-over, and finalization.
//!
//! ```text
//! CREATED --start--> RUNNING --close[last]--> FINALIZING --refunds--> COMPLETED
//!                       |
//!                       +--close[non-last]--> advance --> RUNNING
//! ```
//!
//! Transitions are guarded by the current status and are idempotent:
//! re-entering a transition for an already-advanced auction returns the
//! current state without side effects, which is what lets the scheduler
//! retry freely after partial failures.

use jiff::Timestamp;
use jiff_sqlx::ToSqlx;
use payloads::{
    AuctionId, AuctionStatus, BidId, UserId, requests, responses,
};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use super::{Auction, Bid, Round, StoreError, ledger};
use crate::time::TimeSource;

pub async fn create_auction(
    details: &requests::CreateAuction,
    creator_id: &UserId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Auction, StoreError> {
    let validation = details.params.validate();
    if let Some(message) = validation.error_message() {
        return Err(StoreError::InvalidInput(message));
    }

    // The gift must exist and the creator must be a known user.
    super::read_gift(&details.gift_id, pool).await?;
    super::read_user(creator_id, pool).await?;

    let auction = sqlx::query_as::<_, Auction>(
        "INSERT INTO auctions (
            gift_id,
            creator_id,
            status,
            total_gifts,
            total_rounds,
            current_round,
            round_duration_ms,
            min_bid,
            created_at,
            updated_at
        ) VALUES ($1, $2, 'created', $3, $4, 0, $5, $6, $7, $7)
        RETURNING *",
    )
    .bind(details.gift_id)
    .bind(creator_id)
    .bind(details.params.total_gifts)
    .bind(details.params.total_rounds)
    .bind(details.params.round_duration_ms)
    .bind(details.params.min_bid)
    .bind(time_source.now().to_sqlx())
    .fetch_one(pool)
    .await?;

    Ok(auction.into_response())
}

pub async fn read_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<responses::Auction, StoreError> {
    Ok(read_auction_row(auction_id, pool).await?.into_response())
}

pub(crate) async fn read_auction_row(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<Auction, StoreError> {
    sqlx::query_as::<_, Auction>("SELECT * FROM auctions WHERE id = $1")
        .bind(auction_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::AuctionNotFound)
}

pub async fn list_auctions(
    pool: &PgPool,
) -> Result<Vec<responses::Auction>, StoreError> {
    let auctions = sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(auctions.into_iter().map(Auction::into_response).collect())
}

/// Start a CREATED auction: open round 0 and move to RUNNING.
///
/// Already-started auctions are returned as-is.
#[tracing::instrument(skip(pool, time_source))]
pub async fn start_auction(
    auction_id: &AuctionId,
    caller_id: &UserId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Auction, StoreError> {
    let mut tx = pool.begin().await?;

    let auction = sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions WHERE id = $1 FOR UPDATE",
    )
    .bind(auction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::AuctionNotFound)?;

    if auction.creator_id != *caller_id {
        return Err(StoreError::NotCreator);
    }
    if auction.status != AuctionStatus::Created {
        return Ok(auction.into_response());
    }

    let now = time_source.now();
    let end_at = round_end(now, auction.round_duration_ms);

    sqlx::query(
        "INSERT INTO rounds (auction_id, round_index, start_at, end_at)
        VALUES ($1, 0, $2, $3)",
    )
    .bind(auction_id)
    .bind(now.to_sqlx())
    .bind(end_at.to_sqlx())
    .execute(&mut *tx)
    .await?;

    let auction = sqlx::query_as::<_, Auction>(
        "UPDATE auctions
        SET status = 'running', current_round = 0, started_at = $2,
            updated_at = $2
        WHERE id = $1
        RETURNING *",
    )
    .bind(auction_id)
    .bind(now.to_sqlx())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(auction.into_response())
}

fn round_end(start: Timestamp, duration_ms: i64) -> Timestamp {
    start + jiff::SignedDuration::from_millis(duration_ms)
}

/// Number of gifts awarded in the given round.
///
/// Non-last rounds pace the inventory evenly (rounded up) but never exceed
/// what is left; the last round takes everything remaining. A non-positive
/// remainder means the round closes with zero winners.
pub fn gifts_this_round(
    total_gifts: i32,
    total_rounds: i32,
    round_index: i32,
    already_awarded: i32,
) -> i32 {
    let remaining = total_gifts - already_awarded;
    if remaining <= 0 {
        return 0;
    }
    if round_index >= total_rounds - 1 {
        return remaining;
    }
    let per_round = (total_gifts + total_rounds - 1) / total_rounds;
    per_round.min(remaining)
}

/// Snapshot handed back by [`close_current_round`]; enough for the
/// scheduler to decide between advancing and finalizing, and for the
/// fan-out to publish the result.
#[derive(Debug, Clone)]
pub struct ClosedRound {
    pub round: responses::Round,
    pub winners: Vec<responses::RoundWinner>,
    /// Total awarded across all closed rounds, including this one.
    pub already_awarded: i32,
    pub total_gifts: i32,
    pub was_last_round: bool,
}

impl ClosedRound {
    /// The auction has nothing left to play for.
    pub fn auction_exhausted(&self) -> bool {
        self.was_last_round || self.already_awarded >= self.total_gifts
    }
}

/// Close the auction's current round: pick winners deterministically, pay
/// them out, and seal the round.
///
/// Safe to race: a concurrent attempt finds the round already closed and
/// returns the recorded snapshot without side effects.
#[tracing::instrument(skip(pool, time_source))]
pub async fn close_current_round(
    auction_id: &AuctionId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<ClosedRound, StoreError> {
    let mut tx = pool.begin().await?;

    let auction = sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions WHERE id = $1 FOR UPDATE",
    )
    .bind(auction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::AuctionNotFound)?;

    if auction.status != AuctionStatus::Running {
        return Err(StoreError::InvalidState(
            "only a running auction has a round to close",
        ));
    }

    let round = sqlx::query_as::<_, Round>(
        "SELECT * FROM rounds
        WHERE auction_id = $1 AND round_index = $2
        FOR UPDATE",
    )
    .bind(auction_id)
    .bind(auction.current_round)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::RoundNotFound)?;

    if round.closed {
        let snapshot = closed_round_snapshot(&auction, &round, &mut tx).await?;
        tx.commit().await?;
        return Ok(snapshot);
    }

    let already_awarded = awarded_so_far(auction_id, &mut tx).await?;
    let quota = gifts_this_round(
        auction.total_gifts,
        auction.total_rounds,
        auction.current_round,
        already_awarded,
    );

    let now = time_source.now();
    let mut winners_count = 0;

    if quota > 0 {
        // Deterministic top-K: (amount DESC, created_at ASC, id ASC). The
        // trailing id key makes the order total even for equal
        // (amount, created_at) pairs.
        let candidates: Vec<BidId> = sqlx::query_scalar(
            "SELECT id FROM bids
            WHERE auction_id = $1 AND status = 'active'
            ORDER BY amount DESC, created_at ASC, id ASC
            LIMIT $2",
        )
        .bind(auction_id)
        .bind(quota as i64)
        .fetch_all(&mut *tx)
        .await?;

        for bid_id in candidates {
            // Conditional flip: bids that left ACTIVE since selection are
            // skipped, and the returned amount is the one actually locked.
            let flipped = sqlx::query_as::<_, Bid>(
                "UPDATE bids
                SET status = 'won', won_in_round_index = $2, updated_at = $3
                WHERE id = $1 AND status = 'active'
                RETURNING *",
            )
            .bind(bid_id)
            .bind(auction.current_round)
            .bind(now.to_sqlx())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(bid) = flipped else { continue };

            ledger::payout_tx(
                &bid.user_id,
                bid.amount,
                &bid.id.to_string(),
                &mut tx,
                time_source,
            )
            .await?;
            winners_count += 1;
        }
    }

    let round = sqlx::query_as::<_, Round>(
        "UPDATE rounds
        SET closed = true, winners_count = $2, closed_at = $3
        WHERE id = $1
        RETURNING *",
    )
    .bind(round.id)
    .bind(winners_count)
    .bind(now.to_sqlx())
    .fetch_one(&mut *tx)
    .await?;

    tracing::info!(
        "closed round {} of auction {} with {} winner(s)",
        round.round_index,
        auction_id,
        winners_count
    );

    let snapshot = closed_round_snapshot(&auction, &round, &mut tx).await?;
    tx.commit().await?;
    Ok(snapshot)
}

async fn closed_round_snapshot(
    auction: &Auction,
    round: &Round,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<ClosedRound, StoreError> {
    let winners =
        round_winners(&auction.id, round.round_index, &mut **tx).await?;
    let already_awarded = awarded_so_far(&auction.id, tx).await?;
    Ok(ClosedRound {
        round: round.clone().into_response(),
        winners,
        already_awarded,
        total_gifts: auction.total_gifts,
        was_last_round: round.round_index + 1 >= auction.total_rounds,
    })
}

async fn awarded_so_far(
    auction_id: &AuctionId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<i32, StoreError> {
    let awarded: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(winners_count), 0)
        FROM rounds
        WHERE auction_id = $1 AND closed",
    )
    .bind(auction_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(awarded as i32)
}

#[derive(Debug, sqlx::FromRow)]
struct WinnerRow {
    user_id: UserId,
    username: String,
    bid_amount: Decimal,
    #[sqlx(try_from = "jiff_sqlx::Timestamp")]
    won_at: Timestamp,
    placed_in_round: i32,
}

async fn round_winners(
    auction_id: &AuctionId,
    round_index: i32,
    executor: impl sqlx::PgExecutor<'_>,
) -> Result<Vec<responses::RoundWinner>, StoreError> {
    // placed_in_round is reconstructed from the bid's placement instant:
    // the round whose window was open when the bid was created (the same
    // instant as its first ledger lock).
    Ok(sqlx::query_as::<_, WinnerRow>(
        "SELECT
            b.user_id,
            u.username,
            b.amount AS bid_amount,
            b.updated_at AS won_at,
            COALESCE((
                SELECT r.round_index FROM rounds r
                WHERE r.auction_id = b.auction_id
                    AND r.start_at <= b.created_at
                ORDER BY r.start_at DESC
                LIMIT 1
            ), 0) AS placed_in_round
        FROM bids b
        JOIN users u ON b.user_id = u.id
        WHERE b.auction_id = $1 AND b.won_in_round_index = $2
        ORDER BY b.amount DESC, b.created_at ASC, b.id ASC",
    )
    .bind(auction_id)
    .bind(round_index)
    .fetch_all(executor)
    .await?
    .into_iter()
    .map(|row| responses::RoundWinner {
        user_id: row.user_id,
        username: row.username,
        bid_amount: row.bid_amount,
        won_at: row.won_at,
        placed_in_round: row.placed_in_round,
    })
    .collect())
}

/// Carry still-active bids into the next round and open it.
///
/// Carry-over touches only `round_index`: amounts, statuses, and locked
/// balances are preserved.
#[tracing::instrument(skip(pool, time_source))]
pub async fn advance_round(
    auction_id: &AuctionId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Round, StoreError> {
    let mut tx = pool.begin().await?;

    let auction = sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions WHERE id = $1 FOR UPDATE",
    )
    .bind(auction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::AuctionNotFound)?;

    if auction.status != AuctionStatus::Running {
        return Err(StoreError::InvalidState(
            "only a running auction can advance",
        ));
    }
    if auction.is_last_round() {
        return Err(StoreError::InvalidState(
            "the last round cannot be advanced past",
        ));
    }

    let current_closed: bool = sqlx::query_scalar(
        "SELECT closed FROM rounds
        WHERE auction_id = $1 AND round_index = $2",
    )
    .bind(auction_id)
    .bind(auction.current_round)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::RoundNotFound)?;

    if !current_closed {
        return Err(StoreError::InvalidState(
            "close the current round before advancing",
        ));
    }

    let next_index = auction.current_round + 1;
    let now = time_source.now();

    let carried = sqlx::query(
        "UPDATE bids
        SET round_index = $2, updated_at = $3
        WHERE auction_id = $1 AND status = 'active'",
    )
    .bind(auction_id)
    .bind(next_index)
    .bind(now.to_sqlx())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let round = sqlx::query_as::<_, Round>(
        "INSERT INTO rounds (auction_id, round_index, start_at, end_at)
        VALUES ($1, $2, $3, $4)
        RETURNING *",
    )
    .bind(auction_id)
    .bind(next_index)
    .bind(now.to_sqlx())
    .bind(round_end(now, auction.round_duration_ms).to_sqlx())
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE auctions
        SET current_round = $2, updated_at = $3
        WHERE id = $1",
    )
    .bind(auction_id)
    .bind(next_index)
    .bind(now.to_sqlx())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        "advanced auction {} to round {} carrying {} bid(s)",
        auction_id,
        next_index,
        carried
    );

    Ok(round.into_response())
}

/// Drive the auction to COMPLETED: close the current round if it is still
/// open, move to FINALIZING, refund every remaining active bid in bounded
/// batches, then seal the auction.
///
/// Idempotent and crash-resumable. Each refund batch commits on its own, so
/// a crash mid-finalization leaves already-refunded bids terminal; the next
/// invocation only touches what is left, and the per-bid refund reference
/// id keeps the ledger from ever double-crediting.
#[tracing::instrument(skip(pool, time_source))]
pub async fn finalize_auction(
    auction_id: &AuctionId,
    batch_size: i64,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Auction, StoreError> {
    let auction = read_auction_row(auction_id, pool).await?;

    match auction.status {
        AuctionStatus::Created => {
            return Err(StoreError::InvalidState(
                "an unstarted auction cannot be finalized",
            ));
        }
        AuctionStatus::Completed => return Ok(auction.into_response()),
        AuctionStatus::Running => {
            let round_closed: bool = sqlx::query_scalar(
                "SELECT closed FROM rounds
                WHERE auction_id = $1 AND round_index = $2",
            )
            .bind(auction_id)
            .bind(auction.current_round)
            .fetch_optional(pool)
            .await?
            .ok_or(StoreError::RoundNotFound)?;

            if !round_closed {
                close_current_round(auction_id, pool, time_source).await?;
            }

            sqlx::query(
                "UPDATE auctions
                SET status = 'finalizing', updated_at = $2
                WHERE id = $1 AND status = 'running'",
            )
            .bind(auction_id)
            .bind(time_source.now().to_sqlx())
            .execute(pool)
            .await?;
        }
        AuctionStatus::Finalizing => {}
    }

    refund_remaining_bids(auction_id, batch_size, pool, time_source).await?;

    let auction = sqlx::query_as::<_, Auction>(
        "UPDATE auctions
        SET status = 'completed', ended_at = $2, updated_at = $2
        WHERE id = $1 AND status = 'finalizing'
        RETURNING *",
    )
    .bind(auction_id)
    .bind(time_source.now().to_sqlx())
    .fetch_optional(pool)
    .await?;

    match auction {
        Some(auction) => {
            tracing::info!("auction {} completed", auction_id);
            Ok(auction.into_response())
        }
        // Lost a finalization race; the winner already sealed it.
        None => read_auction(auction_id, pool).await,
    }
}

/// Refund all still-active bids, paging by id so each transaction stays
/// bounded regardless of how many bids the auction accumulated.
async fn refund_remaining_bids(
    auction_id: &AuctionId,
    batch_size: i64,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<(), StoreError> {
    let mut cursor: Option<BidId> = None;
    let mut refunded_total = 0u64;

    loop {
        let batch: Vec<BidId> = sqlx::query_scalar(
            "SELECT id FROM bids
            WHERE auction_id = $1
                AND status = 'active'
                AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id ASC
            LIMIT $3",
        )
        .bind(auction_id)
        .bind(cursor)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

        let Some(last) = batch.last().copied() else { break };

        let mut tx = pool.begin().await?;
        for bid_id in &batch {
            let flipped = sqlx::query_as::<_, Bid>(
                "UPDATE bids
                SET status = 'refunded', updated_at = $2
                WHERE id = $1 AND status = 'active'
                RETURNING *",
            )
            .bind(bid_id)
            .bind(time_source.now().to_sqlx())
            .fetch_optional(&mut *tx)
            .await?;

            // A failed flip means another finalizer got here first.
            let Some(bid) = flipped else { continue };

            ledger::refund_tx(
                &bid.user_id,
                bid.amount,
                &bid.id.to_string(),
                &mut tx,
                time_source,
            )
            .await?;
            refunded_total += 1;
        }
        tx.commit().await?;

        cursor = Some(last);
    }

    if refunded_total > 0 {
        tracing::info!(
            "refunded {} losing bid(s) for auction {}",
            refunded_total,
            auction_id
        );
    }
    Ok(())
}

pub async fn list_rounds(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<Vec<responses::RoundWithWinners>, StoreError> {
    // Validate existence so a missing auction is distinguishable from an
    // auction with no rounds yet.
    read_auction_row(auction_id, pool).await?;

    let rounds = sqlx::query_as::<_, Round>(
        "SELECT * FROM rounds WHERE auction_id = $1 ORDER BY round_index",
    )
    .bind(auction_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rounds.len());
    for round in rounds {
        let winners =
            round_winners(auction_id, round.round_index, pool).await?;
        out.push(responses::RoundWithWinners {
            round: round.into_response(),
            winners,
        });
    }
    Ok(out)
}
