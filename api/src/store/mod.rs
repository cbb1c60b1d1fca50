//! Database store module for the auction engine.
//!
//! ## Design Decisions
//!
//! ### Authoritative state
//! - All durable state lives in Postgres. In-process caches (dashboard) are
//!   best-effort and never read-authoritative.
//! - Balance mutations flow exclusively through the ledger operations in
//!   [`ledger`], which pair a conditional balance update with exactly one
//!   append-only ledger entry inside a single transaction.
//!
//! ### Concurrency
//! - Per-user serialization: money-moving operations lock the user row with
//!   `SELECT ... FOR UPDATE`, so two placements by the same user serialize
//!   without any in-process mutex.
//! - Per-bid linearization: terminal status flips use conditional updates
//!   (`... WHERE status = 'active'`), so a bid can leave ACTIVE exactly once
//!   even when the scheduler and a finalizer race.
//! - Serialization failures surface as [`StoreError::Conflict`]; callers
//!   retry a bounded number of times with jittered backoff.
//!
//! ### Time Source Dependency
//! - Functions that need current time accept a `TimeSource` parameter
//!   instead of creating their own, so time can be mocked during tests and
//!   the scheduler can be driven deterministically.
//!
//! ### Type Safety
//! - Id newtypes from `payloads` implement `sqlx::Type`, so they bind
//!   directly in queries without unwrapping the inner `Uuid`.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

use payloads::{
    AuctionId, AuctionStatus, BidId, BidStatus, GiftId, LedgerEntryId,
    LedgerEntryType, OptionalTimestamp, RoundId, UserId, responses,
};

use crate::time::TimeSource;

pub mod auction;
pub mod bid;
pub mod ledger;

pub use auction::{
    ClosedRound, advance_round, close_current_round, create_auction,
    finalize_auction, gifts_this_round, list_auctions, list_rounds,
    read_auction, start_auction,
};
pub use bid::{find_active_bid, place_bid, top_bids};
pub use ledger::{
    deposit, lock, payout, refund, unlock, verify_user_ledger,
};

/// A complete user row. Wallet state stays in the backend; only the
/// balances leave through [`get_balance`].
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub balance: Decimal,
    pub locked_balance: Decimal,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct Gift {
    pub id: GiftId,
    pub title: String,
    pub description: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct Auction {
    pub id: AuctionId,
    pub gift_id: GiftId,
    pub creator_id: UserId,
    pub status: AuctionStatus,
    pub total_gifts: i32,
    pub total_rounds: i32,
    pub current_round: i32,
    pub round_duration_ms: i64,
    pub min_bid: Decimal,
    pub scheduler_failure_count: i32,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub scheduler_last_failed_at: Option<Timestamp>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub started_at: Option<Timestamp>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub ended_at: Option<Timestamp>,
}

impl Auction {
    pub fn is_last_round(&self) -> bool {
        self.current_round + 1 >= self.total_rounds
    }

    pub fn into_response(self) -> responses::Auction {
        responses::Auction {
            auction_id: self.id,
            gift_id: self.gift_id,
            creator_id: self.creator_id,
            status: self.status,
            current_round: self.current_round,
            total_rounds: self.total_rounds,
            total_gifts: self.total_gifts,
            min_bid: self.min_bid,
            round_duration_ms: self.round_duration_ms,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Round {
    pub id: RoundId,
    pub auction_id: AuctionId,
    pub round_index: i32,
    #[sqlx(try_from = "SqlxTs")]
    pub start_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub end_at: Timestamp,
    pub closed: bool,
    pub winners_count: i32,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub closed_at: Option<Timestamp>,
}

impl Round {
    pub fn into_response(self) -> responses::Round {
        responses::Round {
            round_id: self.id,
            auction_id: self.auction_id,
            round_index: self.round_index,
            start_at: self.start_at,
            end_at: self.end_at,
            closed: self.closed,
            winners_count: self.winners_count,
            closed_at: self.closed_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Bid {
    pub id: BidId,
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub status: BidStatus,
    /// Round the bid currently participates in; advanced on carry-over.
    pub round_index: i32,
    pub won_in_round_index: Option<i32>,
    /// Number of increases applied; indexes the delta lock reference ids.
    pub increases: i32,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

impl Bid {
    pub fn into_response(self) -> responses::Bid {
        responses::Bid {
            bid_id: self.id,
            auction_id: self.auction_id,
            user_id: self.user_id,
            amount: self.amount,
            status: self.status,
            round_index: self.round_index,
            won_in_round_index: self.won_in_round_index,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Append-only audit row. Never updated, never deleted; the multiset of
/// entries determines the balances.
#[derive(Debug, Clone, FromRow)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub entry_type: LedgerEntryType,
    pub amount: Decimal,
    pub reference_id: String,
    pub note: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

/// Create a new user with empty balances.
pub async fn create_user(
    username: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<User, StoreError> {
    if username.is_empty()
        || username.len() > payloads::requests::USERNAME_MAX_LEN
    {
        return Err(StoreError::InvalidInput("invalid username length"));
    }
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, created_at, updated_at)
        VALUES ($1, $2, $2)
        RETURNING *",
    )
    .bind(username)
    .bind(time_source.now().to_sqlx())
    .fetch_one(pool)
    .await?;
    Ok(user)
}

pub async fn read_user(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => StoreError::UserNotFound,
            e => e.into(),
        })
}

pub async fn get_balance(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<responses::Balance, StoreError> {
    let user = read_user(user_id, pool).await?;
    Ok(responses::Balance {
        user_id: user.id,
        balance: user.balance,
        locked_balance: user.locked_balance,
    })
}

/// Create a gift row. Catalog management lives outside the engine; this
/// exists so auctions have something to reference.
pub async fn create_gift(
    title: &str,
    description: Option<&str>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Gift, StoreError> {
    let gift = sqlx::query_as::<_, Gift>(
        "INSERT INTO gifts (title, description, created_at)
        VALUES ($1, $2, $3)
        RETURNING *",
    )
    .bind(title)
    .bind(description)
    .bind(time_source.now().to_sqlx())
    .fetch_one(pool)
    .await?;
    Ok(gift)
}

pub async fn read_gift(
    gift_id: &GiftId,
    pool: &PgPool,
) -> Result<Gift, StoreError> {
    sqlx::query_as::<_, Gift>("SELECT * FROM gifts WHERE id = $1")
        .bind(gift_id)
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => StoreError::GiftNotFound,
            e => e.into(),
        })
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("User not found")]
    UserNotFound,
    #[error("Gift not found")]
    GiftNotFound,
    #[error("Auction not found")]
    AuctionNotFound,
    #[error("Round not found")]
    RoundNotFound,
    #[error("Bid not found")]
    BidNotFound,
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Bid is below the auction minimum")]
    BidTooLow,
    #[error("A new bid must exceed the existing bid")]
    MustIncrease,
    #[error("Auction is not running")]
    AuctionNotRunning,
    #[error("The current round has expired")]
    RoundExpired,
    #[error("Only the creator may start the auction")]
    NotCreator,
    #[error("Optimistic concurrency conflict")]
    Conflict(#[source] sqlx::Error),
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Ledger invariant violated: {0}")]
    Fatal(String),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl StoreError {
    /// Stable machine-readable code; callers inspect this, never the text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserNotFound
            | Self::GiftNotFound
            | Self::AuctionNotFound
            | Self::RoundNotFound
            | Self::BidNotFound => "not_found",
            Self::InvalidState(_) | Self::NotCreator => "invalid_state",
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientFunds => "insufficient_funds",
            Self::BidTooLow => "bid_too_low",
            Self::MustIncrease => "must_increase",
            Self::AuctionNotRunning => "auction_not_running",
            Self::RoundExpired => "round_expired",
            Self::Conflict(_) | Self::NotUnique(_) => "conflict",
            Self::Database(_) | Self::UnexpectedError(_) => "transient",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether a bounded in-process retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            // Serialization failures and deadlocks are retryable conflicts.
            if matches!(
                db_err.code().as_deref(),
                Some("40001") | Some("40P01")
            ) {
                return StoreError::Conflict(e);
            }
            if db_err.is_unique_violation() {
                return StoreError::NotUnique(e);
            }
        }
        StoreError::Database(e)
    }
}
