pub mod api_client;
pub mod events;
pub mod requests;
pub mod responses;

pub use api_client::{APIClient, ClientError};

use derive_more::Display;
use jiff::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id type wrappers help ensure we don't mix up ids for different tables.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct UserId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct GiftId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct AuctionId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct RoundId(pub Uuid);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct BidId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct LedgerEntryId(pub Uuid);

/// Lifecycle of an auction. Transitions only move forward.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "auction_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Created,
    Running,
    Finalizing,
    Completed,
}

/// A bid starts ACTIVE and terminates exactly once, as WON or REFUNDED.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "bid_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Active,
    Won,
    Refunded,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "ledger_entry_type", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Deposit,
    Lock,
    Unlock,
    Payout,
    Refund,
}

pub const MIN_ROUND_DURATION_MS: i64 = 1_000;
pub const MAX_TOTAL_ROUNDS: i32 = 20;
pub const MAX_TOTAL_GIFTS: i32 = 1_000;

/// Per-auction parameters, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionParams {
    pub round_duration_ms: i64,
    pub total_rounds: i32,
    pub total_gifts: i32,
    pub min_bid: Decimal,
}

/// Validation result for auction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamsValidation {
    Valid,
    RoundDurationTooShort,
    TotalRoundsOutOfRange,
    TotalGiftsOutOfRange,
    MinBidTooLow,
}

impl ParamsValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn error_message(&self) -> Option<&'static str> {
        match self {
            Self::Valid => None,
            Self::RoundDurationTooShort => {
                Some("Round duration must be at least 1000 ms")
            }
            Self::TotalRoundsOutOfRange => {
                Some("Total rounds must be between 1 and 20")
            }
            Self::TotalGiftsOutOfRange => {
                Some("Total gifts must be between 1 and 1000")
            }
            Self::MinBidTooLow => Some("Minimum bid must be at least 1"),
        }
    }
}

impl AuctionParams {
    pub fn validate(&self) -> ParamsValidation {
        if self.round_duration_ms < MIN_ROUND_DURATION_MS {
            return ParamsValidation::RoundDurationTooShort;
        }
        if self.total_rounds < 1 || self.total_rounds > MAX_TOTAL_ROUNDS {
            return ParamsValidation::TotalRoundsOutOfRange;
        }
        if self.total_gifts < 1 || self.total_gifts > MAX_TOTAL_GIFTS {
            return ParamsValidation::TotalGiftsOutOfRange;
        }
        if self.min_bid < Decimal::ONE {
            return ParamsValidation::MinBidTooLow;
        }
        ParamsValidation::Valid
    }
}

/// Wrapper so `Option<Timestamp>` columns work with `#[sqlx(try_from)]` in
/// `FromRow` derives.
#[cfg(feature = "use-sqlx")]
#[derive(Debug, Clone, sqlx::Type)]
#[sqlx(transparent)]
pub struct OptionalTimestamp(pub Option<jiff_sqlx::Timestamp>);

#[cfg(feature = "use-sqlx")]
impl TryFrom<OptionalTimestamp> for Option<Timestamp> {
    type Error = <Timestamp as TryFrom<jiff_sqlx::Timestamp>>::Error;

    fn try_from(value: OptionalTimestamp) -> Result<Self, Self::Error> {
        value.0.map(Timestamp::try_from).transpose()
    }
}
