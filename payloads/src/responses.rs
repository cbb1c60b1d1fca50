use crate::{
    AuctionId, AuctionStatus, BidId, BidStatus, GiftId, RoundId, UserId,
};
use jiff::Timestamp;
#[cfg(feature = "use-sqlx")]
use jiff_sqlx::Timestamp as SqlxTs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub auction_id: AuctionId,
    pub gift_id: GiftId,
    pub creator_id: UserId,
    pub status: AuctionStatus,
    /// Index of the round currently accepting bids (or the last one played).
    pub current_round: i32,
    pub total_rounds: i32,
    pub total_gifts: i32,
    pub min_bid: Decimal,
    pub round_duration_ms: i64,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_id: RoundId,
    pub auction_id: AuctionId,
    pub round_index: i32,
    pub start_at: Timestamp,
    pub end_at: Timestamp,
    pub closed: bool,
    pub winners_count: i32,
    pub closed_at: Option<Timestamp>,
}

/// A winner entry in a round report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundWinner {
    pub user_id: UserId,
    pub username: String,
    pub bid_amount: Decimal,
    pub won_at: Timestamp,
    /// Round in which the winning bid was originally placed, which can be
    /// earlier than the winning round when the bid was carried over.
    pub placed_in_round: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundWithWinners {
    pub round: Round,
    pub winners: Vec<RoundWinner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub status: BidStatus,
    pub round_index: i32,
    pub won_in_round_index: Option<i32>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// One of the leading active bids shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct TopBid {
    pub user_id: UserId,
    pub username: String,
    pub amount: Decimal,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundWindow {
    pub round_index: i32,
    pub start_at: Timestamp,
    pub end_at: Timestamp,
    pub ms_until_end: i64,
}

/// The viewer's own standing in the current round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerBid {
    pub bid_id: BidId,
    pub amount: Decimal,
    /// 1-based rank within active bids, ordered by
    /// (amount desc, created_at asc, id asc).
    pub rank: i64,
    pub can_win: bool,
    pub is_outbid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dashboard {
    pub auction: Auction,
    /// Absent before the auction starts.
    pub round: Option<RoundWindow>,
    pub already_awarded: i32,
    pub remaining_gifts: i32,
    pub gifts_this_round: i32,
    pub top_bids: Vec<TopBid>,
    /// Present only when a viewer was supplied and holds an active bid.
    pub viewer: Option<ViewerBid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: UserId,
    pub balance: Decimal,
    pub locked_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: UserId,
    pub username: String,
}
