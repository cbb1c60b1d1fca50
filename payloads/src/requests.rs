use crate::{AuctionId, AuctionParams, GiftId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const USERNAME_MAX_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAuction {
    pub gift_id: GiftId,
    pub params: AuctionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBid {
    pub auction_id: AuctionId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDashboard {
    pub auction_id: AuctionId,
}

/// Load-test path: the caller names the bidding user explicitly, with no
/// identity check. Only served when the bot API is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotPlaceBid {
    pub user_id: UserId,
    pub auction_id: AuctionId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDeposit {
    pub user_id: UserId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotCreateUser {
    pub username: String,
}
