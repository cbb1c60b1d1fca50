//! Push events published by the engine's fan-out.
//!
//! `bid_update` is coalesced per auction and tick; the rest are emitted
//! immediately. Subscribers receive every event and filter locally by
//! auction id.

use crate::{AuctionId, responses};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Aggregated bid activity: the most recent bid observed during the
    /// coalescing window plus the top bids at flush time.
    BidUpdate {
        auction_id: AuctionId,
        bid: responses::Bid,
        top_bids: Vec<responses::TopBid>,
        ts: Timestamp,
    },
    RoundClosed {
        auction_id: AuctionId,
        round: responses::Round,
        winners: Vec<responses::RoundWinner>,
        ts: Timestamp,
    },
    AuctionUpdate {
        auction_id: AuctionId,
        auction: responses::Auction,
        ts: Timestamp,
    },
    /// Low-frequency hint that list views should refresh.
    AuctionsListUpdate { ts: Timestamp },
}

impl EngineEvent {
    /// Auction the event belongs to, if it is auction-scoped.
    pub fn auction_id(&self) -> Option<AuctionId> {
        match self {
            Self::BidUpdate { auction_id, .. }
            | Self::RoundClosed { auction_id, .. }
            | Self::AuctionUpdate { auction_id, .. } => Some(*auction_id),
            Self::AuctionsListUpdate { .. } => None,
        }
    }
}
