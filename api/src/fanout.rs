//! Coalesced event fan-out.
//!
//! Bid activity is bursty: one message per bid would swamp subscribers the
//! moment an auction heats up. Producers therefore never publish directly;
//! they enqueue into a per-auction pending slot and a periodic tick turns
//! whatever accumulated into a single `bid_update` per auction, keeping
//! outbound traffic at O(1) per auction per tick.
//!
//! Round and auction lifecycle events are immediate, but flush the
//! auction's pending bid batch first so subscribers never observe a round
//! result before the bids that produced it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use payloads::{AuctionId, events::EngineEvent, responses};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;

use crate::{store, telemetry::log_error, time::TimeSource};

/// How many top bids ride along on a `bid_update`.
const TOP_N: i64 = 3;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventFanout {
    inner: Arc<Inner>,
}

struct Inner {
    pool: PgPool,
    time_source: TimeSource,
    tick: Duration,
    /// Latest bid observed per auction since the last flush. Held only for
    /// map access, never across an await.
    pending: Mutex<HashMap<AuctionId, responses::Bid>>,
    sender: broadcast::Sender<EngineEvent>,
}

impl EventFanout {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        tick: Duration,
    ) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pool,
                time_source,
                tick,
                pending: Mutex::new(HashMap::new()),
                sender,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.sender.subscribe()
    }

    /// Record bid activity for the next coalesced flush. Later bids for the
    /// same auction replace earlier ones within a window.
    pub fn enqueue_bid_update(
        &self,
        auction_id: AuctionId,
        bid: responses::Bid,
    ) {
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(auction_id, bid);
    }

    /// Publish a closed round immediately, after flushing any bid batch
    /// pending for that auction.
    pub async fn emit_round_closed(
        &self,
        auction_id: AuctionId,
        round: responses::Round,
        winners: Vec<responses::RoundWinner>,
    ) {
        self.flush_auction(auction_id).await;
        self.send(EngineEvent::RoundClosed {
            auction_id,
            round,
            winners,
            ts: self.inner.time_source.now(),
        });
    }

    /// Publish an auction lifecycle change immediately.
    pub async fn emit_auction_update(&self, auction: responses::Auction) {
        let auction_id = auction.auction_id;
        self.flush_auction(auction_id).await;
        self.send(EngineEvent::AuctionUpdate {
            auction_id,
            auction,
            ts: self.inner.time_source.now(),
        });
    }

    /// Low-frequency signal for list views.
    pub fn emit_auctions_list_update(&self) {
        self.send(EngineEvent::AuctionsListUpdate {
            ts: self.inner.time_source.now(),
        });
    }

    /// Flush loop; spawn once per process.
    pub async fn run(&self) {
        let mut interval = time::interval(self.inner.tick);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.flush_all().await;
        }
    }

    async fn flush_all(&self) {
        let drained: Vec<(AuctionId, responses::Bid)> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (auction_id, bid) in drained {
            self.publish_bid_update(auction_id, bid).await;
        }
    }

    async fn flush_auction(&self, auction_id: AuctionId) {
        let pending_bid = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.remove(&auction_id)
        };
        if let Some(bid) = pending_bid {
            self.publish_bid_update(auction_id, bid).await;
        }
    }

    async fn publish_bid_update(
        &self,
        auction_id: AuctionId,
        bid: responses::Bid,
    ) {
        match store::top_bids(&auction_id, TOP_N, &self.inner.pool).await {
            Ok(top_bids) => self.send(EngineEvent::BidUpdate {
                auction_id,
                bid,
                top_bids,
                ts: self.inner.time_source.now(),
            }),
            Err(e) => log_error(
                anyhow::Error::from(e)
                    .context("failed to load top bids for bid_update"),
            ),
        }
    }

    fn send(&self, event: EngineEvent) {
        // A send error just means nobody is subscribed right now.
        let _ = self.inner.sender.send(event);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}
