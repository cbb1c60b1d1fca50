//! Dashboard read model.
//!
//! A dashboard is a view over authoritative store state: auction summary,
//! the current round window, gift accounting, the top active bids, and the
//! viewer's own standing. Because clients poll it aggressively while a
//! round is hot, results are cached for a short TTL keyed by
//! `(auction_id, viewer)`; mutations invalidate the viewer-less entry and
//! per-viewer entries simply age out. The cache is best-effort: nothing
//! reads it as authoritative state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jiff::{SignedDuration, Timestamp};
use payloads::{AuctionId, AuctionStatus, UserId, responses};
use sqlx::PgPool;

use crate::{
    store::{self, StoreError},
    time::TimeSource,
};

/// Entries beyond this count trigger a prune of expired slots on insert.
const PRUNE_THRESHOLD: usize = 1024;

type CacheKey = (AuctionId, Option<UserId>);

#[derive(Clone)]
struct CachedEntry {
    stored_at: Timestamp,
    ttl: SignedDuration,
    dashboard: responses::Dashboard,
}

impl CachedEntry {
    fn is_fresh(&self, now: Timestamp) -> bool {
        now < self.stored_at + self.ttl
    }
}

#[derive(Clone)]
pub struct Projection {
    pool: PgPool,
    time_source: TimeSource,
    cache: Arc<Mutex<HashMap<CacheKey, CachedEntry>>>,
    ttl_running: SignedDuration,
    ttl_completed: SignedDuration,
}

impl Projection {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        ttl_running: SignedDuration,
        ttl_completed: SignedDuration,
    ) -> Self {
        Self {
            pool,
            time_source,
            cache: Arc::new(Mutex::new(HashMap::new())),
            ttl_running,
            ttl_completed,
        }
    }

    /// Serve the dashboard, from cache when fresh.
    pub async fn get_dashboard(
        &self,
        auction_id: &AuctionId,
        viewer: Option<&UserId>,
    ) -> Result<responses::Dashboard, StoreError> {
        let key = (*auction_id, viewer.copied());
        let now = self.time_source.now();

        if let Some(entry) = self.cache.lock().unwrap().get(&key)
            && entry.is_fresh(now)
        {
            return Ok(entry.dashboard.clone());
        }

        let dashboard = build_dashboard(
            auction_id,
            viewer,
            &self.pool,
            &self.time_source,
        )
        .await?;

        let ttl = match dashboard.auction.status {
            AuctionStatus::Completed => self.ttl_completed,
            _ => self.ttl_running,
        };

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= PRUNE_THRESHOLD {
            cache.retain(|_, entry| entry.is_fresh(now));
        }
        cache.insert(
            key,
            CachedEntry {
                stored_at: now,
                ttl,
                dashboard: dashboard.clone(),
            },
        );
        Ok(dashboard)
    }

    /// Drop the shared (viewer-less) entry after a mutation touching the
    /// auction. Viewer-specific entries expire on their own TTL.
    pub fn invalidate(&self, auction_id: &AuctionId) {
        self.cache.lock().unwrap().remove(&(*auction_id, None));
    }
}

async fn build_dashboard(
    auction_id: &AuctionId,
    viewer: Option<&UserId>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Dashboard, StoreError> {
    let auction = store::auction::read_auction_row(auction_id, pool).await?;
    let now = time_source.now();

    let round = sqlx::query_as::<_, store::Round>(
        "SELECT * FROM rounds WHERE auction_id = $1 AND round_index = $2",
    )
    .bind(auction_id)
    .bind(auction.current_round)
    .fetch_optional(pool)
    .await?;

    let round_window = round.map(|round| responses::RoundWindow {
        round_index: round.round_index,
        start_at: round.start_at,
        end_at: round.end_at,
        ms_until_end: round.end_at.duration_since(now).as_millis().max(0)
            as i64,
    });

    let already_awarded: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(winners_count), 0)
        FROM rounds WHERE auction_id = $1 AND closed",
    )
    .bind(auction_id)
    .fetch_one(pool)
    .await?;
    let already_awarded = already_awarded as i32;

    let gifts_this_round = if auction.status == AuctionStatus::Running {
        store::gifts_this_round(
            auction.total_gifts,
            auction.total_rounds,
            auction.current_round,
            already_awarded,
        )
    } else {
        0
    };

    let top_bids = store::top_bids(auction_id, 3, pool).await?;

    let viewer_bid = match viewer {
        Some(user_id) => {
            viewer_position(auction_id, user_id, gifts_this_round, pool)
                .await?
        }
        None => None,
    };

    let remaining_gifts = (auction.total_gifts - already_awarded).max(0);

    Ok(responses::Dashboard {
        auction: auction.into_response(),
        round: round_window,
        already_awarded,
        remaining_gifts,
        gifts_this_round,
        top_bids,
        viewer: viewer_bid,
    })
}

/// Viewer rank by the winner-selection order `(amount DESC, created_at ASC,
/// id ASC)`; a bid can win when its rank fits inside this round's quota.
async fn viewer_position(
    auction_id: &AuctionId,
    user_id: &UserId,
    gifts_this_round: i32,
    pool: &PgPool,
) -> Result<Option<responses::ViewerBid>, StoreError> {
    let Some(bid) = store::find_active_bid(auction_id, user_id, pool).await?
    else {
        return Ok(None);
    };

    let higher: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bids
        WHERE auction_id = $1
            AND status = 'active'
            AND (
                amount > $2
                OR (amount = $2 AND created_at < $3)
                OR (amount = $2 AND created_at = $3 AND id < $4)
            )",
    )
    .bind(auction_id)
    .bind(bid.amount)
    .bind(jiff_sqlx::ToSqlx::to_sqlx(bid.created_at))
    .bind(bid.id)
    .fetch_one(pool)
    .await?;

    let rank = higher + 1;
    let can_win = rank <= gifts_this_round as i64;
    Ok(Some(responses::ViewerBid {
        bid_id: bid.id,
        amount: bid.amount,
        rank,
        can_win,
        is_outbid: !can_win,
    }))
}
