use api::{scheduler, store};
use jiff::SignedDuration;
use payloads::{AuctionStatus, BidId, BidStatus, UserId};
use rust_decimal::Decimal;
use test_helpers::{params_single_round, spawn_app};

#[tokio::test]
async fn test_round_closes_only_after_deadline() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;
    let end_at = app.time_source.now()
        + SignedDuration::from_millis(params.round_duration_ms);

    // One millisecond early: nothing happens.
    app.time_source
        .advance(SignedDuration::from_millis(params.round_duration_ms - 1));
    app.tick().await?;
    let rounds = app.client.list_rounds(&auction_id).await?;
    assert!(!rounds[0].round.closed);

    // At the deadline: the round closes, and never before its end.
    app.time_source.advance(SignedDuration::from_millis(1));
    app.tick().await?;
    let rounds = app.client.list_rounds(&auction_id).await?;
    assert!(rounds[0].round.closed);
    assert!(rounds[0].round.closed_at.unwrap() >= end_at);

    Ok(())
}

#[tokio::test]
async fn test_close_round_is_idempotent() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;
    let alice = app.create_funded_user("alice", 1000).await?;
    let bid = app.place_bid(&alice, &auction_id, 200).await?;

    app.advance_past_round(&params);

    let first =
        store::close_current_round(&auction_id, &app.db_pool, &app.time_source)
            .await?;
    let second =
        store::close_current_round(&auction_id, &app.db_pool, &app.time_source)
            .await?;

    assert_eq!(first.round.winners_count, 1);
    assert_eq!(second.round.winners_count, 1);
    assert_eq!(second.winners.len(), 1);

    // Exactly one payout entry for the winning bid.
    let payouts: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ledger_entries
        WHERE entry_type = 'payout' AND reference_id = $1",
    )
    .bind(bid.bid_id.to_string())
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(payouts, 1);
    assert_eq!(app.balances(&alice).await?, (800.into(), 0.into()));

    Ok(())
}

/// Two sweepers racing the same round: one does the work, the other
/// observes the sealed result. The winner is paid exactly once.
#[tokio::test]
async fn test_concurrent_closers_pay_out_once() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;
    let alice = app.create_funded_user("alice", 1000).await?;
    let bid = app.place_bid(&alice, &auction_id, 200).await?;

    app.advance_past_round(&params);

    let (first, second) = tokio::join!(
        store::close_current_round(&auction_id, &app.db_pool, &app.time_source),
        store::close_current_round(&auction_id, &app.db_pool, &app.time_source),
    );
    let first = first?;
    let second = second?;
    assert_eq!(first.round.winners_count, 1);
    assert_eq!(second.round.winners_count, 1);

    let payouts: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ledger_entries
        WHERE entry_type = 'payout' AND reference_id = $1",
    )
    .bind(bid.bid_id.to_string())
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(payouts, 1);
    assert_eq!(app.balances(&alice).await?, (800.into(), 0.into()));

    Ok(())
}

/// A finalizer that dies mid-refund is resumed by startup recovery; already
/// processed bids are skipped and no ledger entry is duplicated.
#[tokio::test]
async fn test_finalization_resumes_after_crash() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;

    let winner = app.create_funded_user("winner", 1000).await?;
    let loser_a = app.create_funded_user("loser_a", 1000).await?;
    let loser_b = app.create_funded_user("loser_b", 1000).await?;

    app.place_bid(&winner, &auction_id, 500).await?;
    app.place_bid(&loser_a, &auction_id, 300).await?;
    app.place_bid(&loser_b, &auction_id, 200).await?;

    app.advance_past_round(&params);
    store::close_current_round(&auction_id, &app.db_pool, &app.time_source)
        .await?;

    // Emulate a finalizer that moved to FINALIZING, refunded one bid, and
    // died before the rest.
    sqlx::query(
        "UPDATE auctions SET status = 'finalizing', updated_at = $2
        WHERE id = $1",
    )
    .bind(auction_id)
    .bind(jiff_sqlx::ToSqlx::to_sqlx(app.time_source.now()))
    .execute(&app.db_pool)
    .await?;

    let (bid_a, _): (BidId, UserId) = sqlx::query_as(
        "SELECT id, user_id FROM bids
        WHERE auction_id = $1 AND user_id = $2",
    )
    .bind(auction_id)
    .bind(loser_a)
    .fetch_one(&app.db_pool)
    .await?;
    sqlx::query("UPDATE bids SET status = 'refunded' WHERE id = $1")
        .bind(bid_a)
        .execute(&app.db_pool)
        .await?;
    store::refund(
        &loser_a,
        Decimal::from(300),
        &bid_a.to_string(),
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    // Restart: past the recovery window, recovery re-invokes finalize.
    app.time_source.advance(SignedDuration::from_secs(6 * 60));
    scheduler::recover(
        &app.db_pool,
        &app.time_source,
        &app.fanout,
        &app.engine_config,
    )
    .await?;

    let auction = app.client.get_auction(&auction_id).await?;
    assert_eq!(auction.status, AuctionStatus::Completed);

    // Both losers whole again, winner paid, one refund entry per bid.
    assert_eq!(app.balances(&winner).await?, (500.into(), 0.into()));
    assert_eq!(app.balances(&loser_a).await?, (1000.into(), 0.into()));
    assert_eq!(app.balances(&loser_b).await?, (1000.into(), 0.into()));

    let refunds_per_reference: Vec<i64> = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ledger_entries
        WHERE entry_type = 'refund'
        GROUP BY reference_id",
    )
    .fetch_all(&app.db_pool)
    .await?;
    assert_eq!(refunds_per_reference, vec![1, 1]);

    // Finalizing again changes nothing.
    store::finalize_auction(
        &auction_id,
        app.engine_config.finalize_batch_size,
        &app.db_pool,
        &app.time_source,
    )
    .await?;
    assert_eq!(app.balances(&loser_a).await?, (1000.into(), 0.into()));

    for user in [&winner, &loser_a, &loser_b] {
        store::verify_user_ledger(user, &app.db_pool).await?;
    }

    let statuses: Vec<BidStatus> = sqlx::query_scalar(
        "SELECT status FROM bids WHERE auction_id = $1",
    )
    .bind(auction_id)
    .fetch_all(&app.db_pool)
    .await?;
    assert!(!statuses.contains(&BidStatus::Active));

    Ok(())
}

/// Small refund batches still drain every losing bid.
#[tokio::test]
async fn test_finalize_with_bounded_batches() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;

    let winner = app.create_funded_user("winner", 1000).await?;
    app.place_bid(&winner, &auction_id, 900).await?;
    let mut losers = Vec::new();
    for i in 0..5 {
        let user = app
            .create_funded_user(&format!("loser_{i}"), 1000)
            .await?;
        app.place_bid(&user, &auction_id, 100 + i).await?;
        losers.push(user);
    }

    app.advance_past_round(&params);
    store::close_current_round(&auction_id, &app.db_pool, &app.time_source)
        .await?;

    // Batch size 2 forces three passes over five losing bids.
    store::finalize_auction(&auction_id, 2, &app.db_pool, &app.time_source)
        .await?;

    let auction = app.client.get_auction(&auction_id).await?;
    assert_eq!(auction.status, AuctionStatus::Completed);
    for user in &losers {
        assert_eq!(app.balances(user).await?, (1000.into(), 0.into()));
    }

    Ok(())
}

#[tokio::test]
async fn test_multiple_auctions_sweep_independently() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let short = params_single_round();
    let mut long = params_single_round();
    long.round_duration_ms = 60_000;

    let fast_id = app.create_running_auction(&creator, short.clone()).await?;
    let slow_id = app.create_running_auction(&creator, long).await?;

    app.advance_past_round(&short);
    app.tick().await?;

    let fast = app.client.get_auction(&fast_id).await?;
    let slow = app.client.get_auction(&slow_id).await?;
    assert_eq!(fast.status, AuctionStatus::Completed);
    assert_eq!(slow.status, AuctionStatus::Running);

    Ok(())
}
