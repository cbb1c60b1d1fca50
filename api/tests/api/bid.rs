use api::store::{self, StoreError};
use payloads::BidStatus;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use test_helpers::{assert_status_code, params_single_round, spawn_app};

#[tokio::test]
async fn test_place_bid_locks_funds() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let auction_id = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    let bid = app.place_bid(&alice, &auction_id, 200).await?;
    assert_eq!(bid.amount, Decimal::from(200));
    assert_eq!(bid.status, BidStatus::Active);
    assert_eq!(bid.round_index, 0);
    assert_eq!(bid.won_in_round_index, None);

    assert_eq!(app.balances(&alice).await?, (800.into(), 200.into()));

    let balance = app.as_user(alice).get_balance().await?;
    assert_eq!(balance.balance, Decimal::from(800));
    assert_eq!(balance.locked_balance, Decimal::from(200));

    store::verify_user_ledger(&alice, &app.db_pool).await?;
    Ok(())
}

#[tokio::test]
async fn test_bid_increase() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let auction_id = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    let first = app.place_bid(&alice, &auction_id, 200).await?;
    let increased = app.place_bid(&alice, &auction_id, 350).await?;

    // Same bid, updated in place: only the delta was locked.
    assert_eq!(increased.bid_id, first.bid_id);
    assert_eq!(increased.amount, Decimal::from(350));
    assert_eq!(app.balances(&alice).await?, (650.into(), 350.into()));

    let active_bids: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bids
        WHERE auction_id = $1 AND user_id = $2 AND status = 'active'",
    )
    .bind(auction_id)
    .bind(alice)
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(active_bids, 1);

    // A non-increasing amount is rejected.
    assert_status_code(
        app.place_bid(&alice, &auction_id, 300).await,
        StatusCode::BAD_REQUEST,
    );
    let err = store::place_bid(
        &alice,
        &auction_id,
        Decimal::from(300),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::MustIncrease));

    // Equal amount is not an increase either.
    let err = store::place_bid(
        &alice,
        &auction_id,
        Decimal::from(350),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::MustIncrease));

    assert_eq!(app.balances(&alice).await?, (650.into(), 350.into()));
    store::verify_user_ledger(&alice, &app.db_pool).await?;
    Ok(())
}

#[tokio::test]
async fn test_bid_below_minimum_rejected() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let auction_id = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    assert_status_code(
        app.place_bid(&alice, &auction_id, 50).await,
        StatusCode::BAD_REQUEST,
    );
    let err = store::place_bid(
        &alice,
        &auction_id,
        Decimal::from(50),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::BidTooLow));

    assert_eq!(app.balances(&alice).await?, (1000.into(), 0.into()));
    Ok(())
}

#[tokio::test]
async fn test_bid_requires_running_auction() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    // Created but never started.
    let auction_id = app
        .create_test_auction(&creator, params_single_round())
        .await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    assert_status_code(
        app.place_bid(&alice, &auction_id, 200).await,
        StatusCode::BAD_REQUEST,
    );
    let err = store::place_bid(
        &alice,
        &auction_id,
        Decimal::from(200),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::AuctionNotRunning));
    Ok(())
}

#[tokio::test]
async fn test_bid_after_deadline_rejected() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    app.advance_past_round(&params);

    // The sweeper hasn't run yet, but the window is over.
    assert_status_code(
        app.place_bid(&alice, &auction_id, 200).await,
        StatusCode::BAD_REQUEST,
    );
    let err = store::place_bid(
        &alice,
        &auction_id,
        Decimal::from(200),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::RoundExpired));
    Ok(())
}

#[tokio::test]
async fn test_insufficient_funds_leaves_bid_untouched() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let auction_id = app
        .create_running_auction(&creator, params_single_round())
        .await?;

    // Not enough for the opening bid.
    let poor = app.create_funded_user("poor", 100).await?;
    let err = store::place_bid(
        &poor,
        &auction_id,
        Decimal::from(200),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::InsufficientFunds));
    assert_eq!(app.balances(&poor).await?, (100.into(), 0.into()));

    // Enough for the opening bid but not for the increase delta.
    let alice = app.create_funded_user("alice", 300).await?;
    app.place_bid(&alice, &auction_id, 200).await?;
    let err = store::place_bid(
        &alice,
        &auction_id,
        Decimal::from(450),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::InsufficientFunds));

    // The failed increase rolled back entirely.
    let bid = store::find_active_bid(&auction_id, &alice, &app.db_pool)
        .await?
        .unwrap();
    assert_eq!(bid.amount, Decimal::from(200));
    assert_eq!(app.balances(&alice).await?, (100.into(), 200.into()));
    store::verify_user_ledger(&alice, &app.db_pool).await?;
    Ok(())
}

/// Concurrent placements by one user serialize; whatever the interleaving,
/// the single-active-bid and locked-balance invariants hold afterwards.
#[tokio::test]
async fn test_concurrent_placements_keep_invariants() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let auction_id = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    let (first, second) = tokio::join!(
        store::place_bid(
            &alice,
            &auction_id,
            Decimal::from(300),
            3,
            &app.db_pool,
            &app.time_source,
        ),
        store::place_bid(
            &alice,
            &auction_id,
            Decimal::from(400),
            3,
            &app.db_pool,
            &app.time_source,
        ),
    );

    // At least one placement lands; the other either became an increase or
    // lost the strict-increase race.
    let successes =
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
    assert!(successes >= 1);

    let active_bids: Vec<(Decimal,)> = sqlx::query_as(
        "SELECT amount FROM bids
        WHERE auction_id = $1 AND user_id = $2 AND status = 'active'",
    )
    .bind(auction_id)
    .bind(alice)
    .fetch_all(&app.db_pool)
    .await?;
    assert_eq!(active_bids.len(), 1);

    let (balance, locked) = app.balances(&alice).await?;
    assert_eq!(locked, active_bids[0].0);
    assert_eq!(balance + locked, Decimal::from(1000));
    store::verify_user_ledger(&alice, &app.db_pool).await?;

    Ok(())
}

#[tokio::test]
async fn test_locked_balance_equals_active_bid_amounts() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let a1 = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let a2 = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let alice = app.create_funded_user("alice", 1000).await?;

    app.place_bid(&alice, &a1, 200).await?;
    app.place_bid(&alice, &a2, 300).await?;
    app.place_bid(&alice, &a1, 250).await?;

    let active_total: Option<Decimal> = sqlx::query_scalar(
        "SELECT SUM(amount) FROM bids
        WHERE user_id = $1 AND status = 'active'",
    )
    .bind(alice)
    .fetch_one(&app.db_pool)
    .await?;

    let (balance, locked) = app.balances(&alice).await?;
    assert_eq!(active_total, Some(locked));
    assert_eq!(balance + locked, Decimal::from(1000));
    store::verify_user_ledger(&alice, &app.db_pool).await?;
    Ok(())
}
