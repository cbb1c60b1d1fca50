use api::store;
use jiff::SignedDuration;
use payloads::{AuctionStatus, requests};
use rust_decimal::Decimal;
use test_helpers::{params, params_single_round, spawn_app};

#[tokio::test]
async fn test_dashboard_contents() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params(2, 2); // quota 1 in round 0
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;

    let u1 = app.create_funded_user("u1", 1000).await?;
    let u2 = app.create_funded_user("u2", 1000).await?;
    let u3 = app.create_funded_user("u3", 1000).await?;
    app.place_bid(&u1, &auction_id, 500).await?;
    app.place_bid(&u2, &auction_id, 400).await?;
    app.place_bid(&u3, &auction_id, 300).await?;

    let request = requests::GetDashboard { auction_id };

    // Anonymous view.
    let dashboard = app.client.get_dashboard(&request).await?;
    assert_eq!(dashboard.auction.status, AuctionStatus::Running);
    assert_eq!(dashboard.already_awarded, 0);
    assert_eq!(dashboard.remaining_gifts, 2);
    assert_eq!(dashboard.gifts_this_round, 1);
    assert!(dashboard.viewer.is_none());

    let round = dashboard.round.expect("running auction has a round");
    assert_eq!(round.round_index, 0);
    assert_eq!(round.ms_until_end, params.round_duration_ms);

    let amounts: Vec<Decimal> =
        dashboard.top_bids.iter().map(|b| b.amount).collect();
    assert_eq!(amounts, vec![500.into(), 400.into(), 300.into()]);
    assert_eq!(dashboard.top_bids[0].username, "u1");

    // Leader can win; the second place is outbid with quota 1.
    let for_u1 = app.as_user(u1).get_dashboard(&request).await?;
    let viewer = for_u1.viewer.expect("u1 has an active bid");
    assert_eq!(viewer.rank, 1);
    assert!(viewer.can_win);
    assert!(!viewer.is_outbid);

    let for_u2 = app.as_user(u2).get_dashboard(&request).await?;
    let viewer = for_u2.viewer.expect("u2 has an active bid");
    assert_eq!(viewer.rank, 2);
    assert!(!viewer.can_win);
    assert!(viewer.is_outbid);

    Ok(())
}

#[tokio::test]
async fn test_dashboard_cache_ttl_and_invalidation() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let auction_id = app
        .create_running_auction(&creator, params_single_round())
        .await?;
    let u1 = app.create_funded_user("u1", 1000).await?;
    let u2 = app.create_funded_user("u2", 1000).await?;

    app.place_bid(&u1, &auction_id, 200).await?;
    let request = requests::GetDashboard { auction_id };

    let before = app.client.get_dashboard(&request).await?;
    assert_eq!(before.top_bids.len(), 1);

    // A store-level write that bypasses the API does not invalidate; the
    // cached view survives until its TTL passes.
    store::place_bid(
        &u2,
        &auction_id,
        Decimal::from(900),
        0,
        &app.db_pool,
        &app.time_source,
    )
    .await?;
    let cached = app.client.get_dashboard(&request).await?;
    assert_eq!(cached.top_bids.len(), 1);

    // Past the running TTL the view is rebuilt.
    app.time_source.advance(SignedDuration::from_millis(
        app.engine_config.dashboard_ttl_running_ms + 1,
    ));
    let rebuilt = app.client.get_dashboard(&request).await?;
    assert_eq!(rebuilt.top_bids.len(), 2);
    assert_eq!(rebuilt.top_bids[0].amount, Decimal::from(900));

    // A bid through the API invalidates immediately.
    app.place_bid(&u1, &auction_id, 950).await?;
    let after = app.client.get_dashboard(&request).await?;
    assert_eq!(after.top_bids[0].amount, Decimal::from(950));

    Ok(())
}

#[tokio::test]
async fn test_dashboard_after_completion() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let creator = app.create_user("creator").await?;
    let params = params_single_round();
    let auction_id =
        app.create_running_auction(&creator, params.clone()).await?;
    let u1 = app.create_funded_user("u1", 1000).await?;
    app.place_bid(&u1, &auction_id, 200).await?;

    app.advance_past_round(&params);
    app.tick().await?;

    let dashboard = app
        .client
        .get_dashboard(&requests::GetDashboard { auction_id })
        .await?;
    assert_eq!(dashboard.auction.status, AuctionStatus::Completed);
    assert_eq!(dashboard.already_awarded, 1);
    assert_eq!(dashboard.remaining_gifts, 0);
    assert_eq!(dashboard.gifts_this_round, 0);
    assert!(dashboard.top_bids.is_empty());

    let round = dashboard.round.expect("last round is reported");
    assert_eq!(round.ms_until_end, 0);

    Ok(())
}
