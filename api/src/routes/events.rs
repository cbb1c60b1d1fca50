//! Server-sent event stream bridging the fan-out's broadcast channel.

use actix_web::{HttpResponse, get, web};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use crate::fanout::EventFanout;

/// Push channel for `bid_update`, `round_closed`, `auction_update`, and
/// `auctions_list_update`. Subscribers filter by auction id locally.
#[tracing::instrument(skip(fanout))]
#[get("/events")]
pub async fn event_stream(fanout: web::Data<EventFanout>) -> HttpResponse {
    let stream =
        BroadcastStream::new(fanout.subscribe()).filter_map(|event| {
            // A lagged receiver skips what it missed; coalescing upstream
            // keeps that rare.
            let event = event.ok()?;
            let json = serde_json::to_string(&event).ok()?;
            Some(Ok::<_, std::convert::Infallible>(web::Bytes::from(
                format!("data: {json}\n\n"),
            )))
        });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(stream)
}
