pub mod auction;
pub mod bot;
pub mod events;

use actix_web::{
    HttpRequest, HttpResponse, Responder, ResponseError, body::BoxBody,
    dev::HttpServiceFactory, get, http::StatusCode, web,
};
use uuid::Uuid;

use crate::store::StoreError;

pub fn api_services() -> impl HttpServiceFactory {
    web::scope("/api")
        .service(health_check)
        .service(auction::create_auction)
        .service(auction::start_auction)
        .service(auction::place_bid)
        .service(auction::get_auction)
        .service(auction::list_auctions)
        .service(auction::list_auction_rounds)
        .service(auction::get_dashboard)
        .service(auction::get_balance)
        .service(events::event_stream)
        .service(
            web::scope("/bot")
                .service(bot::create_user)
                .service(bot::deposit)
                .service(bot::place_bid),
        )
}

#[get("/health_check")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

#[derive(Debug, thiserror::Error)]
pub enum APIError {
    #[error("Authentication failed")]
    AuthError(#[source] anyhow::Error),
    /// Domain rule rejection; `.0` is the stable kind code.
    #[error("{1}")]
    BadRequest(&'static str, String),
    #[error("{1}")]
    NotFound(&'static str, String),
    #[error("{1}")]
    Conflict(&'static str, String),
    #[error("Something went wrong")]
    UnexpectedError(#[from] anyhow::Error),
}

impl APIError {
    fn kind(&self) -> &'static str {
        match self {
            Self::AuthError(_) => "auth",
            Self::BadRequest(kind, _)
            | Self::NotFound(kind, _)
            | Self::Conflict(kind, _) => kind,
            Self::UnexpectedError(_) => "transient",
        }
    }
}

impl ResponseError for APIError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthError(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(..) => StatusCode::BAD_REQUEST,
            Self::NotFound(..) => StatusCode::NOT_FOUND,
            Self::Conflict(..) => StatusCode::CONFLICT,
            Self::UnexpectedError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<BoxBody> {
        if let Self::UnexpectedError(e) = self {
            // Internal details stay in the logs, never in the response.
            tracing::error!("{e:#}");
        }
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        }))
    }
}

impl From<StoreError> for APIError {
    fn from(e: StoreError) -> Self {
        let kind = e.kind();
        match kind {
            "not_found" => APIError::NotFound(kind, e.to_string()),
            "conflict" => APIError::Conflict(kind, e.to_string()),
            "transient" | "fatal" => APIError::UnexpectedError(e.into()),
            _ => APIError::BadRequest(kind, e.to_string()),
        }
    }
}

/// Verified caller identity, as established by the fronting gateway and
/// forwarded in the `x-caller-id` header. The engine trusts the header; the
/// trust boundary is the deployment's ingress.
pub fn get_caller_id(req: &HttpRequest) -> Result<payloads::UserId, APIError> {
    let id_str = req
        .headers()
        .get("x-caller-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            APIError::AuthError(anyhow::anyhow!("Missing caller identity"))
        })?;
    // The user_id is recorded here but attaches to the span of the api
    // route itself.
    tracing::Span::current()
        .record("user_id", tracing::field::display(id_str));
    Ok(payloads::UserId(
        Uuid::parse_str(id_str)
            .map_err(|e| APIError::AuthError(e.into()))?,
    ))
}

/// Caller identity when the route also serves anonymous viewers.
pub fn get_optional_caller_id(req: &HttpRequest) -> Option<payloads::UserId> {
    get_caller_id(req).ok()
}
