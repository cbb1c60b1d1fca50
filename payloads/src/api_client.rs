use crate::{AuctionId, UserId, requests, responses};
use reqwest::StatusCode;
use serde::Serialize;

type ReqwestResult = Result<reqwest::Response, reqwest::Error>;

/// An API client for interfacing with the backend.
///
/// The caller id is attached as the `x-caller-id` header; in production that
/// header is set by the authenticating gateway, so this client is primarily
/// for tests and tooling.
pub struct APIClient {
    pub address: String,
    pub inner_client: reqwest::Client,
    pub caller: Option<UserId>,
}

/// Helper methods for http actions
impl APIClient {
    fn format_url(&self, path: &str) -> String {
        format!("{}/api/{path}", &self.address)
    }

    fn attach_caller(
        &self,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match self.caller {
            Some(user_id) => {
                request.header("x-caller-id", user_id.0.to_string())
            }
            None => request,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> ReqwestResult {
        let request = self.inner_client.post(self.format_url(path)).json(body);
        self.attach_caller(request).send().await
    }

    async fn empty_get(&self, path: &str) -> ReqwestResult {
        let request = self.inner_client.get(self.format_url(path));
        self.attach_caller(request).send().await
    }
}

/// Methods on the backend API
impl APIClient {
    pub async fn health_check(&self) -> Result<(), ClientError> {
        let response = self.empty_get("health_check").await?;
        ok_empty(response).await
    }

    pub async fn create_auction(
        &self,
        details: &requests::CreateAuction,
    ) -> Result<AuctionId, ClientError> {
        let response = self.post("create_auction", details).await?;
        ok_body(response).await
    }

    pub async fn start_auction(
        &self,
        auction_id: &AuctionId,
    ) -> Result<responses::Auction, ClientError> {
        let response = self.post("start_auction", auction_id).await?;
        ok_body(response).await
    }

    pub async fn place_bid(
        &self,
        details: &requests::PlaceBid,
    ) -> Result<responses::Bid, ClientError> {
        let response = self.post("place_bid", details).await?;
        ok_body(response).await
    }

    pub async fn get_auction(
        &self,
        auction_id: &AuctionId,
    ) -> Result<responses::Auction, ClientError> {
        let response = self.post("auction", auction_id).await?;
        ok_body(response).await
    }

    pub async fn list_auctions(
        &self,
    ) -> Result<Vec<responses::Auction>, ClientError> {
        let response = self.empty_get("auctions").await?;
        ok_body(response).await
    }

    pub async fn list_rounds(
        &self,
        auction_id: &AuctionId,
    ) -> Result<Vec<responses::RoundWithWinners>, ClientError> {
        let response = self.post("auction_rounds", auction_id).await?;
        ok_body(response).await
    }

    pub async fn get_dashboard(
        &self,
        details: &requests::GetDashboard,
    ) -> Result<responses::Dashboard, ClientError> {
        let response = self.post("dashboard", details).await?;
        ok_body(response).await
    }

    pub async fn get_balance(&self) -> Result<responses::Balance, ClientError> {
        let response = self.empty_get("balance").await?;
        ok_body(response).await
    }

    pub async fn bot_create_user(
        &self,
        details: &requests::BotCreateUser,
    ) -> Result<responses::UserCreated, ClientError> {
        let response = self.post("bot/create_user", details).await?;
        ok_body(response).await
    }

    pub async fn bot_deposit(
        &self,
        details: &requests::BotDeposit,
    ) -> Result<responses::Balance, ClientError> {
        let response = self.post("bot/deposit", details).await?;
        ok_body(response).await
    }

    pub async fn bot_place_bid(
        &self,
        details: &requests::BotPlaceBid,
    ) -> Result<responses::Bid, ClientError> {
        let response = self.post("bot/place_bid", details).await?;
        ok_body(response).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An unhandled API error to display, containing response text.
    #[error("{1}")]
    APIError(StatusCode, String),
    #[error("Network error. Please check your connection.")]
    Network(#[from] reqwest::Error),
}

/// Deserialize a successful request into the desired type, or return an
/// appropriate error.
pub async fn ok_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(response.json::<T>().await?)
}

/// Check that an empty response is OK, returning a ClientError if not.
pub async fn ok_empty(response: reqwest::Response) -> Result<(), ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(())
}
