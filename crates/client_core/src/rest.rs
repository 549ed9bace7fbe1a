use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::UserId,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{MessagePayload, PersistMessageRequest},
};
use url::Url;

use crate::error::ClientError;

/// Message persistence owned by the external service.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn fetch_history(&self, peer: &UserId) -> Result<Vec<MessagePayload>>;
    async fn persist_message(&self, request: PersistMessageRequest) -> Result<()>;
    async fn delete_conversation(&self, peer: &UserId) -> Result<()>;
    async fn block_user(&self, peer: &UserId) -> Result<()>;
}

pub struct MissingMessageApi;

#[async_trait]
impl MessageApi for MissingMessageApi {
    async fn fetch_history(&self, peer: &UserId) -> Result<Vec<MessagePayload>> {
        Err(anyhow!("message service unavailable: history for {peer}"))
    }

    async fn persist_message(&self, _request: PersistMessageRequest) -> Result<()> {
        Err(anyhow!("message service unavailable"))
    }

    async fn delete_conversation(&self, peer: &UserId) -> Result<()> {
        Err(anyhow!("message service unavailable: delete {peer}"))
    }

    async fn block_user(&self, peer: &UserId) -> Result<()> {
        Err(anyhow!("message service unavailable: block {peer}"))
    }
}

pub struct HttpMessageApi {
    http: Client,
    server_url: Url,
    user_id: UserId,
}

impl HttpMessageApi {
    pub fn new(server_url: &str, user_id: UserId) -> Result<Self> {
        let server_url = Url::parse(server_url.trim_end_matches('/'))
            .with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self {
            http: Client::new(),
            server_url,
            user_id,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry a path: {}", self.server_url))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("user_id", self.user_id.as_str());
        Ok(url)
    }
}

/// Turns a non-success response into [`ClientError::Api`], preferring the
/// service's own error body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let exception = match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => ApiException::from(api_error),
        Err(_) if body.trim().is_empty() => {
            ApiException::new(ErrorCode::from_status(status.as_u16()), status.to_string())
        }
        Err(_) => ApiException::new(ErrorCode::from_status(status.as_u16()), body),
    };
    Err(ClientError::Api(exception).into())
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_history(&self, peer: &UserId) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&["messages", peer.as_str()])?;
        let response = self.http.get(url).send().await?;
        let messages = check(response)
            .await?
            .json()
            .await
            .context("invalid history response")?;
        Ok(messages)
    }

    async fn persist_message(&self, request: PersistMessageRequest) -> Result<()> {
        let url = self.endpoint(&["messages"])?;
        let response = self.http.post(url).json(&request).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_conversation(&self, peer: &UserId) -> Result<()> {
        let url = self.endpoint(&["conversations", peer.as_str()])?;
        let response = self.http.delete(url).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn block_user(&self, peer: &UserId) -> Result<()> {
        let url = self.endpoint(&["users", peer.as_str(), "block"])?;
        let response = self.http.post(url).send().await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
