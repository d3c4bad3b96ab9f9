use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::Stream;
use serde::Serialize;
use std::pin::Pin;
use tracing::{Level, event, instrument};

use crate::message::HistoryTurn;

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Raw response body, chunked as it arrives.
pub type ByteStream = BoxedStream<anyhow::Result<Bytes>>;

/// Body of the outbound chat call.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<HistoryTurn>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ChatRequest {
    /// Copy safe to write to logs
    pub fn redacted(&self) -> Self {
        ChatRequest {
            api_key: self.api_key.as_ref().map(|_| "<redacted>".to_string()),
            ..self.clone()
        }
    }
}

/// Opens the assistant's response stream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> anyhow::Result<ByteStream>;

    /// Backend readiness information, if the transport exposes any.
    async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        Err(anyhow::anyhow!("stats are not available on this transport"))
    }
}

/// HTTP transport against the storefront API.
///
/// The client keeps cookies, since the backend identifies the shopper by
/// session cookie when deciding between `auth_required` and a cart update.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        HttpTransport {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn stream_url(&self) -> String {
        format!("{}/chat/stream/", self.base_url)
    }

    fn stats_url(&self) -> String {
        format!("{}/chat/stats/", self.base_url)
    }
}

async fn error_for_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(anyhow::anyhow!(
        "Request failed with status {}: {}",
        status,
        error_body
    ))
}

#[async_trait]
impl ChatTransport for HttpTransport {
    #[instrument(level = "trace", skip(self, request), fields(url = %self.stream_url()))]
    async fn open_stream(&self, request: &ChatRequest) -> anyhow::Result<ByteStream> {
        let response = self
            .client
            .post(self.stream_url())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = error_for_status(response).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from));
        Ok(Box::pin(bytes))
    }

    #[instrument(level = "trace", skip(self))]
    async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        let response = self.client.get(self.stats_url()).send().await?;
        let text = error_for_status(response).await?.text().await?;
        event!(Level::TRACE, response = text);
        Ok(serde_json::from_str(&text)?)
    }
}
