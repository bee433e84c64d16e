//! HTTP feed bridge.
//!
//! Talks JSON to a gateway sitting in front of the message feed and streams
//! media bodies straight to disk. The pipeline is synchronous, so every call
//! blocks on the runtime handle the client was built with. Never call these
//! methods from a runtime worker thread; use `spawn_blocking`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

use super::{
    Channel, ChannelIdentity, DownloadRequest, FeedClient, FeedError, FeedMessage, MessageIter,
};
use crate::types::EnumerationOrder;

/// Deadline for metadata calls (resolve, listing, paging).
const API_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct MessagePage {
    messages: Vec<FeedMessage>,
    #[serde(default)]
    next_offset: Option<i64>,
}

pub struct HttpFeedClient {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
    handle: Handle,
}

impl HttpFeedClient {
    pub fn new(base_url: &str, token: Option<String>, handle: Handle) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("channel-mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
            token,
            handle,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FeedError> {
        let response = self
            .get(path)
            .query(query)
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, API_TIMEOUT))?;
        let response = check_status(response, path)?;
        response
            .json::<T>()
            .await
            .map_err(|e| map_reqwest_error(e, API_TIMEOUT))
    }

    fn fetch_page(
        &self,
        channel_id: i64,
        reverse: bool,
        offset_id: i64,
    ) -> Result<MessagePage, FeedError> {
        let path = format!("/v1/channels/{}/messages", channel_id);
        let query = [
            ("reverse", reverse.to_string()),
            ("offset_id", offset_id.to_string()),
            ("limit", PAGE_SIZE.to_string()),
        ];
        self.handle.block_on(self.get_json(&path, &query))
    }

    async fn stream_media(&self, request: &DownloadRequest<'_>) -> Result<PathBuf, FeedError> {
        let message = request.message;
        let path = format!(
            "/v1/channels/{}/messages/{}/media",
            message.channel_id, message.id
        );
        let response = self
            .get(&path)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;
        let response = check_status(response, &path)?;
        let total = response.content_length();

        let mut file = tokio::fs::File::create(request.dest).await?;
        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::debug!(
                    "Body error for message {} after {} bytes: {}",
                    message.id,
                    received,
                    e
                );
                map_reqwest_error(e, request.timeout)
            })?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(progress) = request.progress {
                progress(received, total);
            }
        }
        file.flush().await?;
        Ok(request.dest.to_path_buf())
    }
}

impl FeedClient for HttpFeedClient {
    fn list_channels(&self) -> Result<Vec<Channel>, FeedError> {
        self.handle.block_on(self.get_json("/v1/channels", &[]))
    }

    fn resolve(&self, identity: &ChannelIdentity) -> Result<Channel, FeedError> {
        self.handle.block_on(self.get_json(
            "/v1/channels/resolve",
            &[("identity", identity.to_string())],
        ))
    }

    fn iterate<'a>(
        &'a self,
        channel: &Channel,
        order: EnumerationOrder,
    ) -> Result<MessageIter<'a>, FeedError> {
        Ok(Box::new(MessagePages {
            client: self,
            channel_id: channel.id,
            reverse: order.is_reversed(),
            buffer: VecDeque::new(),
            offset_id: 0,
            done: false,
        }))
    }

    fn download(&self, request: &DownloadRequest<'_>) -> Result<PathBuf, FeedError> {
        self.handle.block_on(async {
            match tokio::time::timeout(request.timeout, self.stream_media(request)).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout(request.timeout)),
            }
        })
    }
}

/// Lazy page-by-page enumeration. Stops after the first error.
struct MessagePages<'a> {
    client: &'a HttpFeedClient,
    channel_id: i64,
    reverse: bool,
    buffer: VecDeque<FeedMessage>,
    offset_id: i64,
    done: bool,
}

impl Iterator for MessagePages<'_> {
    type Item = Result<FeedMessage, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(mut message) = self.buffer.pop_front() {
                if message.channel_id == 0 {
                    message.channel_id = self.channel_id;
                }
                return Some(Ok(message));
            }
            if self.done {
                return None;
            }
            match self
                .client
                .fetch_page(self.channel_id, self.reverse, self.offset_id)
            {
                Ok(page) => {
                    tracing::debug!(
                        "Fetched {} messages from channel {} at offset {}",
                        page.messages.len(),
                        self.channel_id,
                        self.offset_id
                    );
                    match page.next_offset {
                        Some(next) if !page.messages.is_empty() => self.offset_id = next,
                        _ => self.done = true,
                    }
                    self.buffer.extend(page.messages);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn check_status(response: Response, path: &str) -> Result<Response, FeedError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let wait = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            Err(FeedError::RateLimited { wait })
        }
        StatusCode::NOT_FOUND => Err(FeedError::NotFound(path.to_string())),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Err(FeedError::Timeout(API_TIMEOUT))
        }
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => Err(FeedError::Connection(
            format!("HTTP {} from {}", status.as_u16(), path),
        )),
        _ => Err(FeedError::Other(format!(
            "HTTP {} from {}",
            status.as_u16(),
            path
        ))),
    }
}

fn map_reqwest_error(e: reqwest::Error, deadline: Duration) -> FeedError {
    if e.is_timeout() {
        FeedError::Timeout(deadline)
    } else if e.is_connect() || e.is_request() || e.is_body() {
        FeedError::Connection(e.to_string())
    } else {
        FeedError::Other(e.to_string())
    }
}
