use std::future::Future;

use futures::StreamExt;
use reqwest::Client as HttpClient;

use crate::error::REQUEST_ID_HEADER;
use crate::framer::{Frame, decode_stream};
use crate::protocol::{ChatRequest, WireEvent};

pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
}

/// Downstream event as seen by a relay consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Event(WireEvent),
    Done,
}

pub struct RelayClient {
    base_url: String,
    token: String,
    http: HttpClient,
}

type ClientResult<T> = anyhow::Result<T>;

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts one chat request and feeds every downstream event to `on_event`.
    ///
    /// Returns the relay's request id once the stream has ended.
    pub async fn stream_chat<F, Fut>(
        &self,
        request: &ChatRequest,
        mut on_event: F,
    ) -> ClientResult<Option<String>>
    where
        F: FnMut(ClientEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .bearer_auth(&self.token)
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "relay rejected request {}: {} - {}",
                request_id.as_deref().unwrap_or("-"),
                status,
                body
            );
        }

        let body = response.bytes_stream().boxed();
        let mut frames = Box::pin(decode_stream(body, |payload| {
            serde_json::from_str::<WireEvent>(payload)
        }));

        while let Some(frame) = frames.next().await {
            match frame? {
                Frame::Data(event) => on_event(ClientEvent::Event(event)).await,
                Frame::Done => {
                    on_event(ClientEvent::Done).await;
                    break;
                }
            }
        }

        Ok(request_id)
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
