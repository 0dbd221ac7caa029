use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};

use crate::error::{REQUEST_ID_HEADER, RelayError};
use crate::framer::{Frame, decode_stream};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParameters {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            model: "CryptoJoker69/0xFinn.exe".to_string(),
            max_tokens: 200,
            temperature: 0.6,
            top_p: 0.75,
            top_k: 50,
            repetition_penalty: 1.15,
            frequency_penalty: 0.1,
            presence_penalty: 0.05,
            stop: Vec::new(),
        }
    }
}

/// Per-request overrides accepted from callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
}

impl GenerationParameters {
    pub fn with_options(&self, options: &GenerationOptions) -> Self {
        Self {
            model: options.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: options.max_tokens.unwrap_or(self.max_tokens),
            temperature: options.temperature.unwrap_or(self.temperature),
            top_p: options.top_p.unwrap_or(self.top_p),
            repetition_penalty: options
                .repetition_penalty
                .unwrap_or(self.repetition_penalty),
            ..self.clone()
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    #[serde(flatten)]
    params: &'a GenerationParameters,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: Option<String>,
}

impl CompletionChunk {
    pub fn text(&self) -> Option<&str> {
        self.choices.first()?.text.as_deref()
    }
}

pub type UpstreamFrames = BoxStream<'static, Result<Frame<CompletionChunk>, RelayError>>;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Streaming client for the completion service.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config
                .base_url
                .map(|url| normalize_base_url(&url))
                .filter(|url| !url.is_empty()),
            api_key: config.api_key.filter(|key| !key.is_empty()),
            timeout: config.timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn ensure_configured(&self) -> Result<(), RelayError> {
        self.credentials().map(|_| ())
    }

    fn credentials(&self) -> Result<(&str, &str), RelayError> {
        match (&self.base_url, &self.api_key) {
            (Some(url), Some(key)) => Ok((url.as_str(), key.as_str())),
            (None, _) => Err(RelayError::UpstreamMisconfigured(
                "upstream URL is not set".into(),
            )),
            (_, None) => Err(RelayError::UpstreamMisconfigured(
                "upstream API key is not set".into(),
            )),
        }
    }

    /// Opens the completion stream.
    ///
    /// The timeout is a deadline for the whole exchange, including every
    /// subsequent chunk read. Dropping the returned stream aborts the call.
    pub async fn open(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        request_id: &str,
    ) -> Result<UpstreamFrames, RelayError> {
        let (base_url, api_key) = self.credentials()?;
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;

        let request = CompletionRequest {
            prompt,
            params,
            stream: true,
        };

        let send = self
            .http
            .post(format!("{}/completions", base_url))
            .bearer_auth(api_key)
            .header(REQUEST_ID_HEADER, request_id)
            .json(&request)
            .send();

        let response = timeout_at(deadline, send)
            .await
            .map_err(|_| RelayError::UpstreamTimeout(timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = timeout_at(deadline, response.text())
                .await
                .map_err(|_| RelayError::UpstreamTimeout(timeout))?
                .unwrap_or_default();
            return Err(RelayError::UpstreamProtocol {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }

        let body = response.bytes_stream().boxed();
        let bounded = futures::stream::unfold(body, move |mut inner| async move {
            match timeout_at(deadline, inner.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), inner)),
                Ok(Some(Err(err))) => Some((Err(RelayError::UpstreamTransport(err)), inner)),
                Ok(None) => None,
                Err(_) => Some((Err(RelayError::UpstreamTimeout(timeout)), inner)),
            }
        });

        let frames = decode_stream(bounded.boxed(), |payload| {
            serde_json::from_str::<CompletionChunk>(payload)
        });
        Ok(frames.boxed())
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// Picks the message out of an upstream error body.
///
/// JSON bodies yield their `error` (or `error.message`) or `message` field,
/// otherwise the body itself. Unparseable bodies fall back to the status text.
fn error_message(status: StatusCode, body: &str) -> String {
    let status_text = || {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string())
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return status_text();
    };

    let field = |value: &serde_json::Value| value.as_str().map(str::to_string);
    match &value {
        serde_json::Value::String(message) => message.clone(),
        serde_json::Value::Object(map) => map
            .get("error")
            .and_then(|error| field(error).or_else(|| error.get("message").and_then(field)))
            .or_else(|| map.get("message").and_then(field))
            .unwrap_or_else(|| body.trim().to_string()),
        _ => body.trim().to_string(),
    }
}
