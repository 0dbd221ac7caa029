//! Shared fixtures: an in-process completion service and relay wiring.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use finn_relay::commands::CommandRegistry;
use finn_relay::events::{EventLogger, LogError, PromptRecord};
use finn_relay::gate::StaticAccessGate;
use finn_relay::identity::{AccessEntry, AccessTable, CallerIdentity};
use finn_relay::prompt::PromptBuilder;
use finn_relay::relay::{RelayController, StreamRequest};
use finn_relay::server::ServerState;
use finn_relay::upstream::{GenerationOptions, GenerationParameters, UpstreamClient, UpstreamConfig};
use futures::StreamExt;

pub const UPSTREAM_KEY: &str = "test-upstream-key";
pub const ENTITLED_TOKEN: &str = "entitled-token";
pub const UNENTITLED_TOKEN: &str = "unentitled-token";

/// What the mock completion service does with a request.
#[derive(Clone)]
pub enum Script {
    /// Stream each chunk after its delay.
    Chunks(Vec<(Duration, &'static str)>),
    /// Respond with a fixed status and body.
    Status(u16, &'static str),
}

impl Script {
    pub fn immediate(chunks: &[&'static str]) -> Self {
        Script::Chunks(chunks.iter().map(|c| (Duration::ZERO, *c)).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub authorization: Option<String>,
    pub request_id: Option<String>,
    pub body: Option<serde_json::Value>,
}

struct MockState {
    script: Script,
    hits: AtomicUsize,
    body_dropped: Arc<AtomicBool>,
    captured: Mutex<Captured>,
}

pub struct MockUpstream {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn captured(&self) -> Captured {
        self.state.captured.lock().unwrap().clone()
    }

    pub fn body_dropped(&self) -> bool {
        self.state.body_dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn completions(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    *state.captured.lock().unwrap() = Captured {
        authorization: header("authorization"),
        request_id: header("x-request-id"),
        body: serde_json::from_slice(&body).ok(),
    };

    match &state.script {
        Script::Status(code, body) => {
            (StatusCode::from_u16(*code).unwrap(), body.to_string()).into_response()
        }
        Script::Chunks(chunks) => {
            let flag = DropFlag(Arc::clone(&state.body_dropped));
            let stream = futures::stream::iter(chunks.clone()).then(move |(delay, text)| {
                let _keep = &flag;
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(Bytes::from_static(text.as_bytes()))
                }
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream))
                .unwrap()
        }
    }
}

pub async fn spawn_upstream(script: Script) -> MockUpstream {
    let state = Arc::new(MockState {
        script,
        hits: AtomicUsize::new(0),
        body_dropped: Arc::new(AtomicBool::new(false)),
        captured: Mutex::new(Captured::default()),
    });
    let app = axum::Router::new()
        .route("/completions", post(completions))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream {
        base_url: format!("http://{addr}"),
        state,
    }
}

/// Logger that keeps every record in memory.
#[derive(Default)]
pub struct RecordingLogger {
    pub records: Mutex<Vec<PromptRecord>>,
}

#[async_trait]
impl EventLogger for RecordingLogger {
    async fn record_prompt(&self, record: PromptRecord) -> Result<(), LogError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Logger that always fails.
pub struct FailingLogger;

#[async_trait]
impl EventLogger for FailingLogger {
    async fn record_prompt(&self, _record: PromptRecord) -> Result<(), LogError> {
        Err(LogError::Io(std::io::Error::other("disk full")))
    }
}

pub fn access_table() -> Arc<AccessTable> {
    Arc::new(AccessTable::new([
        AccessEntry {
            token: ENTITLED_TOKEN.into(),
            user_id: "user-entitled".into(),
            email: Some("finn@example.com".into()),
            entitled: true,
        },
        AccessEntry {
            token: UNENTITLED_TOKEN.into(),
            user_id: "user-plain".into(),
            email: None,
            entitled: false,
        },
    ]))
}

pub struct RelayOptions {
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub logger: Arc<dyn EventLogger>,
}

impl RelayOptions {
    pub fn upstream(base_url: &str) -> Self {
        Self {
            base_url: Some(base_url.to_string()),
            timeout: Duration::from_secs(5),
            logger: Arc::new(RecordingLogger::default()),
        }
    }
}

pub fn relay(access: Arc<AccessTable>, options: RelayOptions) -> RelayController {
    RelayController::new(
        Arc::new(StaticAccessGate::new(access)),
        options.logger,
        Arc::new(CommandRegistry::builtin()),
        PromptBuilder::new("You are Finn."),
        UpstreamClient::new(UpstreamConfig {
            base_url: options.base_url,
            api_key: Some(UPSTREAM_KEY.into()),
            timeout: options.timeout,
        }),
        GenerationParameters::default(),
    )
}

pub fn server_state(options: RelayOptions) -> Arc<ServerState> {
    let access = access_table();
    Arc::new(ServerState {
        relay: relay(Arc::clone(&access), options),
        access,
    })
}

pub fn caller(user_id: &str) -> CallerIdentity {
    CallerIdentity {
        user_id: user_id.into(),
        email: None,
        ip_address: "127.0.0.1".into(),
        user_agent: "tests".into(),
    }
}

pub fn stream_request(user_id: &str, prompt: &str) -> StreamRequest {
    StreamRequest {
        identity: caller(user_id),
        prompt: prompt.into(),
        options: GenerationOptions::default(),
        use_persona: true,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
