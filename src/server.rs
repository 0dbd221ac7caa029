use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::commands::CommandDefinition;
use crate::error::{REQUEST_ID_HEADER, RelayError, RequestFailure};
use crate::identity::AccessTable;
use crate::protocol::{self, ChatRequest};
use crate::relay::{RelayController, RequestId, StreamRequest};

pub struct ServerState {
    pub relay: RelayController,
    pub access: Arc<AccessTable>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/commands", get(list_commands))
        .route("/api/chat", post(chat))
        .with_state(state)
}

pub async fn run(listen: &str, state: Arc<ServerState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> anyhow::Result<()> {
    info!("finn-relay listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn list_commands(State(state): State<Arc<ServerState>>) -> Json<Vec<CommandDefinition>> {
    Json(state.relay.commands().commands().to_vec())
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RequestFailure> {
    let request_id = RequestId::generate();
    info!(%request_id, "chat request received");

    let fail = |error: RelayError| {
        warn!(%request_id, %error, status = error.status().as_u16(), "chat request rejected");
        RequestFailure {
            request_id: request_id.clone(),
            error,
        }
    };

    let identity = state.access.identify(&headers).map_err(fail)?;

    let payload: ChatRequest = serde_json::from_slice(&body)
        .map_err(|err| fail(RelayError::InvalidRequest(err.to_string())))?;
    if payload.prompt.trim().is_empty() {
        return Err(fail(RelayError::InvalidRequest(
            "missing or invalid prompt".into(),
        )));
    }

    let request = StreamRequest {
        identity,
        prompt: payload.prompt,
        options: payload.options,
        use_persona: payload.use_persona,
    };

    let events = state.relay.start(request, &request_id).await.map_err(fail)?;

    let stream = events.map(|event| {
        Ok::<Event, Infallible>(Event::default().data(protocol::encode(&event)))
    });
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );

    let mut response = sse.into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform"));
    response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response_headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}
