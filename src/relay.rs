//! The token-streaming relay.
//!
//! A request moves through `Authorizing -> (Denied | ToolMatched |
//! Generating) -> Streaming -> Terminated`. Denial and misconfiguration are
//! returned as errors before any event exists; once a [`RelayStream`] has
//! been handed out it always ends with exactly one `Done` or `Error`.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::commands::{CommandRegistry, ToolCommand};
use crate::error::RelayError;
use crate::events::{EventLogger, PromptRecord};
use crate::framer::Frame;
use crate::gate::{AccessDecision, AccessGate};
use crate::identity::CallerIdentity;
use crate::prompt::{self, PromptBuilder};
use crate::upstream::{GenerationOptions, GenerationParameters, UpstreamClient, UpstreamFrames};

/// Correlation identifier for one inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub identity: CallerIdentity,
    pub prompt: String,
    pub options: GenerationOptions,
    pub use_persona: bool,
}

/// One unit of the downstream event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Token(String),
    Tool(ToolCommand),
    Error(String),
    Done,
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Done | RelayEvent::Error(_))
    }
}

pub type RelayStream = BoxStream<'static, RelayEvent>;

pub struct RelayController {
    gate: Arc<dyn AccessGate>,
    logger: Arc<dyn EventLogger>,
    commands: Arc<CommandRegistry>,
    prompts: PromptBuilder,
    upstream: UpstreamClient,
    defaults: GenerationParameters,
}

impl RelayController {
    pub fn new(
        gate: Arc<dyn AccessGate>,
        logger: Arc<dyn EventLogger>,
        commands: Arc<CommandRegistry>,
        prompts: PromptBuilder,
        upstream: UpstreamClient,
        defaults: GenerationParameters,
    ) -> Self {
        Self {
            gate,
            logger,
            commands,
            prompts,
            upstream,
            defaults,
        }
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Authorizes the request and returns the event stream for it.
    pub async fn start(
        &self,
        request: StreamRequest,
        request_id: &RequestId,
    ) -> Result<RelayStream, RelayError> {
        let span = info_span!(
            "relay",
            request_id = %request_id,
            user_id = %request.identity.user_id
        );
        self.start_in_span(request, request_id, span.clone())
            .instrument(span)
            .await
    }

    async fn start_in_span(
        &self,
        request: StreamRequest,
        request_id: &RequestId,
        span: Span,
    ) -> Result<RelayStream, RelayError> {
        let decision = self
            .gate
            .authorize(&request.identity)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "access gate failed");
                AccessDecision::deny(err.to_string())
            });
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "access denied".to_string());
            warn!(%reason, "access denied");
            return Err(RelayError::AccessDenied(reason));
        }

        let text = prompt::sanitize(&request.prompt);
        if text.is_empty() {
            return Err(RelayError::InvalidRequest("prompt is empty".into()));
        }

        if let Some(found) = self.commands.detect(&text) {
            let command = found.into_command(request_id.as_str());
            info!(tool = %command.tool, symbol = ?command.symbol, "tool command matched");
            return Ok(tool_events(command));
        }

        let prompt = self.prompts.build(&text, request.use_persona);
        let params = self.defaults.with_options(&request.options);
        debug!(%prompt, use_persona = request.use_persona, "final prompt");

        self.record_detached(PromptRecord::new(
            request_id.as_str(),
            request.identity,
            &text,
            prompt.clone(),
        ));

        if let Err(err) = self.upstream.ensure_configured() {
            error!(error = %err, "upstream misconfigured");
            return Err(err);
        }

        let generation = Generation {
            phase: Phase::Connect {
                upstream: self.upstream.clone(),
                prompt,
                params,
            },
            request_id: request_id.clone(),
            tokens: 0,
            guard: CompletionGuard::new(span),
        };
        Ok(generation.into_stream())
    }

    fn record_detached(&self, record: PromptRecord) {
        let logger = Arc::clone(&self.logger);
        tokio::spawn(
            async move {
                if let Err(err) = logger.record_prompt(record).await {
                    warn!(error = %err, "failed to record prompt");
                }
            }
            .instrument(Span::current()),
        );
    }
}

fn tool_events(command: ToolCommand) -> RelayStream {
    futures::stream::iter([RelayEvent::Tool(command), RelayEvent::Done]).boxed()
}

enum Phase {
    Connect {
        upstream: UpstreamClient,
        prompt: String,
        params: GenerationParameters,
    },
    Streaming(UpstreamFrames),
    Terminated,
}

/// Logs a cancellation when a stream is dropped before its terminal event.
struct CompletionGuard {
    completed: bool,
    span: Span,
}

impl CompletionGuard {
    fn new(span: Span) -> Self {
        Self {
            completed: false,
            span,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.completed {
            let _entered = self.span.enter();
            info!("client went away; upstream call cancelled");
        }
    }
}

struct Generation {
    phase: Phase,
    request_id: RequestId,
    tokens: usize,
    guard: CompletionGuard,
}

impl Generation {
    fn into_stream(self) -> RelayStream {
        futures::stream::unfold(self, |mut generation| async move {
            let span = generation.guard.span.clone();
            let event = generation.advance().instrument(span).await?;
            Some((event, generation))
        })
        .boxed()
    }

    async fn advance(&mut self) -> Option<RelayEvent> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Terminated) {
                Phase::Terminated => return None,
                Phase::Connect {
                    upstream,
                    prompt,
                    params,
                } => match upstream.open(&prompt, &params, self.request_id.as_str()).await {
                    Ok(frames) => {
                        debug!("upstream stream opened");
                        self.phase = Phase::Streaming(frames);
                    }
                    Err(err) => return Some(self.fail(err)),
                },
                Phase::Streaming(mut frames) => match frames.next().await {
                    Some(Ok(Frame::Data(chunk))) => {
                        self.phase = Phase::Streaming(frames);
                        if let Some(text) = chunk.text().filter(|text| !text.is_empty()) {
                            self.tokens += 1;
                            debug!(order = self.tokens, token = ?text, "token");
                            return Some(RelayEvent::Token(text.to_string()));
                        }
                    }
                    Some(Ok(Frame::Done)) => return Some(self.finish(true)),
                    Some(Err(err)) => return Some(self.fail(err)),
                    None => return Some(self.finish(false)),
                },
            }
        }
    }

    fn finish(&mut self, saw_marker: bool) -> RelayEvent {
        self.guard.complete();
        info!(tokens = self.tokens, saw_marker, "stream complete");
        RelayEvent::Done
    }

    fn fail(&mut self, err: RelayError) -> RelayEvent {
        self.guard.complete();
        error!(error = %err, tokens = self.tokens, "stream failed");
        RelayEvent::Error(err.to_string())
    }
}
