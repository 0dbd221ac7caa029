use serde::{Deserialize, Serialize};

use crate::framer::DONE_MARKER;
use crate::relay::RelayEvent;
use crate::upstream::GenerationOptions;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(rename = "useMonologue", alias = "use_persona", default = "default_true")]
    pub use_persona: bool,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTag {
    Tool,
}

/// JSON payload of one non-terminal downstream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireEvent {
    Tool {
        #[serde(rename = "type")]
        kind: ToolTag,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        id: String,
    },
    Token {
        token: String,
    },
    Error {
        error: String,
    },
}

/// Renders an event as the `data:` payload of one downstream frame.
pub fn encode(event: &RelayEvent) -> String {
    let wire = match event {
        RelayEvent::Done => return DONE_MARKER.to_string(),
        RelayEvent::Token(token) => WireEvent::Token {
            token: token.clone(),
        },
        RelayEvent::Tool(command) => WireEvent::Tool {
            kind: ToolTag::Tool,
            tool: command.tool.clone(),
            symbol: command.symbol.clone(),
            id: command.id.clone(),
        },
        RelayEvent::Error(message) => WireEvent::Error {
            error: message.clone(),
        },
    };
    // Plain string fields only; serialization cannot fail.
    serde_json::to_string(&wire).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ToolCommand;
    use serde_json::json;

    fn value(event: &RelayEvent) -> serde_json::Value {
        serde_json::from_str(&encode(event)).unwrap()
    }

    #[test]
    fn token_frame() {
        assert_eq!(value(&RelayEvent::Token("Hi".into())), json!({"token": "Hi"}));
    }

    #[test]
    fn tool_frame() {
        let event = RelayEvent::Tool(ToolCommand {
            tool: "crypto-chart".into(),
            symbol: Some("DOGE".into()),
            id: "abc".into(),
        });
        assert_eq!(
            value(&event),
            json!({"type": "tool", "tool": "crypto-chart", "symbol": "DOGE", "id": "abc"})
        );

        let bare = RelayEvent::Tool(ToolCommand {
            tool: "market-heatmap".into(),
            symbol: None,
            id: "abc".into(),
        });
        assert_eq!(
            value(&bare),
            json!({"type": "tool", "tool": "market-heatmap", "id": "abc"})
        );
    }

    #[test]
    fn error_and_done_frames() {
        assert_eq!(
            value(&RelayEvent::Error("boom".into())),
            json!({"error": "boom"})
        );
        assert_eq!(encode(&RelayEvent::Done), "[DONE]");
    }

    #[test]
    fn wire_events_parse_back() {
        let tool: WireEvent =
            serde_json::from_str(r#"{"type":"tool","tool":"crypto-news","id":"1"}"#).unwrap();
        assert!(matches!(tool, WireEvent::Tool { symbol: None, .. }));

        let token: WireEvent = serde_json::from_str(r#"{"token":"x"}"#).unwrap();
        assert_eq!(token, WireEvent::Token { token: "x".into() });

        assert!(serde_json::from_str::<WireEvent>(r#"{"other":1}"#).is_err());
    }

    #[test]
    fn chat_request_defaults() {
        let request: ChatRequest = serde_json::from_str(r#"{"prompt":"gm"}"#).unwrap();
        assert!(request.use_persona);
        assert!(request.options.max_tokens.is_none());

        let request: ChatRequest =
            serde_json::from_str(r#"{"prompt":"gm","useMonologue":false,"max_tokens":12}"#)
                .unwrap();
        assert!(!request.use_persona);
        assert_eq!(request.options.max_tokens, Some(12));
    }
}
