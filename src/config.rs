use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::commands::CommandRegistry;
use crate::events::{EventLogger, JsonlEventLogger, TracingEventLogger};
use crate::gate::StaticAccessGate;
use crate::identity::AccessTable;
use crate::prompt::{Persona, PromptBuilder};
use crate::relay::RelayController;
use crate::server::ServerState;
use crate::upstream::{GenerationParameters, UpstreamClient, UpstreamConfig};

#[derive(Debug, Parser)]
#[command(name = "finn-relay", version, about = "Token-streaming chat relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Send one prompt to a running relay and print the reply.
    Chat(ChatArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, env = "FINN_RELAY_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: String,

    /// Base URL of the completion service; `/completions` is appended.
    #[arg(long, env = "RUNPOD_API_URL")]
    pub upstream_url: Option<String>,

    #[arg(long, env = "RUNPOD_API_KEY", hide_env_values = true)]
    pub upstream_key: Option<String>,

    #[arg(long, env = "FINN_RELAY_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// JSON array of `{token, user_id, email, entitled}` entries.
    #[arg(long, env = "FINN_RELAY_ACCESS_FILE")]
    pub access_file: PathBuf,

    /// Append prompt audit records to this JSON-lines file instead of the log.
    #[arg(long, env = "FINN_RELAY_AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    #[arg(long, env = "FINN_RELAY_PERSONA", value_enum, default_value = "monologue")]
    pub persona: Persona,

    /// Read the persona preamble from a file, overriding `--persona`.
    #[arg(long, env = "FINN_RELAY_PERSONA_FILE")]
    pub persona_file: Option<PathBuf>,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

#[derive(Debug, Clone, Args)]
pub struct GenerationArgs {
    #[arg(long, env = "FINN_RELAY_MODEL", default_value = "CryptoJoker69/0xFinn.exe")]
    pub model: String,

    #[arg(long, default_value_t = 200)]
    pub max_tokens: u32,

    #[arg(long, default_value_t = 0.6)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.75)]
    pub top_p: f32,

    #[arg(long, default_value_t = 50)]
    pub top_k: u32,

    #[arg(long, default_value_t = 1.15)]
    pub repetition_penalty: f32,

    #[arg(long, default_value_t = 0.1)]
    pub frequency_penalty: f32,

    #[arg(long, default_value_t = 0.05)]
    pub presence_penalty: f32,

    /// Stop sequence; repeat for several.
    #[arg(long = "stop")]
    pub stop: Vec<String>,
}

impl From<GenerationArgs> for GenerationParameters {
    fn from(args: GenerationArgs) -> Self {
        Self {
            model: args.model,
            max_tokens: args.max_tokens,
            temperature: args.temperature,
            top_p: args.top_p,
            top_k: args.top_k,
            repetition_penalty: args.repetition_penalty,
            frequency_penalty: args.frequency_penalty,
            presence_penalty: args.presence_penalty,
            stop: args.stop,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ChatArgs {
    #[arg(long, env = "FINN_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    pub url: String,

    #[arg(long, env = "FINN_RELAY_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Send the prompt without the persona preamble.
    #[arg(long)]
    pub no_persona: bool,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f32>,

    pub prompt: String,
}

impl ServeArgs {
    pub fn prompt_builder(&self) -> anyhow::Result<PromptBuilder> {
        match &self.persona_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading persona file {}", path.display()))?;
                Ok(PromptBuilder::new(text))
            }
            None => Ok(PromptBuilder::from_persona(self.persona)),
        }
    }

    /// Wires the relay and its collaborators from the parsed options.
    pub fn build_state(&self) -> anyhow::Result<ServerState> {
        let access = Arc::new(
            AccessTable::load(&self.access_file)
                .with_context(|| format!("loading access file {}", self.access_file.display()))?,
        );

        let logger: Arc<dyn EventLogger> = match &self.audit_log {
            Some(path) => Arc::new(JsonlEventLogger::new(path)),
            None => Arc::new(TracingEventLogger),
        };

        let upstream = UpstreamClient::new(UpstreamConfig {
            base_url: self.upstream_url.clone(),
            api_key: self.upstream_key.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        });

        let relay = RelayController::new(
            Arc::new(StaticAccessGate::new(Arc::clone(&access))),
            logger,
            Arc::new(CommandRegistry::builtin()),
            self.prompt_builder()?,
            upstream,
            self.generation.clone().into(),
        );

        Ok(ServerState { relay, access })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_generation_defaults() {
        let cli = Cli::try_parse_from(["finn-relay", "serve", "--access-file", "access.json"])
            .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.persona, Persona::Monologue);
        let params: GenerationParameters = args.generation.into();
        assert_eq!(params, GenerationParameters::default());
    }

    #[test]
    fn chat_arguments() {
        let cli = Cli::try_parse_from([
            "finn-relay",
            "chat",
            "--token",
            "t",
            "--no-persona",
            "gm",
        ])
        .unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.prompt, "gm");
        assert!(args.no_persona);
    }

    #[test]
    fn persona_file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.txt");
        std::fs::write(&path, "custom persona\n").unwrap();

        let cli = Cli::try_parse_from([
            "finn-relay",
            "serve",
            "--access-file",
            "access.json",
            "--persona",
            "market",
            "--persona-file",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let builder = args.prompt_builder().unwrap();
        assert_eq!(builder.build("hi", true), "<|begin_of_text|>\ncustom persona\n\nhi");
    }
}
