use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use finn_relay::client::{ClientConfig, ClientEvent, RelayClient};
use finn_relay::config::{ChatArgs, Cli, Command, ServeArgs};
use finn_relay::protocol::{ChatRequest, WireEvent};
use finn_relay::server;
use finn_relay::upstream::GenerationOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finn_relay=info,audit=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => chat(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let state = args.build_state()?;
    info!(
        users = state.access.len(),
        persona = ?args.persona,
        timeout_secs = args.timeout_secs,
        "relay configured"
    );
    if args.upstream_url.is_none() || args.upstream_key.is_none() {
        warn!("upstream URL or key not set; generation requests will fail");
    }
    server::run(&args.listen, Arc::new(state)).await
}

async fn chat(args: ChatArgs) -> anyhow::Result<()> {
    let client = RelayClient::new(ClientConfig {
        base_url: args.url,
        token: args.token,
    });

    let request = ChatRequest {
        prompt: args.prompt,
        use_persona: !args.no_persona,
        options: GenerationOptions {
            max_tokens: args.max_tokens,
            temperature: args.temperature,
            ..Default::default()
        },
    };

    let mut failed = None;
    let request_id = client
        .stream_chat(&request, |event| {
            match event {
                ClientEvent::Event(WireEvent::Token { token }) => {
                    print!("{token}");
                    let _ = std::io::stdout().flush();
                }
                ClientEvent::Event(WireEvent::Tool { tool, symbol, id, .. }) => {
                    println!("[tool {tool} {} ({id})]", symbol.unwrap_or_default());
                }
                ClientEvent::Event(WireEvent::Error { error }) => failed = Some(error),
                ClientEvent::Done => println!(),
            }
            async {}
        })
        .await?;

    info!(request_id = request_id.as_deref().unwrap_or("-"), "stream finished");
    match failed {
        Some(error) => anyhow::bail!("relay error: {error}"),
        None => Ok(()),
    }
}
