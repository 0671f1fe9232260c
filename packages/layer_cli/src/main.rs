use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use layer_client::{Client, ClientConfig, Frame, StaticSession, methods};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod config;

use config::{FileConfig, load_config};

#[derive(Parser)]
#[command(name = "layer")]
#[command(about = "Tail change events and issue calls over the Layer websocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding layer.toml (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Application id
    #[arg(long, global = true)]
    app_id: Option<String>,

    /// Websocket endpoint
    #[arg(long, global = true)]
    websocket_url: Option<String>,

    /// Pre-issued session token
    #[arg(long, global = true, env = "LAYER_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every change notification until interrupted
    Listen,
    /// Read the server-side counter
    Counter,
    /// Create a conversation
    CreateConversation(CreateConversationArgs),
    /// Send a text message
    Send(SendArgs),
}

#[derive(Parser)]
struct CreateConversationArgs {
    /// Participant user id (repeatable)
    #[arg(long = "participant", required = true)]
    participants: Vec<String>,

    /// Reuse the existing conversation with exactly these participants
    #[arg(long)]
    distinct: bool,
}

#[derive(Parser)]
struct SendArgs {
    /// Conversation id or UUID
    #[arg(long)]
    conversation: String,

    /// Message text
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "layer_cli=debug,layer_client=debug,info"
    } else {
        "layer_cli=info,layer_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(&cli.config_dir)
        .extract()
        .context("failed to load configuration")?;
    let token = cli
        .session_token
        .clone()
        .or(file_config.auth.session_token.clone())
        .context("no session token: pass --session-token or set LAYER_SESSION_TOKEN")?;
    let client = Client::new(client_config(&cli, file_config), StaticSession::new(token));

    let result = match cli.command {
        Commands::Listen => listen(&client).await,
        Commands::Counter => counter(&client).await,
        Commands::CreateConversation(args) => create_conversation(&client, args).await,
        Commands::Send(args) => send(&client, args).await,
    };
    client.close().await;
    result
}

/// CLI flags win over layer.toml and env vars.
fn client_config(cli: &Cli, file_config: FileConfig) -> ClientConfig {
    let mut config = file_config.client;
    if let Some(app_id) = &cli.app_id {
        config.app_id = app_id.clone();
    }
    if let Some(url) = &cli.websocket_url {
        config.websocket_url = url.clone();
    }
    config
}

async fn print_frame(frame: Arc<Frame>) {
    match frame.encode() {
        Ok(text) => println!("{text}"),
        Err(e) => warn!(error = %e, "cannot print frame"),
    }
}

async fn listen(client: &Client) -> Result<()> {
    for key in methods::change_keys() {
        client.subscribe(&key, print_frame).await;
    }
    client
        .on_connected(|_frame: Arc<Frame>| async {
            info!("connected, waiting for changes");
        })
        .await;

    tokio::select! {
        result = client.listen() => result.context("receive loop failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}

async fn counter(client: &Client) -> Result<()> {
    let payload = client
        .read_counter()
        .await
        .context("Counter.read failed")?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn create_conversation(client: &Client, args: CreateConversationArgs) -> Result<()> {
    let conversation = client
        .create_conversation(args.participants, args.distinct, None)
        .await
        .context("Conversation.create failed")?;
    println!("{}", serde_json::to_string_pretty(&conversation)?);
    Ok(())
}

async fn send(client: &Client, args: SendArgs) -> Result<()> {
    let message = client
        .send_text_message(&args.conversation, args.text)
        .await
        .context("Message.create failed")?;
    info!(conversation = %args.conversation, "message sent");
    println!("{}", message.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_conversation() {
        let cli = Cli::try_parse_from([
            "layer",
            "create-conversation",
            "--participant",
            "frodo",
            "--participant",
            "sam",
            "--distinct",
        ])
        .unwrap();
        match cli.command {
            Commands::CreateConversation(args) => {
                assert_eq!(args.participants, vec!["frodo", "sam"]);
                assert!(args.distinct);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn create_conversation_needs_a_participant() {
        assert!(Cli::try_parse_from(["layer", "create-conversation"]).is_err());
    }

    #[test]
    fn flags_override_file_config() {
        let cli = Cli::try_parse_from([
            "layer",
            "--websocket-url",
            "ws://127.0.0.1:9000",
            "send",
            "--conversation",
            "c1",
            "hello",
        ])
        .unwrap();
        let mut file_config = FileConfig::default();
        file_config.client.app_id = "from-file".to_string();

        let config = client_config(&cli, file_config);
        assert_eq!(config.websocket_url, "ws://127.0.0.1:9000");
        assert_eq!(config.app_id, "from-file");
    }
}
