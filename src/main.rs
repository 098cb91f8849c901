use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use embedchat::config::WidgetConfig;
use embedchat::identity::IdentityStore;
use embedchat::protocol::FinalResponse;
use embedchat::stream::{
    ResponseRequest, StreamObserver, StreamingResponseClient, WireChatMessage,
};
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "embedchat")]
#[command(version = "0.1.0")]
#[command(about = "Streaming chat client for the embedchat backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and stream the reply
    Send { text: String },
    /// Print the stored conversation's history
    History,
    /// Forget the stored conversation and start fresh
    Reset,
}

/// Observer that prints deltas as they arrive.
struct PrintObserver;

impl StreamObserver for PrintObserver {
    fn on_delta(&mut self, delta: &str, _accumulated: &str) {
        print!("{delta}");
        let _ = std::io::stdout().flush();
    }

    fn on_control(&mut self, escalate: bool, reason: Option<&str>) {
        if escalate {
            eprintln!("\n[escalating to a human agent{}]", match reason {
                Some(reason) => format!(": {reason}"),
                None => String::new(),
            });
        }
    }

    fn on_final(&mut self, _response: &FinalResponse) {
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = WidgetConfig::load()?;
    if !config.is_configured() {
        bail!("no tenant_id configured; edit ~/.embedchat/config.toml");
    }
    let identity = IdentityStore::new(&config.tenant_id)?;

    match cli.command {
        Commands::Send { text } => {
            let client = StreamingResponseClient::new(&config, identity.clone());
            let request = ResponseRequest {
                messages: vec![WireChatMessage {
                    role: "user".to_string(),
                    content: text,
                }],
                conversation_id: identity.conversation_id(),
                origin_url: config.origin_url.clone(),
            };
            let response = client
                .send(&request, &mut PrintObserver)
                .await
                .context("streaming request failed")?;
            if let Some(conversation_id) = response.conversation_id.as_deref() {
                identity.set_conversation_id(conversation_id)?;
            }
            if let Some(escalation) = &response.escalation {
                eprintln!("[escalation {}: {}]", escalation.id, escalation.status);
            }
        }
        Commands::History => {
            let Some(conversation_id) = identity.conversation_id() else {
                println!("No stored conversation.");
                return Ok(());
            };
            let client = StreamingResponseClient::new(&config, identity);
            let transcript = client
                .fetch_history(&conversation_id)
                .await
                .context("failed to fetch history")?;
            for message in &transcript.messages {
                println!("[{}] {}", message.role, message.content);
            }
            if transcript.closed {
                println!("(conversation closed)");
            }
        }
        Commands::Reset => {
            identity.clear_conversation()?;
            println!("Conversation cleared.");
        }
    }

    Ok(())
}
