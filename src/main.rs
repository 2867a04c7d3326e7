use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use mood_chat::constants::DEFAULT_API_BASE;
use mood_chat::web_server::{self, ServerConfig};
use mood_chat::OpenAiClient;

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the chat page. API key, emotion, model and temperature are set in the page.
    Serve {
        #[arg(long, default_value = "127.0.0.1", help = "Address to listen on.")]
        host: IpAddr,
        #[arg(long, default_value_t = 8501, help = "Port for the web server.")]
        port: u16,
        #[arg(
            long,
            default_value = DEFAULT_API_BASE,
            help = "Base URL of the chat-completion API."
        )]
        api_base: String,
        #[arg(
            long,
            default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/static"),
            help = "Directory holding the page's script and stylesheet."
        )]
        static_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (RUST_LOG and friends)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g. RUST_LOG=info,mood_chat=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            api_base,
            static_dir,
        } => {
            info!(%host, port, %api_base, "Starting chat server");
            let client = Arc::new(OpenAiClient::new(api_base));
            let config = ServerConfig {
                host,
                port,
                static_dir,
            };

            let server = web_server::start_web_server(config, client);
            tokio::pin!(server);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, shutting down...");
                }
                res = &mut server => {
                    if let Err(e) = &res {
                        error!("Web server failed: {:?}", e);
                    }
                    res.context("Chat server stopped")?;
                }
            }
            info!("Shutdown complete.");
        }
    }

    Ok(())
}
