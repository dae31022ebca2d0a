//! `localbridge-proxy` binary entrypoint.
//!
//! Configuration comes from environment variables, optionally overlaid by a
//! YAML file and command-line flags.

use std::path::PathBuf;

use clap::Parser;
use localbridge_proxy::{serve, ProxyConfig};

/// Anthropic Messages API proxy for local OpenAI-compatible model servers
#[derive(Parser, Debug)]
#[command(name = "localbridge-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML config file overriding environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend chat-completions URL (overrides BACKEND_URL)
    #[arg(long)]
    backend_url: Option<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to proxy-friendly info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ProxyConfig::from_env();
    if let Some(path) = &cli.config {
        config = config.with_yaml_file(path)?;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(url) = cli.backend_url {
        config.backend_url = url;
    }

    serve(config).await
}
