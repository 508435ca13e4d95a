//! Camera QUIC client CLI: writes the received stream to stdout

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use camera_quic::client::{Client, ClientOptions};
use camera_quic::config::Config;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "camera-quic-client")]
#[command(about = "Receives a raw camera stream over QUIC and writes it to stdout")]
#[command(version)]
struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Server address, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Stdout carries the stream, so logs go to stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{:#}", e);
            error!(error = %message, "Camera client failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(cli.config.as_ref()).context("loading configuration")?;

    let mut options = ClientOptions::from(&config.client);
    if let Some(addr) = cli.addr {
        options.server_addr = addr;
    }

    let mut session = Client::connect(&options)
        .await
        .with_context(|| format!("dialing {}", options.server_addr))?;

    info!(server = %session.remote_address(), "Receiving camera stream");

    let mut stdout = tokio::io::stdout();
    let bytes = session
        .copy_to(&mut stdout)
        .await
        .context("copying stream into stdout")?;

    info!(bytes, "Stream ended");
    session.close().await;
    Ok(())
}
