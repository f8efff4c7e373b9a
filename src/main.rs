// src/main.rs
// crackerjack-mcp - MCP server for the crackerjack project-quality workflow

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Quiet by default: stdout carries the MCP stdio transport, and stderr
    // noise drowns real warnings in client logs
    let level = if cli.server_port().is_some() {
        Level::INFO
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    cli::run(cli).await
}
