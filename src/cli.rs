// src/cli.rs
// Process entry point: argument parsing and server startup

use anyhow::Result;
use clap::Parser;
use crackerjack_mcp::config::ServerConfig;
use crackerjack_mcp::context::ContextBuilder;
use crackerjack_mcp::mcp::CrackerjackServer;
use crackerjack_mcp::server;
use crackerjack_mcp::workflow::NullOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "crackerjack-mcp",
    about = "MCP server for the crackerjack project-quality workflow"
)]
pub struct Cli {
    /// Project directory the workflow operates on
    #[arg(default_value = ".")]
    pub project_path: PathBuf,

    /// Also serve WebSocket progress streaming and status pages on this port
    #[arg(env = "CRACKERJACK_WEBSOCKET_PORT")]
    pub websocket_port: Option<u16>,

    /// Serve the HTTP/WebSocket endpoints on --http-port
    #[arg(long)]
    pub http: bool,

    /// Port for --http
    #[arg(long, default_value_t = 8676, env = "CRACKERJACK_HTTP_PORT")]
    pub http_port: u16,
}

impl Cli {
    /// The port the HTTP/WebSocket app should bind, if any
    pub fn server_port(&self) -> Option<u16> {
        self.websocket_port
            .or_else(|| self.http.then_some(self.http_port))
    }
}

/// Initialize the context, optionally start the WebSocket server, and serve
/// MCP over stdio until the client disconnects or the process is
/// interrupted.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = ServerConfig::load();
    config.project_path = cli.project_path.clone();

    for warning in config.validate() {
        warn!("{}", warning);
    }

    let server_port = cli.server_port();
    let context = ContextBuilder::new(config, Arc::new(NullOrchestrator))
        .initialize()
        .await?;

    if let Some(port) = server_port {
        let web_context = context.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(web_context, port).await {
                tracing::error!("WebSocket server failed: {}", e);
            }
        });
    }

    let server = CrackerjackServer::new(context.clone());
    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;

    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    context.shutdown().await;
    Ok(())
}
