//! MCP Tool Host - Rust Implementation
//!
//! Serves the built-in toolset to MCP clients over stdio, legacy SSE, or
//! streamable HTTP.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use mcp_toolhost::builtin;
use mcp_toolhost::config::ServerConfig;
use mcp_toolhost::transport::http::HttpOptions;

/// MCP Tool Host
#[derive(Parser)]
#[command(name = "mcp-toolhost")]
#[command(author, version, about = "MCP Tool Host - A Model Context Protocol server for tools, agents and workflows")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one client on stdin/stdout (default)
    Stdio,

    /// Serve the legacy HTTP+SSE transport
    Sse {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve the streamable HTTP transport
    Http {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Answer with JSON bodies instead of SSE streams
        #[arg(long)]
        json_response: bool,

        /// Run without session ids
        #[arg(long)]
        stateless: bool,
    },

    /// Print server details and the tool list as JSON
    Info,
}

fn override_listener(config: &mut ServerConfig, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.transport.host = host;
    }
    if let Some(port) = port {
        config.transport.port = port;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout belongs to the stdio transport
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Stdio) {
        Commands::Stdio => {
            let server = builtin::server(config)?;
            server.start_stdio().await?;
        }
        Commands::Sse { host, port } => {
            override_listener(&mut config, host, port);
            let addr = config.socket_addr()?;
            let server = builtin::server(config)?;
            server.start_sse(addr).await?;
        }
        Commands::Http {
            host,
            port,
            json_response,
            stateless,
        } => {
            override_listener(&mut config, host, port);
            config.transport.json_response |= json_response;
            config.transport.stateless |= stateless;
            let addr = config.socket_addr()?;
            let options = HttpOptions::from_config(&config.transport);
            let server = builtin::server(config)?;
            server.start_http(addr, options).await?;
        }
        Commands::Info => {
            let server = builtin::server(config)?;
            let info = json!({
                "server": server.server_detail(),
                "tools": server.tool_list_info().tools,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
