//! Tether CLI: run a server or call one over WebSockets.
//!
//! `tether serve` exposes a handful of arithmetic operations and logs peers
//! as they come and go; `tether call` opens a client, invokes one operation
//! and prints the result as JSON.

mod cli;
mod config;
mod ops;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tether_types::TetherConfig;
use tether_wire::{Client, Invoke, Server, ServerEvent, ServerEventKind};
use tracing::info;

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let loaded = config::load_config(cli.config.as_deref());
    init_tracing(&loaded.config.log.level);
    loaded.report();

    let mut config = loaded.config;
    if let Some(codec) = cli.codec {
        config.client.codec = codec;
        config.server.codec = codec;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    match cli.command {
        Commands::Serve { listen, protocols } => {
            runtime.block_on(cmd_serve(config, listen, protocols))
        }
        Commands::Call {
            operation,
            args,
            url,
            protocols,
            timeout_ms,
        } => runtime.block_on(cmd_call(
            config, operation, args, url, protocols, timeout_ms,
        )),
    }
}

async fn cmd_serve(
    mut config: TetherConfig,
    listen: Option<std::net::SocketAddr>,
    protocols: Vec<String>,
) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.server.listen_addr = addr;
    }
    if !protocols.is_empty() {
        config.server.protocols = protocols;
    }

    let server = Server::websocket(config.server).context("Invalid server configuration")?;
    ops::register(&server);
    server.on_event(ServerEventKind::Connection, |event: &ServerEvent| {
        if let ServerEvent::Connection { peer } = event {
            info!(
                peer = %peer.id(),
                remote = ?peer.info().remote_addr,
                path = ?peer.info().path,
                "Peer connected"
            );
        }
    });
    server.on_event(ServerEventKind::ClientClose, |event: &ServerEvent| {
        if let ServerEvent::ClientClose { peer, code } = event {
            info!(peer = %peer.id(), code = %code, "Peer disconnected");
        }
    });

    let addr = server.open().await.context("Failed to start server")?;
    if let Some(addr) = addr {
        eprintln!("Serving {} on ws://{addr}", server.operations().join(", "));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    eprintln!("Shutting down ({} peers)", server.peer_count());
    server.close().await;
    Ok(())
}

async fn cmd_call(
    mut config: TetherConfig,
    operation: String,
    args: Vec<String>,
    url: Option<String>,
    protocols: Vec<String>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    if let Some(url) = url {
        config.client.url = url;
    }
    if !protocols.is_empty() {
        config.client.protocols = protocols;
    }
    if timeout_ms.is_some() {
        config.client.request_timeout_ms = timeout_ms;
    }
    // One call per process; never reconnect.
    config.client.auto_reconnect = false;

    let arguments: Vec<Value> = args.iter().map(|a| parse_argument(a)).collect();
    let client = Client::websocket(config.client).context("Invalid client configuration")?;
    client
        .open()
        .await
        .with_context(|| format!("Failed to connect to {}", client.config().url))?;

    let outcome = client.invoke(&operation, arguments).await;
    client.close().await;

    let value = outcome.with_context(|| format!("Call to \"{operation}\" failed"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    );
    Ok(())
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_argument(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_argument() {
        assert_eq!(parse_argument("42"), json!(42));
        assert_eq!(parse_argument("[1, \"a\"]"), json!([1, "a"]));
        assert_eq!(parse_argument("true"), json!(true));
        assert_eq!(parse_argument("hello"), json!("hello"));
        assert_eq!(parse_argument("\"quoted\""), json!("quoted"));
    }
}
