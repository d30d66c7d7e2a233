//! Clap CLI definitions for Tether.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tether_types::CodecKind;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tether serve                          Serve the math operations on 127.0.0.1:8000
  tether serve --listen 0.0.0.0:9000    Serve on another address
  tether call add 2 3                   Call `add` with two arguments
  tether call echo '{\"a\": [1, 2]}'      Arguments are parsed as JSON
  tether call --codec json ping         Talk to a server using JSON frames

\x1b[1;36mConfig:\x1b[0m
  ~/.tether/config.toml (override with --config)";

/// Tether: bidirectional RPC over WebSockets.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Envelope codec (json or msgpack). Overrides the config file.
    #[arg(long, global = true)]
    pub codec: Option<CodecKind>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a server exposing add, subtract, multiply, divide and echo.
    Serve {
        /// Address to listen on.
        #[arg(long, short = 'l')]
        listen: Option<SocketAddr>,
        /// Subprotocol to accept (repeatable).
        #[arg(long = "protocol", short = 'p')]
        protocols: Vec<String>,
    },
    /// Connect, invoke one operation and print the result as JSON.
    Call {
        /// Operation name.
        operation: String,
        /// Arguments, each parsed as JSON (bare words become strings).
        args: Vec<String>,
        /// Server URL.
        #[arg(long, short = 'u')]
        url: Option<String>,
        /// Subprotocol to offer (repeatable).
        #[arg(long = "protocol", short = 'p')]
        protocols: Vec<String>,
        /// Give up after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}
