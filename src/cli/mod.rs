//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the
//! appropriate commands.

pub mod say;
pub mod tool_list;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::say::run_say;
use crate::cli::tool_list::run_tool_list;
use crate::core::config::Config;

#[derive(Parser)]
#[command(name = "banter")]
#[command(about = "A streaming chat client with MCP tool support")]
#[command(
    long_about = "Banter sends prompts to OpenAI-compatible chat completion endpoints, streams \
the reply to the terminal, and lets the model call tools hosted on Model Context \
Protocol servers.\n\n\
Environment Variables:\n\
  BANTER_API_KEY    API key for the completion endpoint (required)\n\
  BANTER_BASE_URL   Custom API base URL (optional, defaults to https://api.openai.com/v1)\n\n\
MCP servers are declared in the config file as [[mcp_servers]] tables; each \
names a base URL and optionally a transport (auto, streamable-http, or sse)."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use for chat
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Read configuration from this file instead of the default location
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Skip connecting to configured MCP servers
    #[arg(long, global = true)]
    pub no_mcp: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one prompt and print the streamed reply (default)
    Say {
        /// The prompt to send
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Connect to configured MCP servers and list the tools they advertise
    Tools,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match args.command.unwrap_or(Commands::Say { prompt: Vec::new() }) {
        Commands::Say { prompt } => run_say(prompt, args.model, args.no_mcp, &config).await,
        Commands::Tools => run_tool_list(&config).await,
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("banter=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Connect every enabled MCP server and fold the tools they advertise into
/// one registry. A server that fails to connect is reported and skipped; it
/// never takes the chat down with it.
pub(crate) async fn connect_configured_servers(
    config: &Config,
) -> (crate::tools::ToolRegistry, Vec<crate::mcp::McpClient>) {
    let mut registry = crate::tools::ToolRegistry::new();
    let mut clients = Vec::new();
    for server in config.enabled_mcp_servers() {
        let client = match crate::mcp::McpClient::from_config(server) {
            Ok(client) => client,
            Err(err) => {
                eprintln!("⚠️  Skipping MCP server {}: {err}", server.id);
                continue;
            }
        };
        match client.connect().await {
            Ok(tools) => {
                registry.register_mcp_server(&client, tools);
                clients.push(client);
            }
            Err(err) => {
                eprintln!("⚠️  Could not connect to MCP server {}: {err}", server.id);
            }
        }
    }
    (registry, clients)
}
