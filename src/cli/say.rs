//! TUI-less "say" command

use std::error::Error;
use std::io::{self, Write};

use crate::cli::connect_configured_servers;
use crate::core::config::{Config, API_KEY_ENV};
use crate::core::session::{
    ChatSession, SessionEvent, SessionParams, DEFAULT_MAX_TOOL_ROUNDS,
};
use crate::tools::ToolRegistry;

pub async fn run_say(
    prompt: Vec<String>,
    model: Option<String>,
    no_mcp: bool,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.is_empty() {
        eprintln!("Usage: banter say <prompt>");
        std::process::exit(1);
    }

    let Ok(api_key) = std::env::var(API_KEY_ENV) else {
        eprintln!("❌ No API key found. Set {API_KEY_ENV} and try again.");
        std::process::exit(1);
    };

    let (registry, clients) = if no_mcp {
        (ToolRegistry::new(), Vec::new())
    } else {
        connect_configured_servers(config).await
    };

    let (mut session, mut events) = ChatSession::new(
        SessionParams {
            http: reqwest::Client::new(),
            base_url: config.effective_base_url(),
            api_key,
            model: config.effective_model(model.as_deref()),
            system_prompt: config.system_prompt.clone(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        },
        registry,
    )?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::ContentDelta { content } => {
                    print!("{content}");
                    let _ = io::stdout().flush();
                }
                SessionEvent::ToolCallsReady { calls } => {
                    for call in &calls {
                        eprintln!("⚙ calling {}...", call.function.name);
                    }
                }
                SessionEvent::ToolExecuted { record } => {
                    if let Some(error) = &record.error {
                        eprintln!("⚙ {} failed: {error}", record.tool_name);
                    } else {
                        eprintln!("⚙ {} returned {}", record.tool_name, record.result);
                    }
                }
                SessionEvent::Completed { .. } => {
                    println!();
                }
                SessionEvent::Error { message } => {
                    eprintln!("\n❌ Error: {message}");
                }
            }
        }
    });

    let result = session.send_message(&prompt).await;

    for client in &clients {
        client.disconnect().await;
    }
    drop(session);
    let _ = printer.await;

    if result.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
