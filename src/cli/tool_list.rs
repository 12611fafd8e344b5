//! Lists the tools configured MCP servers advertise.

use std::error::Error;

use crate::cli::connect_configured_servers;
use crate::core::config::Config;

pub async fn run_tool_list(config: &Config) -> Result<(), Box<dyn Error>> {
    if config.enabled_mcp_servers().next().is_none() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    let (registry, clients) = connect_configured_servers(config).await;
    if registry.is_empty() {
        println!("No tools available.");
    } else {
        for definition in registry.definitions() {
            match &definition.function.description {
                Some(description) => println!("{}  {description}", definition.name()),
                None => println!("{}", definition.name()),
            }
        }
    }

    for client in &clients {
        client.disconnect().await;
    }
    Ok(())
}
