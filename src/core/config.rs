//! Configuration file handling.
//!
//! Settings live in a TOML file under the platform config directory, with
//! environment variables taking precedence for the endpoint and credential.
//! The API key itself is never stored here; it is read from the environment
//! and passed into the session explicitly.

use std::error::Error;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub const API_KEY_ENV: &str = "BANTER_API_KEY";
pub const BASE_URL_ENV: &str = "BANTER_BASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServerConfig {
    pub id: String,
    pub base_url: String,
    /// `auto` (default), `streamable-http`, or `sse`.
    pub transport: Option<String>,
    pub enabled: Option<bool>,
    /// Name of an environment variable holding a bearer token for this server.
    pub auth_token_env: Option<String>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn Error>> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<dyn Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Base URL with environment override, falling back to the default.
    pub fn effective_base_url(&self) -> String {
        std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn effective_model(&self, override_model: Option<&str>) -> String {
        override_model
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn enabled_mcp_servers(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.mcp_servers.iter().filter(|server| server.is_enabled())
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "permacommons", "banter")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_mcp_server_tables() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
default_model = "test-model"
system_prompt = "You are terse."

[[mcp_servers]]
id = "adder"
base_url = "http://localhost:8001/mcp"
transport = "streamable-http"

[[mcp_servers]]
id = "multiplier"
base_url = "http://localhost:8002/sse"
transport = "sse"
enabled = false
"#
        )
        .expect("write");

        let config = Config::load_from_path(file.path()).expect("load");
        assert_eq!(config.default_model.as_deref(), Some("test-model"));
        assert_eq!(config.mcp_servers.len(), 2);
        let enabled: Vec<_> = config.enabled_mcp_servers().collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "adder");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = Config::default();
        assert_eq!(config.effective_model(None), DEFAULT_MODEL);
        assert_eq!(config.effective_model(Some("other")), "other");
        assert!(config.mcp_servers.is_empty());
    }
}
