//! Model Context Protocol client: transport detection, session handshake,
//! tool discovery, and tool invocation against remote MCP servers.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{ConnectionStatus, McpClient};
pub use transport::{McpTransportChoice, McpTransportKind};
