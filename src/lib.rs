//! Banter is a streaming chat client for OpenAI-compatible APIs with Model
//! Context Protocol tool support.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`api`] defines the wire payloads for chat completion requests, both
//!   streaming and non-streaming.
//! - [`core`] owns the transcript, streaming decode, tool-call reassembly,
//!   and the session state machine that drives a turn end to end.
//! - [`tools`] holds the tool registry and runs requested tool calls
//!   concurrently.
//! - [`mcp`] provides Model Context Protocol integration: transport
//!   detection, the session handshake, tool discovery, and invocation.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod tools;
pub mod utils;
