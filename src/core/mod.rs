pub mod chat_stream;
pub mod config;
pub mod message;
pub mod session;
pub mod tool_calls;
