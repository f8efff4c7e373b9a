// src/config/mod.rs
// Configuration for the crackerjack MCP server

mod file;

pub use file::{
    RateLimitConfig, ServerConfig, ValidatorConfig, WebSocketConfig, WriterConfig,
};
