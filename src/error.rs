// src/error.rs
// Error taxonomy shared across the server subsystems

use thiserror::Error;

/// What can go wrong inside the crackerjack-mcp library. Tool bodies catch
/// these at the MCP boundary and serialise them; only the binary's startup
/// path lets them escape.
#[derive(Error, Debug)]
pub enum CrackerjackError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server context not initialized")]
    NotInitialized,

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Library-wide result type; the error half is always [`CrackerjackError`]
pub type Result<T> = std::result::Result<T, CrackerjackError>;
