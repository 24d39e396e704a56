//! Error types for uvnet

use thiserror::Error;

/// Result type alias using the uvnet Error
pub type Result<T> = std::result::Result<T, Error>;

/// uvnet error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("clashing networks detected: {0}")]
    ClashingNetworks(String),

    #[error("missing key material: {prefix} [{scope}]")]
    MissingKeyMaterial { prefix: String, scope: String },

    #[error("attribute is read-only: {0}")]
    ReadOnly(&'static str),

    #[error("backbone subnet exhausted: {0}")]
    SubnetExhausted(ipnetwork::Ipv4Network),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("failed to stop agent services: {}", .0.join("; "))]
    StopAgentService(Vec<String>),

    #[error("agent timed out after {seconds}s")]
    AgentTimedout { seconds: u64 },

    #[error("agent already running on host: pid {0}")]
    AgentAlreadyRunning(i32),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for the CLI surface
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidConfig(_) | Error::ClashingNetworks(_) => 2,
            _ => 1,
        }
    }
}
