//! uvnet common library
//!
//! Shared types, persistence, and key material for the uvnet registry and
//! cell agents.

pub mod crypto;
pub mod db;
pub mod error;
pub mod exec;
pub mod keys;
pub mod types;

pub use crypto::{KeyPair, SignedData};
pub use db::{Database, ImportSpec, Ownable, Record};
pub use error::{Error, Result};
pub use keys::{WgKeyPair, WgPsk};
pub use types::*;

/// uvnet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default root directory for registry and agent state
pub fn default_root_path() -> std::path::PathBuf {
    std::env::var_os("UVNET_ROOT")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join(".uvnet")
        })
}
