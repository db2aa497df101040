//! # Allowgate - nickname allow-list gate for game proxies
//!
//! Answers "is this name permitted?" for every inbound session of an upstream
//! connection broker without touching storage on the hot path.
//!
//! Allowgate provides:
//! - One allow-list schema over an embedded SQLite file or a networked MySQL server
//! - A read/write-through cache: reads from an in-memory snapshot, writes to the backend first
//! - A versioned migration pipeline for the configuration document and legacy flat files
//! - The gate decision, operator commands and a small remote channel built on top

pub mod app;
pub mod client;
pub mod config;
pub mod gate;
pub mod migration;
pub mod operator;
pub mod repository;
pub mod server;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use app::App;
pub use config::{Settings, SettingsHandle};
pub use gate::{Decision, Gate};
pub use operator::{Operator, Reply};
pub use repository::Repository;
pub use storage::{AllowEntry, BackendKind, Store};

/// Result type alias for Allowgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Allowgate operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Remote database error: {0}")]
    Remote(#[from] sqlx::Error),

    #[error("Admin request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Legacy file is malformed: {0}")]
    LegacyFormat(String),

    #[error("Unknown config version: {0}")]
    UnknownGeneration(i64),

    #[error("Allow-list is not initialized")]
    NotReady,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Invalid username: {0:?}")]
    InvalidName(String),
}

/// Longest username the `whitelist.username` column accepts
pub const MAX_NAME_LEN: usize = 255;

/// Trim a username and reject values the store cannot hold.
///
/// Names are limited to `[A-Za-z0-9_]`: both backends' collations fold that
/// range exactly like [`fold_name`], so the snapshot and the unique index
/// always agree on which names are equal.
pub fn normalize_name(raw: &str) -> Result<&str> {
    let name = raw.trim();
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if !valid {
        return Err(Error::InvalidName(raw.to_string()));
    }
    Ok(name)
}

/// Case-folded form used for membership tests.
pub fn fold_name(name: &str) -> String {
    name.to_ascii_lowercase()
}
