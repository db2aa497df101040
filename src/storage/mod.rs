//! Storage Layer - the authoritative allow-list
//!
//! One table, `whitelist(id, username, added_at)`, behind one [`Store`] trait.
//! Two implementations:
//! - [`SqliteStore`]: embedded file, WAL journal, pooled with r2d2
//! - [`MySqlStore`]: networked MySQL / MariaDB, pooled with sqlx
//!
//! The backend is picked once by [`open`]; nothing else branches on it.

pub mod mysql;
pub mod schema;
pub mod sqlite;

pub use mysql::MySqlStore;
pub use sqlite::SqliteStore;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::config::DatabaseSettings;

/// Which relational engine holds the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Mysql,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Mysql => "mysql",
        }
    }
}

// Unrecognized engine names fall back to the embedded store.
impl From<String> for BackendKind {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("mysql") {
            BackendKind::Mysql
        } else {
            BackendKind::Sqlite
        }
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored allow-list row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowEntry {
    pub username: String,
    /// `YYYY-MM-DD HH:MM:SS`
    pub added_at: String,
}

/// The query set every backend answers.
///
/// Name comparisons are case-insensitive on both engines.
#[async_trait]
pub trait Store: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert unless present. Returns whether a row was created.
    async fn insert(&self, username: &str) -> Result<bool>;

    /// Returns whether a row was deleted.
    async fn delete(&self, username: &str) -> Result<bool>;

    async fn exists(&self, username: &str) -> Result<bool>;

    /// All usernames ordered by name
    async fn names(&self) -> Result<Vec<String>>;

    async fn entries(&self) -> Result<Vec<AllowEntry>>;

    /// Delete every row, returning how many were removed
    async fn delete_all(&self) -> Result<u64>;

    async fn any(&self) -> Result<bool>;

    async fn count(&self) -> Result<u64>;

    /// Flush anything the backend buffers and release what it can.
    ///
    /// Pools that free their connections on drop may treat this as a flush
    /// only. Callers must not rely on the store after it.
    async fn close(&self);
}

/// Open the configured backend and make sure the schema exists.
///
/// Any failure here is fatal for the allow-list feature.
pub async fn open(settings: &DatabaseSettings, data_dir: &Path) -> Result<Arc<dyn Store>> {
    tracing::info!("Opening {} allow-list store", settings.kind);
    let store: Arc<dyn Store> = match settings.kind {
        BackendKind::Sqlite => {
            let path = data_dir.join(&settings.file);
            let pool = settings.pool.clone();
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path, &pool))
                .await
                .map_err(|e| crate::Error::Task(e.to_string()))??;
            Arc::new(store)
        }
        BackendKind::Mysql => Arc::new(MySqlStore::connect(&settings.mysql, &settings.pool).await?),
    };
    Ok(store)
}
