//! SQLite storage implementation

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use super::schema::Statement;
use super::{AllowEntry, BackendKind, Store};
use crate::config::PoolSettings;
use crate::{Error, Result};

const KIND: BackendKind = BackendKind::Sqlite;

/// Embedded allow-list store backed by a SQLite file
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path, settings: &PoolSettings) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(apply_pragmas);
        let pool = Pool::builder()
            .max_size(settings.max_connections)
            .connection_timeout(settings.connect_timeout())
            .idle_timeout(Some(settings.idle_timeout()))
            .max_lifetime(Some(settings.max_lifetime()))
            .build(manager)?;

        let store = Self { pool, path: Some(path.to_path_buf()) };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    ///
    /// Every pooled connection would get its own private database, so the pool
    /// holds exactly one connection that is never recycled.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let store = Self { pool, path: None };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(Statement::CreateTable.sql(KIND), [])?;
        Ok(())
    }

    /// Run a blocking closure against a pooled connection on tokio's blocking pool.
    async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }
}

fn apply_pragmas(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn insert(&self, username: &str) -> Result<bool> {
        let username = username.to_string();
        self.with_connection(move |conn| {
            let rows = conn.execute(Statement::InsertIfAbsent.sql(KIND), [&username])?;
            Ok(rows > 0)
        })
        .await
    }

    async fn delete(&self, username: &str) -> Result<bool> {
        let username = username.to_string();
        self.with_connection(move |conn| {
            let rows = conn.execute(Statement::DeleteByName.sql(KIND), [&username])?;
            Ok(rows > 0)
        })
        .await
    }

    async fn exists(&self, username: &str) -> Result<bool> {
        let username = username.to_string();
        self.with_connection(move |conn| {
            let found: Option<i64> = conn
                .query_row(Statement::ExistsByName.sql(KIND), [&username], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn names(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(Statement::ListNames.sql(KIND))?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
        .await
    }

    async fn entries(&self) -> Result<Vec<AllowEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(Statement::ListEntries.sql(KIND))?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(AllowEntry {
                        username: row.get(0)?,
                        added_at: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn delete_all(&self) -> Result<u64> {
        self.with_connection(|conn| {
            let rows = conn.execute(Statement::DeleteAll.sql(KIND), [])?;
            Ok(rows as u64)
        })
        .await
    }

    async fn any(&self) -> Result<bool> {
        self.with_connection(|conn| {
            let found: Option<i64> = conn
                .query_row(Statement::ProbeAny.sql(KIND), [], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row(Statement::Count.sql(KIND), [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Fold the WAL back into the database file and truncate it.
    ///
    /// The connections themselves go away with the last pool handle.
    async fn close(&self) {
        if self.path.is_none() {
            return;
        }
        let checkpoint = self
            .with_connection(|conn| {
                let busy: i64 = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
                Ok(busy != 0)
            })
            .await;
        match checkpoint {
            Ok(false) => tracing::debug!("SQLite WAL checkpointed"),
            Ok(true) => tracing::warn!("SQLite WAL checkpoint blocked by another connection"),
            Err(e) => tracing::warn!("SQLite WAL checkpoint failed: {}", e),
        }
    }
}
