//! MySQL / MariaDB storage implementation
//!
//! Credentials come from the configuration document and are never logged.
//! Pool bounds (connections, acquire timeout, idle and max lifetime) are set
//! explicitly so a dead server surfaces as a failed query instead of a hang.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;

use super::schema::Statement;
use super::{AllowEntry, BackendKind, Store};
use crate::Result;
use crate::config::{MysqlSettings, PoolSettings};

const KIND: BackendKind = BackendKind::Mysql;

/// Networked allow-list store
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(settings: &MysqlSettings, pool: &PoolSettings) -> Result<Self> {
        tracing::info!(
            "Connecting to MySQL at {}:{}/{}",
            settings.host,
            settings.port,
            settings.database
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(pool.max_connections)
            .acquire_timeout(pool.connect_timeout())
            .idle_timeout(Some(pool.idle_timeout()))
            .max_lifetime(Some(pool.max_lifetime()))
            .connect_with(connect_options(settings))
            .await?;

        sqlx::query(Statement::CreateTable.sql(KIND)).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn connect_options(settings: &MysqlSettings) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .database(&settings.database)
        .username(&settings.username)
        .password(&settings.password)
        .charset("utf8mb4")
}

#[async_trait]
impl Store for MySqlStore {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn insert(&self, username: &str) -> Result<bool> {
        let result = sqlx::query(Statement::InsertIfAbsent.sql(KIND))
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, username: &str) -> Result<bool> {
        let result = sqlx::query(Statement::DeleteByName.sql(KIND))
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, username: &str) -> Result<bool> {
        let row = sqlx::query(Statement::ExistsByName.sql(KIND))
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(Statement::ListNames.sql(KIND))
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn entries(&self) -> Result<Vec<AllowEntry>> {
        let rows = sqlx::query(Statement::ListEntries.sql(KIND))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<AllowEntry> {
                Ok(AllowEntry {
                    username: row.try_get(0)?,
                    added_at: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query(Statement::DeleteAll.sql(KIND))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn any(&self) -> Result<bool> {
        let row = sqlx::query(Statement::ProbeAny.sql(KIND))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(Statement::Count.sql(KIND))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("MySQL pool closed");
    }
}
