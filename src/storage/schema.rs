//! Database schema and the query set shared by both backends

use super::BackendKind;

/// Name of the single allow-list table
pub const TABLE: &str = "whitelist";

/// SQL to create the allow-list table on SQLite
pub const CREATE_TABLE_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS whitelist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username VARCHAR(255) NOT NULL UNIQUE COLLATE NOCASE,
    added_at DATETIME DEFAULT CURRENT_TIMESTAMP
)
"#;

/// SQL to create the allow-list table on MySQL / MariaDB
pub const CREATE_TABLE_MYSQL: &str = r#"
CREATE TABLE IF NOT EXISTS whitelist (
    id INT AUTO_INCREMENT PRIMARY KEY,
    username VARCHAR(255) NOT NULL UNIQUE,
    added_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    INDEX idx_username (username)
) CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci
"#;

/// Every statement the store issues. Each one has exactly one rendering per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    CreateTable,
    /// Insert a name unless a case-insensitive duplicate exists
    InsertIfAbsent,
    DeleteByName,
    ExistsByName,
    ListNames,
    ListEntries,
    DeleteAll,
    /// Does the table hold at least one row
    ProbeAny,
    Count,
}

impl Statement {
    pub fn sql(self, kind: BackendKind) -> &'static str {
        match kind {
            BackendKind::Sqlite => self.sqlite(),
            BackendKind::Mysql => self.mysql(),
        }
    }

    fn sqlite(self) -> &'static str {
        match self {
            Statement::CreateTable => CREATE_TABLE_SQLITE,
            Statement::InsertIfAbsent => "INSERT OR IGNORE INTO whitelist (username) VALUES (?1)",
            Statement::DeleteByName => "DELETE FROM whitelist WHERE username = ?1 COLLATE NOCASE",
            Statement::ExistsByName => {
                "SELECT 1 FROM whitelist WHERE username = ?1 COLLATE NOCASE LIMIT 1"
            }
            Statement::ListNames => "SELECT username FROM whitelist ORDER BY username",
            Statement::ListEntries => {
                "SELECT username, COALESCE(strftime('%Y-%m-%d %H:%M:%S', added_at), '') \
                 FROM whitelist ORDER BY username"
            }
            Statement::DeleteAll => "DELETE FROM whitelist",
            Statement::ProbeAny => "SELECT 1 FROM whitelist LIMIT 1",
            Statement::Count => "SELECT COUNT(*) FROM whitelist",
        }
    }

    fn mysql(self) -> &'static str {
        match self {
            Statement::CreateTable => CREATE_TABLE_MYSQL,
            Statement::InsertIfAbsent => "INSERT IGNORE INTO whitelist (username) VALUES (?)",
            Statement::DeleteByName => "DELETE FROM whitelist WHERE LOWER(username) = LOWER(?)",
            Statement::ExistsByName => {
                "SELECT 1 FROM whitelist WHERE LOWER(username) = LOWER(?) LIMIT 1"
            }
            Statement::ListNames => "SELECT username FROM whitelist ORDER BY username",
            Statement::ListEntries => {
                "SELECT username, COALESCE(DATE_FORMAT(added_at, '%Y-%m-%d %H:%i:%s'), '') \
                 FROM whitelist ORDER BY username"
            }
            Statement::DeleteAll => "DELETE FROM whitelist",
            Statement::ProbeAny => "SELECT 1 FROM whitelist LIMIT 1",
            Statement::Count => "SELECT COUNT(*) FROM whitelist",
        }
    }
}
