use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::Result;
use crate::storage::BackendKind;

/// Generation written by this release. The migration pipeline upgrades older documents to it.
pub const CONFIG_VERSION: i64 = 3;

pub const CONFIG_FILE: &str = "allowgate.toml";
pub const LEGACY_CONFIG_FILE: &str = "config.toml";
pub const LEGACY_ALLOWLIST_FILE: &str = "whitelist.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub config_version: i64,
    pub enabled: bool,
    pub prefix: String,
    pub enable_clear_command: bool,
    pub messages: Messages,
    pub database: DatabaseSettings,
    pub remote: RemoteSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            enabled: true,
            prefix: "[allowgate]".to_string(),
            enable_clear_command: false,
            messages: Messages::default(),
            database: DatabaseSettings::default(),
            remote: RemoteSettings::default(),
        }
    }
}

/// Operator and player facing texts.
///
/// Placeholders: `$PLAYER`, `$SOURCE`, `$STATUS`, `$WHITELIST`, `$WHITELIST_SIZE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Messages {
    pub kick_message: String,
    pub whitelist_enabled: String,
    pub whitelist_disabled: String,
    pub status: String,
    pub enable: String,
    pub disable: String,
    pub already_enabled: String,
    pub already_disabled: String,
    pub add: String,
    pub remove: String,
    pub already_on_whitelist: String,
    pub not_on_whitelist: String,
    pub list: String,
    pub list_no_players: String,
    pub clear: String,
    pub clear_disabled: String,
    pub reload: String,
    pub invalid_name: String,
    pub operation_failed: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            kick_message: "You are not whitelisted on this server!".to_string(),
            whitelist_enabled: "enabled".to_string(),
            whitelist_disabled: "disabled".to_string(),
            status: "Whitelist is $STATUS".to_string(),
            enable: "Whitelist enabled by $SOURCE".to_string(),
            disable: "Whitelist disabled by $SOURCE".to_string(),
            already_enabled: "Whitelist is already enabled".to_string(),
            already_disabled: "Whitelist is already disabled".to_string(),
            add: "$PLAYER has been added to the whitelist".to_string(),
            remove: "$PLAYER has been removed from the whitelist".to_string(),
            already_on_whitelist: "$PLAYER is already on the whitelist".to_string(),
            not_on_whitelist: "$PLAYER is not on the whitelist".to_string(),
            list: "Whitelisted players ($WHITELIST_SIZE): $WHITELIST".to_string(),
            list_no_players: "The whitelist is empty".to_string(),
            clear: "Whitelist cleared by $SOURCE".to_string(),
            clear_disabled: "The clear command is disabled in the config".to_string(),
            reload: "Configuration reloaded".to_string(),
            invalid_name: "\"$PLAYER\" is not a valid username".to_string(),
            operation_failed: "Could not update the whitelist, see the server log".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    /// Embedded database file, relative to the data directory
    pub file: String,
    pub mysql: MysqlSettings,
    pub pool: PoolSettings,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            file: "whitelist.db".to_string(),
            mysql: MysqlSettings::default(),
            pool: PoolSettings::default(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for MysqlSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            database: "allowgate".to_string(),
            username: "root".to_string(),
            password: "password".to_string(),
        }
    }
}

// Keeps the password out of logs and panic messages.
impl std::fmt::Debug for MysqlSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection pool bounds shared by both backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_ms: 30_000,
            idle_timeout_ms: 600_000,
            max_lifetime_ms: 1_800_000,
        }
    }
}

impl PoolSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }
}

/// Inbound channel for the broker's gate queries and remote add/remove
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub enabled: bool,
    pub bind: String,
    /// Caller ids allowed to mutate the allow-list remotely
    pub allowed_callers: Vec<String>,
    /// How often `serve` re-reads the config and reloads the snapshot to pick
    /// up writes made elsewhere; 0 turns it off
    pub refresh_interval_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8765".to_string(),
            allowed_callers: Vec::new(),
            refresh_interval_secs: 30,
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    PathBuf::from("allowgate")
}

pub fn config_path_in(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)?;
    let settings: Settings = toml::from_str(&contents)?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    let contents = toml::to_string_pretty(settings)?;
    write_atomic(path, &contents)
}

/// Replace `path` in one rename so readers see the old or the new document, never a mix.
///
/// The temp file gets a unique name next to `path`, so concurrent writers from
/// other processes never share it.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Substitute `$KEY` placeholders in a message template.
///
/// One pass over the template: substituted values are never scanned again,
/// and the longest key wins where keys share a prefix.
pub fn render(template: &str, replacements: &[(&str, &str)]) -> String {
    let mut message = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        message.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let hit = replacements
            .iter()
            .filter(|(key, _)| !key.is_empty() && tail.starts_with(*key))
            .max_by_key(|(key, _)| key.len());
        match hit {
            Some((key, value)) => {
                message.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                message.push('$');
                rest = &tail[1..];
            }
        }
    }
    message.push_str(rest);
    message
}

/// Shared, runtime-mutable view of the settings document.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
    path: Option<PathBuf>,
}

impl SettingsHandle {
    pub fn new(settings: Settings, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            path: Some(path),
        }
    }

    /// A handle that never touches disk
    pub fn detached(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn snapshot(&self) -> Settings {
        self.read(Settings::clone)
    }

    pub fn enabled(&self) -> bool {
        self.read(|s| s.enabled)
    }

    /// Apply `f` to a copy, persist it, then publish it.
    ///
    /// The write lock is held for the whole sequence so concurrent updates
    /// apply one after another. `f` must not read through this handle.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        f(&mut next);
        if let Some(path) = &self.path {
            save_settings(path, &next)?;
        }
        *guard = next;
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.update(|s| s.enabled = enabled)
    }

    /// Re-read the document from disk. A detached handle keeps its current value.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let settings = load_settings(path)?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&Settings::default()).unwrap();
        assert!(text.contains("config_version = 3"));
        assert!(text.contains("type = \"sqlite\""));

        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
            enabled = false
            [database]
            type = "mysql"
            [database.mysql]
            host = "db.internal"
            "#,
        )
        .unwrap();

        assert!(!parsed.enabled);
        assert_eq!(parsed.database.kind, BackendKind::Mysql);
        assert_eq!(parsed.database.mysql.host, "db.internal");
        assert_eq!(parsed.database.mysql.port, 3306);
        assert_eq!(parsed.messages, Messages::default());
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let settings = MysqlSettings {
            password: "hunter2".to_string(),
            ..MysqlSettings::default()
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }

    #[test]
    fn test_render_placeholders() {
        let text = render("$PLAYER added by $SOURCE", &[("$PLAYER", "Alice"), ("$SOURCE", "CONSOLE")]);
        assert_eq!(text, "Alice added by CONSOLE");
    }

    #[test]
    fn test_render_is_single_pass() {
        let text = render(
            "$PLAYER added by $SOURCE",
            &[("$PLAYER", "$SOURCE"), ("$SOURCE", "CONSOLE")],
        );
        assert_eq!(text, "$SOURCE added by CONSOLE");

        let text = render(
            "$WHITELIST_SIZE: $WHITELIST, costs $5",
            &[("$WHITELIST", "a, b"), ("$WHITELIST_SIZE", "2")],
        );
        assert_eq!(text, "2: a, b, costs $5");
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_in(dir.path());
        let handle = SettingsHandle::new(Settings::default(), path.clone());

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    handle
                        .update(|s| s.remote.allowed_callers.push(format!("caller-{i}")))
                        .unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.read(|s| s.remote.allowed_callers.len()), 8);
        assert_eq!(load_settings(&path).unwrap().remote.allowed_callers.len(), 8);
    }

    #[test]
    fn test_handle_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_in(dir.path());
        save_settings(&path, &Settings::default()).unwrap();

        let handle = SettingsHandle::new(Settings::default(), path.clone());
        handle.set_enabled(false).unwrap();
        assert!(!handle.enabled());
        assert!(!load_settings(&path).unwrap().enabled);

        let mut edited = load_settings(&path).unwrap();
        edited.prefix = "[edited]".to_string();
        save_settings(&path, &edited).unwrap();

        handle.reload().unwrap();
        assert_eq!(handle.read(|s| s.prefix.clone()), "[edited]");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.toml");

        write_atomic(&path, "a = 1\n").unwrap();
        write_atomic(&path, "a = 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a = 2\n");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("doc.toml")]);
    }
}
