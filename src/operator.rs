//! Operator commands: one repository operation plus a formatted reply each

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Messages, SettingsHandle, render};
use crate::{Result, normalize_name};
use crate::repository::Repository;

/// Name used for `$SOURCE` when a command comes from the local console
pub const CONSOLE: &str = "CONSOLE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Whether the command changed or reported state as asked
    pub ok: bool,
    pub text: String,
}

/// A state-changing operator command, as sent to a running server's admin route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "username", rename_all = "lowercase")]
pub enum Command {
    Add(String),
    Remove(String),
    Clear,
    Enable,
    Disable,
    Reload,
}

#[derive(Clone)]
pub struct Operator {
    settings: SettingsHandle,
    repository: Arc<Repository>,
}

impl Operator {
    pub fn new(settings: SettingsHandle, repository: Arc<Repository>) -> Self {
        Self { settings, repository }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    fn reply(&self, ok: bool, pick: impl FnOnce(&Messages) -> &str, vars: &[(&str, &str)]) -> Reply {
        let text = self.settings.read(|s| {
            let body = render(pick(&s.messages), vars);
            if s.prefix.is_empty() {
                body
            } else {
                format!("{} {}", s.prefix, body)
            }
        });
        Reply { ok, text }
    }

    pub async fn execute(&self, source: &str, command: &Command) -> Reply {
        match command {
            Command::Add(name) => self.add(source, name).await,
            Command::Remove(name) => self.remove(source, name).await,
            Command::Clear => self.clear(source).await,
            Command::Enable => self.enable(source),
            Command::Disable => self.disable(source),
            Command::Reload => self.reload(source).await,
        }
    }

    pub async fn add(&self, source: &str, raw: &str) -> Reply {
        let Ok(name) = normalize_name(raw) else {
            return self.reply(false, |m| &m.invalid_name, &[("$PLAYER", raw), ("$SOURCE", source)]);
        };
        let vars = [("$PLAYER", name), ("$SOURCE", source)];

        if self.repository.contains(name).await {
            return self.reply(false, |m| &m.already_on_whitelist, &vars);
        }
        if self.repository.add(name).await {
            tracing::info!("{} added {} to the whitelist", source, name);
            return self.reply(true, |m| &m.add, &vars);
        }
        // Lost a race with another writer, or the store failed
        if self.repository.contains(name).await {
            self.reply(false, |m| &m.already_on_whitelist, &vars)
        } else {
            self.reply(false, |m| &m.operation_failed, &vars)
        }
    }

    pub async fn remove(&self, source: &str, raw: &str) -> Reply {
        let Ok(name) = normalize_name(raw) else {
            return self.reply(false, |m| &m.invalid_name, &[("$PLAYER", raw), ("$SOURCE", source)]);
        };
        let vars = [("$PLAYER", name), ("$SOURCE", source)];

        if !self.repository.contains(name).await {
            return self.reply(false, |m| &m.not_on_whitelist, &vars);
        }
        if self.repository.remove(name).await {
            tracing::info!("{} removed {} from the whitelist", source, name);
            return self.reply(true, |m| &m.remove, &vars);
        }
        if self.repository.contains(name).await {
            self.reply(false, |m| &m.operation_failed, &vars)
        } else {
            self.reply(false, |m| &m.not_on_whitelist, &vars)
        }
    }

    pub async fn list(&self, source: &str) -> Reply {
        let names = self.repository.list_all().await;
        if names.is_empty() {
            return self.reply(true, |m| &m.list_no_players, &[("$SOURCE", source)]);
        }

        let size = names.len().to_string();
        let joined = names.join(", ");
        self.reply(
            true,
            |m| &m.list,
            &[("$SOURCE", source), ("$WHITELIST_SIZE", size.as_str()), ("$WHITELIST", joined.as_str())],
        )
    }

    pub async fn clear(&self, source: &str) -> Reply {
        let vars = [("$SOURCE", source)];
        if !self.settings.read(|s| s.enable_clear_command) {
            return self.reply(false, |m| &m.clear_disabled, &vars);
        }
        if self.repository.clear().await {
            tracing::info!("{} cleared the whitelist", source);
            self.reply(true, |m| &m.clear, &vars)
        } else {
            self.reply(false, |m| &m.operation_failed, &vars)
        }
    }

    pub fn enable(&self, source: &str) -> Reply {
        self.toggle(source, true)
    }

    pub fn disable(&self, source: &str) -> Reply {
        self.toggle(source, false)
    }

    fn toggle(&self, source: &str, enabled: bool) -> Reply {
        let vars = [("$SOURCE", source)];
        if self.settings.enabled() == enabled {
            return if enabled {
                self.reply(false, |m| &m.already_enabled, &vars)
            } else {
                self.reply(false, |m| &m.already_disabled, &vars)
            };
        }

        if let Err(e) = self.settings.set_enabled(enabled) {
            tracing::error!("Failed to save the config: {}", e);
            return self.reply(false, |m| &m.operation_failed, &vars);
        }
        tracing::info!("{} {} the whitelist", source, if enabled { "enabled" } else { "disabled" });
        if enabled {
            self.reply(true, |m| &m.enable, &vars)
        } else {
            self.reply(true, |m| &m.disable, &vars)
        }
    }

    pub fn status(&self, source: &str) -> Reply {
        let status = self.settings.read(|s| {
            if s.enabled {
                s.messages.whitelist_enabled.clone()
            } else {
                s.messages.whitelist_disabled.clone()
            }
        });
        self.reply(true, |m| &m.status, &[("$STATUS", status.as_str()), ("$SOURCE", source)])
    }

    /// Re-read the config document and force a snapshot reload
    pub async fn reload(&self, source: &str) -> Reply {
        let vars = [("$SOURCE", source)];
        if let Err(e) = self.sync().await {
            tracing::error!("Failed to reload: {}", e);
            return self.reply(false, |m| &m.operation_failed, &vars);
        }
        tracing::info!("Whitelist reloaded by {}", source);
        self.reply(true, |m| &m.reload, &vars)
    }

    /// Pick up changes other processes made to the config file and the store.
    pub async fn sync(&self) -> Result<()> {
        self.settings.reload()?;
        self.repository.refresh().await
    }

    pub fn about(&self) -> Reply {
        let prefix = self.settings.read(|s| s.prefix.clone());
        Reply {
            ok: true,
            text: format!("{} Allowgate v{}", prefix, env!("CARGO_PKG_VERSION")).trim().to_string(),
        }
    }
}
