//! The preconnect decision

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::config::{SettingsHandle, render};
use crate::repository::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "message", rename_all = "lowercase")]
pub enum Decision {
    Permit,
    /// Carries the configured kick message
    Deny(String),
}

impl Decision {
    pub fn is_permit(&self) -> bool {
        matches!(self, Decision::Permit)
    }
}

/// Answers "may this name connect?" for the broker's preconnect hook.
///
/// Without a repository (the allow-list failed to initialize) the feature is
/// inactive and every name is permitted.
#[derive(Clone)]
pub struct Gate {
    settings: SettingsHandle,
    repository: Option<Arc<Repository>>,
    warned_degraded: Arc<AtomicBool>,
}

impl Gate {
    pub fn new(settings: SettingsHandle, repository: Arc<Repository>) -> Self {
        Self {
            settings,
            repository: Some(repository),
            warned_degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn degraded(settings: SettingsHandle) -> Self {
        Self {
            settings,
            repository: None,
            warned_degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Once the snapshot is warm this never leaves memory.
    pub async fn check(&self, name: &str) -> Decision {
        let Some(repository) = self.active_repository() else {
            return Decision::Permit;
        };
        let allowed = repository.contains(name).await;
        self.decide(name, allowed)
    }

    /// For hooks that cannot await. A cold snapshot denies.
    pub fn check_cached(&self, name: &str) -> Decision {
        let Some(repository) = self.active_repository() else {
            return Decision::Permit;
        };
        let allowed = repository.contains_cached(name).unwrap_or_else(|| {
            tracing::warn!("Whitelist not loaded yet, denying {}", name);
            false
        });
        self.decide(name, allowed)
    }

    fn active_repository(&self) -> Option<&Arc<Repository>> {
        if !self.settings.enabled() {
            return None;
        }
        if self.repository.is_none() && !self.warned_degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!("Whitelist is enabled but its store is unavailable, letting everyone in");
        }
        self.repository.as_ref()
    }

    fn decide(&self, name: &str, allowed: bool) -> Decision {
        if allowed {
            return Decision::Permit;
        }
        tracing::info!("Denied {}: not on the whitelist", name);
        let message = self
            .settings
            .read(|s| render(&s.messages.kick_message, &[("$PLAYER", name)]));
        Decision::Deny(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::storage::SqliteStore;

    async fn gate(enabled: bool, names: &[&str]) -> Gate {
        let settings = SettingsHandle::detached(Settings {
            enabled,
            ..Settings::default()
        });
        let repository = Arc::new(Repository::new(Arc::new(SqliteStore::open_in_memory().unwrap())));
        repository.add_batch(names.iter().copied()).await;
        repository.refresh().await.unwrap();
        Gate::new(settings, repository)
    }

    #[tokio::test]
    async fn test_listed_name_is_permitted() {
        let gate = gate(true, &["Alice"]).await;
        assert_eq!(gate.check("alice").await, Decision::Permit);
        assert_eq!(gate.check_cached("ALICE"), Decision::Permit);
    }

    #[tokio::test]
    async fn test_unlisted_name_gets_kick_message() {
        let gate = gate(true, &["Alice"]).await;
        let decision = gate.check("mallory").await;
        assert_eq!(decision, Decision::Deny(Settings::default().messages.kick_message));
        assert!(!decision.is_permit());
    }

    #[tokio::test]
    async fn test_disabled_gate_permits_everyone() {
        let gate = gate(false, &[]).await;
        assert!(gate.check("anyone").await.is_permit());
        assert!(gate.check_cached("anyone").is_permit());
    }

    #[tokio::test]
    async fn test_toggle_at_runtime() {
        let gate = gate(false, &["Alice"]).await;
        assert!(gate.check("bob").await.is_permit());

        gate.settings.set_enabled(true).unwrap();
        assert!(!gate.check("bob").await.is_permit());
        assert!(gate.check("alice").await.is_permit());
    }

    #[tokio::test]
    async fn test_kick_message_placeholder() {
        let settings = SettingsHandle::detached(Settings::default());
        settings
            .update(|s| s.messages.kick_message = "Sorry $PLAYER".to_string())
            .unwrap();
        let repository = Arc::new(Repository::new(Arc::new(SqliteStore::open_in_memory().unwrap())));
        repository.refresh().await.unwrap();

        let gate = Gate::new(settings, repository);
        assert_eq!(gate.check("Eve").await, Decision::Deny("Sorry Eve".to_string()));
    }

    #[tokio::test]
    async fn test_cold_cached_check_denies() {
        let settings = SettingsHandle::detached(Settings::default());
        let repository = Arc::new(Repository::new(Arc::new(SqliteStore::open_in_memory().unwrap())));
        repository.store().insert("Alice").await.unwrap();

        let gate = Gate::new(settings, repository);
        assert!(!gate.check_cached("Alice").is_permit());
        // the awaited check may fall back to the store
        assert!(gate.check("Alice").await.is_permit());
    }

    #[test]
    fn test_degraded_gate_permits() {
        let gate = Gate::degraded(SettingsHandle::detached(Settings::default()));
        assert!(gate.check_cached("anyone").is_permit());
    }
}
