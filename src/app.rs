//! Startup wiring
//!
//! Everything is built once here and handed out by reference: migrations,
//! then the store, then the legacy list import, then the first snapshot load.
//! If any of that fails the app still comes up, with the allow-list feature
//! inactive, rather than taking the host down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Settings, SettingsHandle};
use crate::gate::Gate;
use crate::migration::{self, Pipeline};
use crate::operator::Operator;
use crate::repository::{self, Repository};
use crate::server::AppState;
use crate::{Result, storage};

pub struct App {
    data_dir: PathBuf,
    settings: SettingsHandle,
    repository: Option<Arc<Repository>>,
    gate: Gate,
    init_error: Option<String>,
}

impl App {
    /// Start, falling back to degraded mode on any initialization failure.
    pub async fn start(data_dir: impl Into<PathBuf>) -> App {
        let data_dir = data_dir.into();
        match Self::try_start(&data_dir).await {
            Ok(app) => app,
            Err(e) => {
                tracing::error!("Whitelist initialization failed, running without it: {}", e);
                let settings = SettingsHandle::detached(Settings::default());
                App {
                    gate: Gate::degraded(settings.clone()),
                    data_dir,
                    settings,
                    repository: None,
                    init_error: Some(e.to_string()),
                }
            }
        }
    }

    /// Start, surfacing the first fatal error.
    pub async fn try_start(data_dir: &Path) -> Result<App> {
        let started = Instant::now();

        let pipeline = Pipeline::new(data_dir);
        let (settings, report) = pipeline.run().await?;
        if !report.steps.is_empty() {
            tracing::info!(
                "Config migrated from version {} in {} step(s)",
                report.from_generation,
                report.steps.len()
            );
        }

        let database = settings.database.clone();
        let settings = SettingsHandle::new(settings, pipeline.config_path());

        let store = storage::open(&database, data_dir).await?;
        let repository = Arc::new(Repository::new(store));

        if let Err(e) = migration::import_legacy_allowlist(data_dir, &repository).await {
            tracing::error!("Failed to migrate the old whitelist file: {}", e);
        }

        if let Err(e) = repository.refresh().await {
            tracing::warn!("Initial whitelist load failed, reading from the store until it recovers: {}", e);
        }

        tracing::info!(
            "Whitelist loaded: {} players, took {:?}",
            repository.len().await,
            started.elapsed()
        );

        Ok(App {
            data_dir: data_dir.to_path_buf(),
            gate: Gate::new(settings.clone(), repository.clone()),
            settings,
            repository: Some(repository),
            init_error: None,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn is_degraded(&self) -> bool {
        self.repository.is_none()
    }

    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn repository(&self) -> Result<&Arc<Repository>> {
        repository::require(self.repository.as_ref())
    }

    pub fn operator(&self) -> Result<Operator> {
        Ok(Operator::new(self.settings.clone(), self.repository()?.clone()))
    }

    /// The remote add/remove routes only get an operator when `remote.enabled` is set.
    pub fn server_state(&self) -> Arc<AppState> {
        let admin = self.operator().ok();
        let remote = if self.settings.read(|s| s.remote.enabled) {
            admin.clone()
        } else {
            None
        };
        Arc::new(AppState {
            gate: self.gate.clone(),
            remote,
            admin,
            settings: self.settings.clone(),
        })
    }

    pub async fn shutdown(&self) {
        if let Some(repository) = &self.repository {
            repository.shutdown().await;
        }
        tracing::info!("Allowgate stopped");
    }
}
