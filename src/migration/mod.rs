//! Startup migrations for on-disk state
//!
//! Runs before anything else touches the data directory:
//! 1. a legacy flat `config.toml` is folded into the structured document (once, any generation)
//! 2. the document is stepped from its `config_version` up to [`CONFIG_VERSION`]
//! 3. after the store is open, a legacy `whitelist.json` is imported into it
//!
//! Every step rewrites the document together with its new generation in a
//! single atomic replace, so a crash leaves either the old or the new file and
//! the next start simply resumes. Steps only add what is missing, re-running
//! one is harmless.

pub mod legacy;

use std::path::{Path, PathBuf};

use toml::{Table, Value};

use crate::config::{
    self, CONFIG_VERSION, LEGACY_ALLOWLIST_FILE, LEGACY_CONFIG_FILE, Settings, write_atomic,
};
use crate::repository::Repository;
use crate::{Error, Result};

/// One generation upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// 1 → 2: structured messages section, defaults rebuilt around the old flags
    Messages,
    /// 2 → 3: database section
    Database,
}

impl Step {
    pub fn starting_at(generation: i64) -> Option<Step> {
        match generation {
            1 => Some(Step::Messages),
            2 => Some(Step::Database),
            _ => None,
        }
    }

    pub fn from(self) -> i64 {
        match self {
            Step::Messages => 1,
            Step::Database => 2,
        }
    }

    pub fn to(self) -> i64 {
        self.from() + 1
    }

    fn apply(self, doc: &mut Table) -> Result<()> {
        match self {
            Step::Messages => {
                let mut next = template(2)?;
                for key in ["enabled", "prefix", "enable_clear_command"] {
                    if let Some(value) = doc.get(key) {
                        next.insert(key.to_string(), value.clone());
                    }
                }

                let messages = section(&mut next, "messages");
                if let Some(Value::Table(old)) = doc.get("messages") {
                    for (key, value) in old {
                        messages.insert(key.clone(), value.clone());
                    }
                }
                if let Some(kick) = doc.get("kick_message") {
                    messages.insert("kick_message".to_string(), kick.clone());
                }

                *doc = next;
            }
            Step::Database => fill_missing(doc, &template(3)?),
        }
        doc.insert("config_version".to_string(), Value::Integer(self.to()));
        Ok(())
    }
}

/// What a pipeline run changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub created_config: bool,
    pub legacy_config_imported: bool,
    pub from_generation: i64,
    pub steps: Vec<Step>,
}

/// Outcome of the legacy allow-list import
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub failed: usize,
    /// Where the original file went; `None` while it stays in place for a retry
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    data_dir: PathBuf,
}

impl Pipeline {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        config::config_path_in(&self.data_dir)
    }

    fn legacy_config_path(&self) -> PathBuf {
        self.data_dir.join(LEGACY_CONFIG_FILE)
    }

    /// Bring the configuration document up to [`CONFIG_VERSION`] and load it.
    ///
    /// Steps run one at a time on the blocking pool; each is on disk before the next starts.
    pub async fn run(&self) -> Result<(Settings, MigrationReport)> {
        let mut report = MigrationReport::default();
        tokio::fs::create_dir_all(&self.data_dir).await?;

        if self.legacy_config_path().exists() {
            tracing::info!("Found legacy {}, importing it", LEGACY_CONFIG_FILE);
            match self.blocking(Pipeline::import_legacy_config).await {
                Ok(()) => {
                    report.legacy_config_imported = true;
                    tracing::info!("Legacy config migration completed");
                }
                Err(e) => tracing::error!(
                    "The old config is broken, can't migrate automatically: {}",
                    e
                ),
            }
        }

        if !self.config_path().exists() {
            self.blocking(|p| write_document(&p.config_path(), &template(CONFIG_VERSION)?))
                .await?;
            report.created_config = true;
            tracing::info!("Created default config at {}", self.config_path().display());
        }

        let mut generation = self.blocking(|p| generation_of(&read_document(&p.config_path())?)).await?;
        report.from_generation = generation;

        while generation < CONFIG_VERSION {
            let step = Step::starting_at(generation).ok_or(Error::UnknownGeneration(generation))?;
            tracing::info!("Migrating config from version {} to {}", step.from(), step.to());
            generation = self.blocking(move |p| p.apply_step(step)).await?;
            report.steps.push(step);
        }

        let settings = self.blocking(|p| config::load_settings(&p.config_path())).await?;
        Ok((settings, report))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Pipeline) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || f(&pipeline))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    /// Returns the generation on disk after the call.
    fn apply_step(&self, step: Step) -> Result<i64> {
        let path = self.config_path();
        let mut doc = read_document(&path)?;
        let current = generation_of(&doc)?;
        if current >= step.to() {
            tracing::debug!("Config already at version {}, skipping {:?}", current, step);
            return Ok(current);
        }

        step.apply(&mut doc)?;
        write_document(&path, &doc)?;
        Ok(step.to())
    }

    /// Fold the flat legacy file into the structured document, then move it aside.
    ///
    /// A broken legacy file aborts before anything is written.
    fn import_legacy_config(&self) -> Result<()> {
        let legacy_path = self.legacy_config_path();
        let legacy = legacy::read_flat_config(&legacy_path)?;

        let config_path = self.config_path();
        let mut doc = if config_path.exists() {
            read_document(&config_path)?
        } else {
            template(CONFIG_VERSION)?
        };

        doc.insert("enabled".to_string(), Value::Boolean(legacy.enabled));
        doc.insert("prefix".to_string(), Value::String(legacy.prefix));
        section(&mut doc, "messages")
            .insert("kick_message".to_string(), Value::String(legacy.message));
        write_document(&config_path, &doc)?;

        let moved_to = legacy::free_sibling(&legacy_path, ".migrated");
        std::fs::rename(&legacy_path, &moved_to)?;
        tracing::info!("Old {} kept as {}", LEGACY_CONFIG_FILE, moved_to.display());
        Ok(())
    }
}

/// Import a legacy `whitelist.json` into the store.
///
/// Returns `Ok(None)` when there is nothing to import. A malformed file aborts
/// the import and stays where it is. If any entry failed to insert the file is
/// also left in place so the next start retries; duplicates make that safe.
pub async fn import_legacy_allowlist(
    data_dir: &Path,
    repository: &Repository,
) -> Result<Option<ImportReport>> {
    let path = data_dir.join(LEGACY_ALLOWLIST_FILE);
    if !path.exists() {
        return Ok(None);
    }

    tracing::info!("Found legacy {}, importing it", LEGACY_ALLOWLIST_FILE);
    let source = path.clone();
    let entries = tokio::task::spawn_blocking(move || legacy::read_allowlist_file(&source))
        .await
        .map_err(|e| Error::Task(e.to_string()))??;

    let mut report = ImportReport {
        total: entries.len(),
        ..ImportReport::default()
    };

    let outcome = repository.add_batch(&entries).await;
    report.migrated = outcome.added;
    report.skipped = outcome.present;
    report.invalid = outcome.invalid;
    report.failed = outcome.failed;

    tracing::info!(
        "Migrated {} of {} players ({} already present, {} invalid, {} failed)",
        report.migrated,
        report.total,
        report.skipped,
        report.invalid,
        report.failed
    );

    if report.failed > 0 {
        tracing::error!(
            "{} entries could not be imported, keeping {} for the next start",
            report.failed,
            LEGACY_ALLOWLIST_FILE
        );
        return Ok(Some(report));
    }

    let backup = legacy::free_sibling(&path, ".backup");
    tokio::fs::rename(&path, &backup).await?;
    tracing::info!("Old {} kept as {}", LEGACY_ALLOWLIST_FILE, backup.display());
    report.backup = Some(backup);
    Ok(Some(report))
}

fn read_document(path: &Path) -> Result<Table> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

fn write_document(path: &Path, doc: &Table) -> Result<()> {
    write_atomic(path, &toml::to_string_pretty(doc)?)
}

/// Read `config_version`; anything outside the known range is fatal.
fn generation_of(doc: &Table) -> Result<i64> {
    let generation = match doc.get("config_version") {
        Some(Value::Integer(v)) => *v,
        other => {
            tracing::error!("Config has no usable config_version: {:?}", other);
            0
        }
    };
    if !(1..=CONFIG_VERSION).contains(&generation) {
        return Err(Error::UnknownGeneration(generation));
    }
    Ok(generation)
}

/// The default document as it looked at `generation` (2 or 3).
fn template(generation: i64) -> Result<Table> {
    let mut doc: Table = toml::from_str(&toml::to_string(&Settings::default())?)?;
    if generation < 3 {
        doc.remove("database");
    }
    doc.insert("config_version".to_string(), Value::Integer(generation));
    Ok(doc)
}

/// Get or create the sub-table `key`, replacing a non-table value.
fn section<'a>(doc: &'a mut Table, key: &str) -> &'a mut Table {
    let entry = doc
        .entry(key.to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    if !entry.is_table() {
        *entry = Value::Table(Table::new());
    }
    match entry {
        Value::Table(table) => table,
        _ => unreachable!("entry was just made a table"),
    }
}

/// Copy every key of `defaults` that `target` lacks, recursing into tables.
fn fill_missing(target: &mut Table, defaults: &Table) {
    for (key, default) in defaults {
        match (target.get_mut(key), default) {
            (None, _) => {
                target.insert(key.clone(), default.clone());
            }
            (Some(Value::Table(existing)), Value::Table(nested)) => fill_missing(existing, nested),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendKind, SqliteStore};
    use std::sync::Arc;

    const GENERATION_1: &str = r#"
config_version = 1
enabled = false
prefix = "<gold>[VCL]</gold>"
enable_clear_command = true
kick_message = "Not on the list"
"#;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_fresh_install_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(dir.path());

        let (settings, report) = pipeline.run().await.unwrap();
        assert!(report.created_config);
        assert!(report.steps.is_empty());
        assert_eq!(settings, Settings::default());
        assert!(pipeline.config_path().exists());
    }

    #[tokio::test]
    async fn test_generation_1_to_3_keeps_flags() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), config::CONFIG_FILE, GENERATION_1);

        let (settings, report) = Pipeline::new(dir.path()).run().await.unwrap();
        assert_eq!(report.from_generation, 1);
        assert_eq!(report.steps, vec![Step::Messages, Step::Database]);

        assert_eq!(settings.config_version, 3);
        assert!(!settings.enabled);
        assert_eq!(settings.prefix, "<gold>[VCL]</gold>");
        assert!(settings.enable_clear_command);
        assert_eq!(settings.messages.kick_message, "Not on the list");

        let doc = read_document(&config::config_path_in(dir.path())).unwrap();
        assert!(doc.contains_key("messages"));
        let database = doc["database"].as_table().unwrap();
        assert!(database.contains_key("mysql"));
        assert!(database.contains_key("pool"));
        assert_eq!(database["type"].as_str(), Some("sqlite"));
        assert!(!doc.contains_key("kick_message"));
    }

    #[tokio::test]
    async fn test_generation_2_keeps_existing_database_keys() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            config::CONFIG_FILE,
            r#"
config_version = 2
enabled = true
[database]
type = "mysql"
[database.mysql]
host = "db.example"
"#,
        );

        let (settings, report) = Pipeline::new(dir.path()).run().await.unwrap();
        assert_eq!(report.steps, vec![Step::Database]);
        assert_eq!(settings.database.kind, BackendKind::Mysql);
        assert_eq!(settings.database.mysql.host, "db.example");
        assert_eq!(settings.database.mysql.port, 3306);
    }

    #[tokio::test]
    async fn test_rerun_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), config::CONFIG_FILE, GENERATION_1);
        let pipeline = Pipeline::new(dir.path());

        let (first, _) = pipeline.run().await.unwrap();
        let before = std::fs::read_to_string(pipeline.config_path()).unwrap();

        let (second, report) = pipeline.run().await.unwrap();
        assert!(report.steps.is_empty());
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(pipeline.config_path()).unwrap(), before);
    }

    #[test]
    fn test_step_skips_when_already_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(dir.path());
        write_document(&pipeline.config_path(), &template(3).unwrap()).unwrap();

        assert_eq!(pipeline.apply_step(Step::Database).unwrap(), 3);
        assert_eq!(pipeline.apply_step(Step::Messages).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_generation_is_fatal() {
        for version in ["config_version = 99", "config_version = 0", "config_version = \"three\"", "enabled = true"] {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), config::CONFIG_FILE, version);

            let err = Pipeline::new(dir.path()).run().await.unwrap_err();
            assert!(matches!(err, Error::UnknownGeneration(_)), "{version}: {err}");
        }
    }

    #[tokio::test]
    async fn test_legacy_config_imported_then_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            LEGACY_CONFIG_FILE,
            "enabled = false\nmessage = \"Whitelist only\"\nprefix = \"[Old]\"\n",
        );

        let (settings, report) = Pipeline::new(dir.path()).run().await.unwrap();
        assert!(report.legacy_config_imported);
        assert!(!settings.enabled);
        assert_eq!(settings.prefix, "[Old]");
        assert_eq!(settings.messages.kick_message, "Whitelist only");
        assert!(!dir.path().join(LEGACY_CONFIG_FILE).exists());
        assert!(dir.path().join("config.toml.migrated").exists());
    }

    #[tokio::test]
    async fn test_legacy_config_into_generation_1_document() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), config::CONFIG_FILE, GENERATION_1);
        write(
            dir.path(),
            LEGACY_CONFIG_FILE,
            "enabled = true\nmessage = \"From legacy\"\nprefix = \"[L]\"\n",
        );

        let (settings, report) = Pipeline::new(dir.path()).run().await.unwrap();
        assert!(report.legacy_config_imported);
        assert_eq!(report.steps.len(), 2);
        assert!(settings.enabled);
        assert_eq!(settings.prefix, "[L]");
        // The top-level kick_message of generation 1 wins over the imported one
        assert_eq!(settings.messages.kick_message, "Not on the list");
    }

    #[tokio::test]
    async fn test_broken_legacy_config_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), LEGACY_CONFIG_FILE, "enabled = true\n");

        let (settings, report) = Pipeline::new(dir.path()).run().await.unwrap();
        assert!(!report.legacy_config_imported);
        assert!(report.created_config);
        assert_eq!(settings, Settings::default());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(LEGACY_CONFIG_FILE)).unwrap(),
            "enabled = true\n"
        );
    }

    fn repository() -> Repository {
        Repository::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_legacy_allowlist_import() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), LEGACY_ALLOWLIST_FILE, r#"["Alice","bob"]"#);
        let repo = repository();

        let report = import_legacy_allowlist(dir.path(), &repo).await.unwrap().unwrap();
        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped, 0);

        assert!(repo.contains("ALICE").await);
        assert!(repo.contains("Bob").await);
        assert!(!dir.path().join(LEGACY_ALLOWLIST_FILE).exists());
        let backup = dir.path().join("whitelist.json.backup");
        assert_eq!(report.backup.as_deref(), Some(backup.as_path()));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), r#"["Alice","bob"]"#);
    }

    #[tokio::test]
    async fn test_legacy_allowlist_skips_duplicates_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), LEGACY_ALLOWLIST_FILE, r#"["Alice","ALICE","carol","", "two words"]"#);
        let repo = repository();
        repo.add("carol").await;

        let report = import_legacy_allowlist(dir.path(), &repo).await.unwrap().unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.invalid, 2);
        assert_eq!(repo.len().await, 2);
    }

    #[tokio::test]
    async fn test_legacy_allowlist_missing_or_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository();
        assert!(import_legacy_allowlist(dir.path(), &repo).await.unwrap().is_none());

        write(dir.path(), LEGACY_ALLOWLIST_FILE, "[\"unterminated");
        assert!(import_legacy_allowlist(dir.path(), &repo).await.is_err());
        assert!(dir.path().join(LEGACY_ALLOWLIST_FILE).exists());
        assert!(repo.is_empty().await);
    }

    #[test]
    fn test_fill_missing_keeps_existing_values() {
        let mut target: Table = toml::from_str("a = 1\n[t]\nx = \"keep\"\n").unwrap();
        let defaults: Table = toml::from_str("a = 2\nb = 3\n[t]\nx = \"new\"\ny = true\n").unwrap();

        fill_missing(&mut target, &defaults);
        assert_eq!(target["a"].as_integer(), Some(1));
        assert_eq!(target["b"].as_integer(), Some(3));
        assert_eq!(target["t"]["x"].as_str(), Some("keep"));
        assert_eq!(target["t"]["y"].as_bool(), Some(true));
    }
}
