//! One-shot readers for the pre-database file formats.
//!
//! Only the migration pipeline calls these.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Scalar settings of the old flat `config.toml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyConfig {
    pub enabled: bool,
    /// Became `messages.kick_message`
    pub message: String,
    pub prefix: String,
}

#[derive(Deserialize)]
struct RawLegacyConfig {
    enabled: Option<bool>,
    message: Option<String>,
    prefix: Option<String>,
}

pub fn read_flat_config(path: &Path) -> Result<LegacyConfig> {
    let contents = std::fs::read_to_string(path)?;
    parse_flat_config(&contents)
}

pub fn parse_flat_config(contents: &str) -> Result<LegacyConfig> {
    let raw: RawLegacyConfig =
        toml::from_str(contents).map_err(|e| Error::LegacyFormat(e.to_string()))?;

    match (raw.enabled, raw.message, raw.prefix) {
        (Some(enabled), Some(message), Some(prefix)) => Ok(LegacyConfig { enabled, message, prefix }),
        _ => Err(Error::LegacyFormat(
            "expected `enabled`, `message` and `prefix`".to_string(),
        )),
    }
}

/// Read the old `whitelist.json` (a JSON array of names)
pub fn read_allowlist_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    parse_allowlist(&contents)
}

pub fn parse_allowlist(contents: &str) -> Result<Vec<String>> {
    // The old plugin seeded the file with nothing before writing `[]`
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    let names: Vec<String> = serde_json::from_str(contents)?;
    Ok(names)
}

/// `<path><suffix>`, or `<path><suffix>.N` for the first N that does not exist yet
pub fn free_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut base = path.as_os_str().to_os_string();
    base.push(suffix);
    let candidate = PathBuf::from(&base);
    if !candidate.exists() {
        return candidate;
    }

    (1..)
        .map(|n| {
            let mut numbered = base.clone();
            numbered.push(format!(".{n}"));
            PathBuf::from(numbered)
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
