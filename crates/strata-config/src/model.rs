use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

/// Top-level configuration consumed by the migration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Folder holding `<sequence>_<description>.(up|down).<ext>` files.
    #[serde(default)]
    pub folder: PathBuf,
    /// Name of the single-row table that records the current position.
    #[serde(default = "default_table")]
    pub table: String,
    /// Extension given to scaffolded files.
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_table() -> String {
    "migration".to_string()
}

fn default_extension() -> String {
    "sql".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::new(),
            table: default_table(),
            extension: default_extension(),
        }
    }
}

impl AppConfig {
    /// Check that every required value is present and well-formed.
    ///
    /// Does not touch the filesystem; see [`AppConfig::resolve_paths`].
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(Error::Config(
                "database path is missing from the config file".into(),
            ));
        }
        if self.migration.folder.as_os_str().is_empty() {
            return Err(Error::Config(
                "migration folder is missing from the config file".into(),
            ));
        }
        if self.migration.table.is_empty() {
            return Err(Error::Config("migration table must not be empty".into()));
        }
        if !is_identifier(&self.migration.table) {
            return Err(Error::Config(format!(
                "migration table `{}` must contain only letters, digits and underscores",
                self.migration.table
            )));
        }
        let ext = &self.migration.extension;
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Config(format!(
                "migration extension `{ext}` must be non-empty and alphanumeric"
            )));
        }
        Ok(())
    }

    /// Make relative paths absolute against `base` (the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.migration.folder.is_relative() {
            self.migration.folder = base.join(&self.migration.folder);
        }
        if self.database.path.is_relative() {
            self.database.path = base.join(&self.database.path);
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
