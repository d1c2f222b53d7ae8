use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::backup::{backup_file_name, producer_tag, BackupSnapshot, BACKUP_FILE_EXTENSION};
use crate::error::{ConfigError, ConfigResult, StoreResult};
use crate::record::{migrate_if_needed, MigrationReport};
use crate::session::DEFAULT_SAVE_DEBOUNCE_MS;
use crate::store::{init_database, open_database};

pub const ENV_DB_PATH: &str = "BRICKTALLY_DB_PATH";
pub const ENV_DEBOUNCE_MS: &str = "BRICKTALLY_DEBOUNCE_MS";
pub const ENV_PRODUCER: &str = "BRICKTALLY_PRODUCER";
pub const ENV_BACKUP_EXTENSION: &str = "BRICKTALLY_BACKUP_EXTENSION";

const DEFAULT_DB_FILE: &str = "bricktally.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
  pub database_path: PathBuf,
  pub producer_tag: String,
  pub save_debounce_ms: i64,
  pub backup_extension: String,
  pub run_migrations: bool,
}

impl Default for TallyConfig {
  fn default() -> Self {
    Self {
      database_path: PathBuf::from(DEFAULT_DB_FILE),
      producer_tag: producer_tag(),
      save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
      backup_extension: BACKUP_FILE_EXTENSION.to_string(),
      run_migrations: true,
    }
  }
}

impl TallyConfig {
  pub fn from_toml_str(contents: &str, origin: &str) -> ConfigResult<Self> {
    toml::from_str(contents).map_err(|e| ConfigError::Parse {
      path: origin.to_string(),
      message: e.to_string(),
    })
  }

  pub fn to_toml_string(&self) -> ConfigResult<String> {
    toml::to_string_pretty(self)
      .map_err(|e| ConfigError::Invalid(format!("failed to render config: {e}")))
  }

  /// Reads `path` when it exists, falls back to defaults otherwise, then applies
  /// the process environment.
  pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
    let mut config = match path {
      Some(path) if path.exists() => {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
          path: path.display().to_string(),
          source,
        })?;
        Self::from_toml_str(&contents, &path.display().to_string())?
      }
      _ => Self::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
  }

  pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(path) = lookup(ENV_DB_PATH).filter(|value| !value.trim().is_empty()) {
      self.database_path = PathBuf::from(path);
    }
    if let Some(raw) = lookup(ENV_DEBOUNCE_MS) {
      self.save_debounce_ms = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{ENV_DEBOUNCE_MS} is not a number: {raw:?}")))?;
    }
    if let Some(tag) = lookup(ENV_PRODUCER).filter(|value| !value.trim().is_empty()) {
      self.producer_tag = tag;
    }
    if let Some(extension) = lookup(ENV_BACKUP_EXTENSION) {
      self.backup_extension = extension;
    }
    Ok(())
  }

  pub fn validate(&self) -> ConfigResult<()> {
    if self.database_path.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("database_path is empty".to_string()));
    }
    if self.save_debounce_ms < 0 {
      return Err(ConfigError::Invalid(format!(
        "save_debounce_ms must not be negative, got {}",
        self.save_debounce_ms
      )));
    }
    if self.producer_tag.trim().is_empty() {
      return Err(ConfigError::Invalid("producer_tag is empty".to_string()));
    }
    let extension = self.backup_extension.as_str();
    if extension.is_empty() || extension.starts_with('.') || extension.contains('/') {
      return Err(ConfigError::Invalid(format!(
        "backup_extension {extension:?} must be a bare extension"
      )));
    }
    Ok(())
  }

  /// Opens the configured database, creating it if needed, and folds any legacy
  /// records into the current layout.
  pub fn open_store(&self) -> StoreResult<(Connection, MigrationReport)> {
    init_database(&self.database_path)?;
    let mut connection = open_database(&self.database_path)?;
    let report = if self.run_migrations {
      migrate_if_needed(&mut connection)?
    } else {
      MigrationReport::default()
    };
    Ok((connection, report))
  }

  pub fn backup_file_name(&self, snapshot: &BackupSnapshot, date: NaiveDate) -> String {
    backup_file_name(snapshot, date, &self.backup_extension)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::collections::HashMap;

  use crate::store::{get_item, set_item};

  fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(key, value)| (key.to_string(), value.to_string()))
      .collect()
  }

  #[test]
  fn defaults_are_valid() {
    let config = TallyConfig::default();
    config.validate().expect("defaults");
    assert_eq!(config.save_debounce_ms, DEFAULT_SAVE_DEBOUNCE_MS);
    assert_eq!(config.backup_extension, "bricktally");
    assert!(config.producer_tag.starts_with("BrickTally/"));
  }

  #[test]
  fn partial_file_keeps_other_defaults() {
    let config = TallyConfig::from_toml_str(
      r#"
        database_path = "/var/lib/bricktally/sets.db"
        save_debounce_ms = 1000
      "#,
      "inline",
    )
    .expect("parse");
    assert_eq!(config.database_path, PathBuf::from("/var/lib/bricktally/sets.db"));
    assert_eq!(config.save_debounce_ms, 1000);
    assert!(config.run_migrations);

    let err = TallyConfig::from_toml_str("save_debounce_ms = \"soon\"", "inline")
      .expect_err("bad type");
    assert!(matches!(err, ConfigError::Parse { .. }));
  }

  #[test]
  fn environment_overrides_file_values() {
    let mut config = TallyConfig::default();
    let vars = env(&[
      (ENV_DB_PATH, "/tmp/other.db"),
      (ENV_DEBOUNCE_MS, " 50 "),
      (ENV_PRODUCER, "BrickTally/9.9.9"),
    ]);
    config
      .apply_overrides(|name| vars.get(name).cloned())
      .expect("overrides");

    assert_eq!(config.database_path, PathBuf::from("/tmp/other.db"));
    assert_eq!(config.save_debounce_ms, 50);
    assert_eq!(config.producer_tag, "BrickTally/9.9.9");

    let vars = env(&[(ENV_DEBOUNCE_MS, "later")]);
    assert!(config.apply_overrides(|name| vars.get(name).cloned()).is_err());
  }

  #[test]
  fn validation_rejects_bad_values() {
    let mut config = TallyConfig {
      save_debounce_ms: -1,
      ..TallyConfig::default()
    };
    assert!(config.validate().is_err());

    config.save_debounce_ms = 0;
    config.backup_extension = ".bricktally".to_string();
    assert!(config.validate().is_err());
  }

  #[test]
  fn load_reads_file_and_open_store_migrates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("data").join("sets.db");
    let config_path = dir.path().join("bricktally.toml");
    let rendered = TallyConfig {
      database_path: db_path.clone(),
      ..TallyConfig::default()
    }
    .to_toml_string()
    .expect("render");
    fs::write(&config_path, rendered).expect("write config");

    let config = TallyConfig::from_toml_str(
      &fs::read_to_string(&config_path).expect("read"),
      &config_path.display().to_string(),
    )
    .expect("parse");
    assert_eq!(config.database_path, db_path);

    init_database(&db_path).expect("init");
    let seed = open_database(&db_path).expect("open");
    set_item(
      &seed,
      "setInfo_99001-1",
      r#"{"number":"99001","fullNumber":"99001-1","name":"Test Set","year":2024,"numParts":10,"lastAccessed":1}"#,
    )
    .expect("seed");
    set_item(&seed, "99001-1", "3001_Red:5").expect("seed");
    drop(seed);

    let (connection, report) = config.open_store().expect("open store");
    assert_eq!(report.migrated, vec!["99001-1".to_string()]);
    assert!(get_item(&connection, "set_99001-1").expect("get").is_some());
  }

  #[test]
  fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = TallyConfig::load(Some(&dir.path().join("absent.toml"))).expect("load");
    assert!(config.run_migrations);
    assert_eq!(
      TallyConfig::from_toml_str("", "empty").expect("empty file"),
      TallyConfig::default()
    );
  }
}
