use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgressError {
  /// No known dialect could make sense of the stored string.
  #[error("malformed progress: {0}")]
  Malformed(String),

  #[error("compression error: {0}")]
  Compression(#[from] io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl ProgressError {
  pub fn malformed(msg: impl Into<String>) -> Self {
    Self::Malformed(msg.into())
  }
}

pub type ProgressResult<T> = Result<T, ProgressError>;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("record encoding error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  /// No consolidated record exists for the set.
  #[error("set not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Progress(#[from] ProgressError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum BackupError {
  /// The document does not have the snapshot shape.
  #[error("invalid backup format: {0}")]
  InvalidFormat(String),

  /// The snapshot declares a format version this build does not read.
  #[error("unsupported backup version: {0}")]
  UnsupportedVersion(i64),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("failed to write backup: {0}")]
  Io(#[from] io::Error),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl BackupError {
  pub fn invalid_format(msg: impl Into<String>) -> Self {
    Self::InvalidFormat(msg.into())
  }

  /// Whether the error came from validating the document rather than the store.
  pub fn is_rejected_import(&self) -> bool {
    matches!(self, Self::InvalidFormat(_) | Self::UnsupportedVersion(_))
  }
}

impl From<rusqlite::Error> for BackupError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Store(StoreError::Sqlite(err))
  }
}

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {message}")]
  Parse { path: String, message: String },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
