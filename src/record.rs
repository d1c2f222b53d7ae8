//! Persisted per-set records and the migration from the split legacy layout.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::store::{get_item, items_with_prefix, remove_item, set_item};

pub const RECORD_KEY_PREFIX: &str = "set_";
pub const LEGACY_INFO_KEY_PREFIX: &str = "setInfo_";

pub fn record_key(full_number: &str) -> String {
  format!("{RECORD_KEY_PREFIX}{full_number}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInfo {
  #[serde(default)]
  pub number: String,
  #[serde(default)]
  pub full_number: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub year: i32,
  #[serde(default, rename = "numParts")]
  pub total_parts_declared: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_url: Option<String>,
  #[serde(default)]
  pub last_accessed: i64,
}

impl SetInfo {
  /// `10294-1` becomes number `10294`.
  pub fn new(full_number: impl Into<String>, name: impl Into<String>) -> Self {
    let full_number = full_number.into();
    let number = base_number(&full_number).to_string();
    Self {
      number,
      full_number,
      name: name.into(),
      ..Self::default()
    }
  }
}

pub fn base_number(full_number: &str) -> &str {
  full_number
    .split_once('-')
    .map(|(number, _)| number)
    .unwrap_or(full_number)
}

/// When the set was last backed up and how many pieces were done at that time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMarker {
  pub backed_up_at: i64,
  pub completed: u32,
}

/// The consolidated record stored under `set_<fullNumber>`.
///
/// `progress: None` means the set was never counted; `Some("")` means it was and
/// nothing is found. The two backup fields are stored side by side on the wire
/// but only ever exist together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SetRecordWire", into = "SetRecordWire")]
pub struct SetRecord {
  pub info: SetInfo,
  pub progress: Option<String>,
  pub backup: Option<BackupMarker>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetRecordWire {
  #[serde(flatten)]
  info: SetInfo,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  progress: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  backup: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  backup_completed: Option<u32>,
}

impl From<SetRecordWire> for SetRecord {
  fn from(wire: SetRecordWire) -> Self {
    let backup = match (wire.backup, wire.backup_completed) {
      (Some(backed_up_at), Some(completed)) => Some(BackupMarker {
        backed_up_at,
        completed,
      }),
      _ => None,
    };
    Self {
      info: wire.info,
      progress: wire.progress,
      backup,
    }
  }
}

impl From<SetRecord> for SetRecordWire {
  fn from(record: SetRecord) -> Self {
    Self {
      info: record.info,
      progress: record.progress,
      backup: record.backup.map(|marker| marker.backed_up_at),
      backup_completed: record.backup.map(|marker| marker.completed),
    }
  }
}

impl SetRecord {
  pub fn new(info: SetInfo) -> Self {
    Self {
      info,
      progress: None,
      backup: None,
    }
  }

  pub fn full_number(&self) -> &str {
    &self.info.full_number
  }

  pub fn progress_str(&self) -> &str {
    self.progress.as_deref().unwrap_or_default()
  }

  pub fn mark_backed_up(&mut self, completed: u32, when: i64) {
    self.backup = Some(BackupMarker {
      backed_up_at: when,
      completed,
    });
  }

  pub fn clear_backup_marker(&mut self) {
    self.backup = None;
  }
}

fn parse_record(full_number: &str, raw: &str) -> StoreResult<SetRecord> {
  let mut record: SetRecord = serde_json::from_str(raw)?;
  if record.info.full_number.is_empty() {
    record.info.full_number = full_number.to_string();
  }
  if record.info.number.is_empty() {
    record.info.number = base_number(full_number).to_string();
  }
  Ok(record)
}

enum StoredRecord {
  Consolidated(SetRecord),
  /// Bare progress string left under the record key with no metadata partner.
  RawProgress(String),
  Damaged {
    progress: Option<String>,
    error: serde_json::Error,
  },
}

fn read_stored(connection: &Connection, full_number: &str) -> StoreResult<Option<StoredRecord>> {
  let Some(raw) = get_item(connection, &record_key(full_number))? else {
    return Ok(None);
  };
  let stored = match serde_json::from_str::<Value>(&raw) {
    Ok(Value::Object(object)) => match parse_record(full_number, &raw) {
      Ok(record) => StoredRecord::Consolidated(record),
      Err(StoreError::Json(error)) => StoredRecord::Damaged {
        progress: object
          .get("progress")
          .and_then(Value::as_str)
          .map(str::to_string),
        error,
      },
      Err(err) => return Err(err),
    },
    _ => StoredRecord::RawProgress(raw),
  };
  Ok(Some(stored))
}

/// A bare progress string under the record key reads as a record with only its
/// set number filled in.
pub fn get_record(connection: &Connection, full_number: &str) -> StoreResult<Option<SetRecord>> {
  match read_stored(connection, full_number)? {
    None => Ok(None),
    Some(StoredRecord::Consolidated(record)) => Ok(Some(record)),
    Some(StoredRecord::RawProgress(raw)) => {
      let mut record = SetRecord::new(SetInfo::new(full_number, ""));
      record.progress = Some(raw);
      Ok(Some(record))
    }
    Some(StoredRecord::Damaged { error, .. }) => Err(StoreError::Json(error)),
  }
}

/// Record for a set being loaded, created from `info` when missing. A bare
/// progress string or an unreadable record is rebuilt around `info`, keeping
/// whatever progress string it held.
pub fn open_record(connection: &Connection, info: SetInfo, now: i64) -> StoreResult<SetRecord> {
  let full_number = info.full_number.clone();
  let progress = match read_stored(connection, &full_number)? {
    Some(StoredRecord::Consolidated(record)) => return Ok(record),
    None => None,
    Some(StoredRecord::RawProgress(raw)) => {
      log::info!("adopting bare progress stored for set {full_number}");
      Some(raw)
    }
    Some(StoredRecord::Damaged { progress, error }) => {
      log::warn!("rebuilding unreadable record for set {full_number}: {error}");
      progress
    }
  };

  let mut info = info;
  info.last_accessed = now;
  let record = SetRecord {
    info,
    progress,
    backup: None,
  };
  upsert_record(connection, &record)?;
  Ok(record)
}

fn require_record(connection: &Connection, full_number: &str) -> StoreResult<SetRecord> {
  get_record(connection, full_number)?.ok_or_else(|| StoreError::NotFound(full_number.to_string()))
}

/// Every consolidated record, most recently worked on first. Values under the
/// record prefix that are not records (unmigrated raw progress) are skipped.
pub fn list_records(connection: &Connection) -> StoreResult<Vec<SetRecord>> {
  let mut records = Vec::new();
  for (key, raw) in items_with_prefix(connection, RECORD_KEY_PREFIX)? {
    let full_number = &key[RECORD_KEY_PREFIX.len()..];
    if !is_consolidated(&raw) {
      continue;
    }
    match parse_record(full_number, &raw) {
      Ok(record) => records.push(record),
      Err(err) => log::warn!("skipping unreadable record {key}: {err}"),
    }
  }
  records.sort_by(|a, b| {
    b.info
      .last_accessed
      .cmp(&a.info.last_accessed)
      .then_with(|| a.info.full_number.cmp(&b.info.full_number))
  });
  Ok(records)
}

pub fn upsert_record(connection: &Connection, record: &SetRecord) -> StoreResult<()> {
  let raw = serde_json::to_string(record)?;
  set_item(connection, &record_key(record.full_number()), &raw)
}

/// Stores a new progress string as the result of counting and bumps `lastAccessed`.
pub fn save_progress(
  connection: &Connection,
  full_number: &str,
  progress: &str,
  now: i64,
) -> StoreResult<SetRecord> {
  let mut record = require_record(connection, full_number)?;
  record.progress = Some(progress.to_string());
  record.info.last_accessed = now;
  upsert_record(connection, &record)?;
  Ok(record)
}

pub fn mark_backed_up(
  connection: &Connection,
  full_number: &str,
  completed: u32,
  when: i64,
) -> StoreResult<()> {
  let mut record = require_record(connection, full_number)?;
  record.mark_backed_up(completed, when);
  upsert_record(connection, &record)
}

pub fn clear_backup_marker(connection: &Connection, full_number: &str) -> StoreResult<()> {
  let mut record = require_record(connection, full_number)?;
  if record.backup.is_none() {
    return Ok(());
  }
  record.clear_backup_marker();
  upsert_record(connection, &record)
}

pub fn delete_record(connection: &Connection, full_number: &str) -> StoreResult<bool> {
  remove_item(connection, &record_key(full_number))
}

fn is_consolidated(raw: &str) -> bool {
  matches!(serde_json::from_str::<Value>(raw), Ok(Value::Object(_)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
  pub migrated: Vec<String>,
  pub skipped: Vec<String>,
}

impl MigrationReport {
  pub fn is_noop(&self) -> bool {
    self.migrated.is_empty() && self.skipped.is_empty()
  }
}

/// Folds `setInfo_<n>` metadata plus its raw progress (`set_<n>` or bare `<n>`)
/// into one consolidated `set_<n>` record, leaving the progress string as stored.
///
/// Runs in one transaction and only touches keys belonging to a legacy pair, so a
/// second run over migrated data does nothing.
pub fn migrate_if_needed(connection: &mut Connection) -> StoreResult<MigrationReport> {
  let tx = connection.transaction()?;
  let mut report = MigrationReport::default();

  for (info_key, info_raw) in items_with_prefix(&tx, LEGACY_INFO_KEY_PREFIX)? {
    let full_number = info_key[LEGACY_INFO_KEY_PREFIX.len()..].to_string();
    let consolidated_key = record_key(&full_number);

    let mut info: SetInfo = match serde_json::from_str(&info_raw) {
      Ok(info) => info,
      Err(err) => {
        log::warn!("leaving {info_key} in place, metadata is unreadable: {err}");
        report.skipped.push(full_number);
        continue;
      }
    };
    if info.full_number.is_empty() {
      info.full_number = full_number.clone();
    }
    if info.number.is_empty() {
      info.number = base_number(&full_number).to_string();
    }

    let prefixed = get_item(&tx, &consolidated_key)?;
    let already_consolidated = prefixed.as_deref().is_some_and(is_consolidated);

    if !already_consolidated {
      let progress = match prefixed {
        Some(raw) => raw,
        None => get_item(&tx, &full_number)?.unwrap_or_default(),
      };
      let record = SetRecord {
        info,
        progress: Some(progress),
        backup: None,
      };
      set_item(&tx, &consolidated_key, &serde_json::to_string(&record)?)?;
    }

    remove_item(&tx, &info_key)?;
    remove_item(&tx, &full_number)?;
    report.migrated.push(full_number);
  }

  tx.commit()?;
  if !report.migrated.is_empty() {
    log::info!("migrated {} legacy set record(s)", report.migrated.len());
  }
  Ok(report)
}
