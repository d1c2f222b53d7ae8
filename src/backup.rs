//! Backup snapshots: export, validation on import, and restore reconciliation.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{BackupError, BackupResult, StoreError};
use crate::now_iso;
use crate::record::{
  base_number, delete_record, get_record, mark_backed_up, upsert_record, SetInfo, SetRecord,
};
use crate::staleness::current_completed;

pub const BACKUP_FORMAT_VERSION: i64 = 1;
pub const BACKUP_FILE_EXTENSION: &str = "bricktally";
pub const APP_NAME: &str = "BrickTally";

/// `BrickTally/<version>` stamped into every export.
pub fn producer_tag() -> String {
  format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
  pub version: i64,
  #[serde(default)]
  pub exported_at: String,
  #[serde(default)]
  pub app: String,
  pub sets: Vec<SnapshotSet>,
}

/// One set inside a snapshot. `progress` is the stored string, never re-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSet {
  pub full_number: String,
  #[serde(default)]
  pub info: SetInfo,
  pub progress: String,
  #[serde(default)]
  pub last_worked_on: i64,
}

impl SnapshotSet {
  fn from_record(record: &SetRecord) -> Self {
    Self {
      full_number: record.info.full_number.clone(),
      info: record.info.clone(),
      progress: record.progress_str().to_string(),
      last_worked_on: record.info.last_accessed,
    }
  }

  /// The record this entry restores to: snapshot metadata and progress, its
  /// `lastWorkedOn` as `lastAccessed`, and no backup marker.
  pub fn to_record(&self) -> SetRecord {
    let mut info = self.info.clone();
    info.full_number = self.full_number.clone();
    if info.number.is_empty() {
      info.number = base_number(&self.full_number).to_string();
    }
    info.last_accessed = self.last_worked_on;
    SetRecord {
      info,
      progress: Some(self.progress.clone()),
      backup: None,
    }
  }
}

impl BackupSnapshot {
  pub fn to_json(&self) -> BackupResult<String> {
    serde_json::to_string_pretty(self).map_err(|err| BackupError::Serialization(err.to_string()))
  }

  pub fn write_to<W: Write>(&self, mut writer: W) -> BackupResult<()> {
    serde_json::to_writer_pretty(&mut writer, self).map_err(|err| {
      if err.is_io() {
        BackupError::Io(err.into())
      } else {
        BackupError::Serialization(err.to_string())
      }
    })?;
    writer.flush()?;
    Ok(())
  }

  pub fn digest(&self) -> BackupResult<String> {
    let bytes =
      serde_json::to_vec(self).map_err(|err| BackupError::Serialization(err.to_string()))?;
    Ok(snapshot_digest(&bytes))
  }
}

pub fn snapshot_digest(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

/// `BrickTally-10294-2024-11-02.bricktally` for one set,
/// `BrickTally-backup-3-sets-2024-11-02.bricktally` for several.
pub fn backup_file_name(snapshot: &BackupSnapshot, date: NaiveDate, extension: &str) -> String {
  let date = date.format("%Y-%m-%d");
  match snapshot.sets.as_slice() {
    [single] => {
      let number = if single.info.number.is_empty() {
        base_number(&single.full_number)
      } else {
        single.info.number.as_str()
      };
      format!("{APP_NAME}-{number}-{date}.{extension}")
    }
    sets => format!("{APP_NAME}-backup-{}-sets-{date}.{extension}", sets.len()),
  }
}

/// Snapshot of the named records, progress copied byte for byte.
///
/// Names are deduplicated keeping first-seen order; a name with no record fails
/// the whole export.
pub fn export_snapshot<I, S>(
  connection: &Connection,
  full_numbers: I,
  producer: &str,
  now: DateTime<Utc>,
) -> BackupResult<BackupSnapshot>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let mut seen = HashSet::new();
  let mut sets = Vec::new();
  for full_number in full_numbers {
    let full_number = full_number.as_ref();
    if !seen.insert(full_number.to_string()) {
      continue;
    }
    let record = get_record(connection, full_number)?
      .ok_or_else(|| StoreError::NotFound(full_number.to_string()))?;
    sets.push(SnapshotSet::from_record(&record));
  }

  log::info!("exported {} set(s) to a backup snapshot", sets.len());
  Ok(BackupSnapshot {
    version: BACKUP_FORMAT_VERSION,
    exported_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    app: producer.to_string(),
    sets,
  })
}

/// Parses and validates a backup document. Nothing is accepted unless every set
/// entry is well formed.
pub fn parse_snapshot(bytes: &[u8]) -> BackupResult<BackupSnapshot> {
  let document: Value = serde_json::from_slice(bytes)
    .map_err(|err| BackupError::invalid_format(format!("not a JSON document: {err}")))?;
  validate(&document)?;
  serde_json::from_value(document).map_err(|err| BackupError::invalid_format(err.to_string()))
}

/// Structural checks on a raw document, version first.
pub fn validate(document: &Value) -> BackupResult<()> {
  let object = document
    .as_object()
    .ok_or_else(|| BackupError::invalid_format("document is not an object"))?;

  let version = object
    .get("version")
    .and_then(Value::as_i64)
    .ok_or_else(|| BackupError::invalid_format("missing integer version"))?;
  if version != BACKUP_FORMAT_VERSION {
    return Err(BackupError::UnsupportedVersion(version));
  }

  let sets = object
    .get("sets")
    .and_then(Value::as_array)
    .ok_or_else(|| BackupError::invalid_format("sets is not a list"))?;

  let mut seen = HashSet::new();
  for (index, set) in sets.iter().enumerate() {
    let full_number = set
      .get("fullNumber")
      .and_then(Value::as_str)
      .filter(|full_number| !full_number.trim().is_empty())
      .ok_or_else(|| BackupError::invalid_format(format!("set {index} has no fullNumber")))?;
    if !set.get("progress").is_some_and(Value::is_string) {
      return Err(BackupError::invalid_format(format!(
        "set {full_number} has no progress"
      )));
    }
    if let Some(info) = set.get("info") {
      if !info.is_object() {
        return Err(BackupError::invalid_format(format!(
          "set {full_number} has malformed info"
        )));
      }
    }
    if !seen.insert(full_number) {
      return Err(BackupError::invalid_format(format!(
        "set {full_number} appears more than once"
      )));
    }
  }
  Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreDecision {
  KeepLocal,
  ImportRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreClass {
  New,
  Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreItem {
  pub entry: SnapshotSet,
  pub class: RestoreClass,
  pub local: Option<SetRecord>,
  pub recommended: RestoreDecision,
  pub decision: RestoreDecision,
}

/// Per-set restore plan; decisions start at the recommendation and can be
/// overridden with [`RestorePlan::decide`] before applying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
  pub snapshot_digest: String,
  pub producer: String,
  pub exported_at: String,
  pub items: Vec<RestoreItem>,
}

impl RestorePlan {
  /// Returns false when the plan has no set with that number.
  pub fn decide(&mut self, full_number: &str, decision: RestoreDecision) -> bool {
    match self
      .items
      .iter_mut()
      .find(|item| item.entry.full_number == full_number)
    {
      Some(item) => {
        item.decision = decision;
        true
      }
      None => false,
    }
  }

  pub fn conflicts(&self) -> impl Iterator<Item = &RestoreItem> {
    self
      .items
      .iter()
      .filter(|item| item.class == RestoreClass::Conflict)
  }
}

/// Newer snapshot work wins; ties keep what is on this device.
fn recommend(entry: &SnapshotSet, local: Option<&SetRecord>) -> RestoreDecision {
  match local {
    None => RestoreDecision::ImportRemote,
    Some(record) if entry.last_worked_on > record.info.last_accessed => {
      RestoreDecision::ImportRemote
    }
    Some(_) => RestoreDecision::KeepLocal,
  }
}

pub fn plan_restore(snapshot: &BackupSnapshot, connection: &Connection) -> BackupResult<RestorePlan> {
  let mut items = Vec::with_capacity(snapshot.sets.len());
  for entry in &snapshot.sets {
    let local = get_record(connection, &entry.full_number)?;
    let class = if local.is_some() {
      RestoreClass::Conflict
    } else {
      RestoreClass::New
    };
    let recommended = recommend(entry, local.as_ref());
    items.push(RestoreItem {
      entry: entry.clone(),
      class,
      local,
      recommended,
      decision: recommended,
    });
  }

  Ok(RestorePlan {
    snapshot_digest: snapshot.digest()?,
    producer: snapshot.app.clone(),
    exported_at: snapshot.exported_at.clone(),
    items,
  })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
  Imported,
  Kept,
  Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
  pub full_number: String,
  pub status: RestoreStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
  pub id: String,
  pub outcomes: Vec<RestoreOutcome>,
}

impl RestoreReport {
  fn count(&self, predicate: impl Fn(&RestoreStatus) -> bool) -> usize {
    self
      .outcomes
      .iter()
      .filter(|outcome| predicate(&outcome.status))
      .count()
  }

  pub fn imported(&self) -> usize {
    self.count(|status| *status == RestoreStatus::Imported)
  }

  pub fn kept(&self) -> usize {
    self.count(|status| *status == RestoreStatus::Kept)
  }

  pub fn failed(&self) -> usize {
    self.count(|status| matches!(status, RestoreStatus::Failed(_)))
  }

  pub fn status_of(&self, full_number: &str) -> Option<&RestoreStatus> {
    self
      .outcomes
      .iter()
      .find(|outcome| outcome.full_number == full_number)
      .map(|outcome| &outcome.status)
  }
}

/// Applies every decision in `plan` set by set. One set failing to write does
/// not stop or undo the others; each set gets its own outcome.
pub fn apply_restore(connection: &Connection, plan: &RestorePlan) -> RestoreReport {
  let mut outcomes = Vec::with_capacity(plan.items.len());
  for item in &plan.items {
    let full_number = item.entry.full_number.clone();
    let status = match item.decision {
      RestoreDecision::KeepLocal => RestoreStatus::Kept,
      RestoreDecision::ImportRemote => match upsert_record(connection, &item.entry.to_record()) {
        Ok(()) => RestoreStatus::Imported,
        Err(err) => {
          log::warn!("failed to restore set {full_number}: {err}");
          RestoreStatus::Failed(err.to_string())
        }
      },
    };
    outcomes.push(RestoreOutcome {
      full_number,
      status,
    });
  }

  let report = RestoreReport {
    id: Uuid::new_v4().to_string(),
    outcomes,
  };
  log::info!(
    "restore applied: {} imported, {} kept, {} failed",
    report.imported(),
    report.kept(),
    report.failed()
  );
  if let Err(err) = append_restore_history(connection, plan, &report) {
    log::warn!("failed to journal restore {}: {err}", report.id);
  }
  report
}

fn append_restore_history(
  connection: &Connection,
  plan: &RestorePlan,
  report: &RestoreReport,
) -> BackupResult<()> {
  connection.execute(
    "INSERT INTO restore_history (
       id, snapshot_hash, producer, exported_at,
       imported_count, kept_count, failed_count, applied_at
     )
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    params![
      report.id,
      plan.snapshot_digest,
      plan.producer,
      plan.exported_at,
      report.imported() as i64,
      report.kept() as i64,
      report.failed() as i64,
      now_iso()
    ],
  )?;
  Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreHistoryRow {
  pub id: String,
  pub snapshot_hash: String,
  pub producer: String,
  pub exported_at: String,
  pub imported_count: i64,
  pub kept_count: i64,
  pub failed_count: i64,
  pub applied_at: String,
}

/// Journal of applied restores, newest first.
pub fn restore_history(connection: &Connection) -> BackupResult<Vec<RestoreHistoryRow>> {
  let mut statement = connection.prepare(
    "SELECT id, snapshot_hash, producer, exported_at,
            imported_count, kept_count, failed_count, applied_at
     FROM restore_history
     ORDER BY applied_at DESC, rowid DESC",
  )?;
  let rows = statement.query_map([], |row| {
    Ok(RestoreHistoryRow {
      id: row.get(0)?,
      snapshot_hash: row.get(1)?,
      producer: row.get(2)?,
      exported_at: row.get(3)?,
      imported_count: row.get(4)?,
      kept_count: row.get(5)?,
      failed_count: row.get(6)?,
      applied_at: row.get(7)?,
    })
  })?;

  let mut history = Vec::new();
  for row in rows {
    history.push(row?);
  }
  Ok(history)
}

pub trait CatalogLookup {
  fn catalog(&self, full_number: &str) -> Option<&Catalog>;
}

impl CatalogLookup for HashMap<String, Catalog> {
  fn catalog(&self, full_number: &str) -> Option<&Catalog> {
    self.get(full_number)
  }
}

/// Writes a snapshot of the sets to `writer`, then stamps each with a backup
/// marker holding its completed piece count. Markers are only set once the
/// write succeeded, all in one transaction. Sets without a known catalog are
/// exported but left unmarked.
pub fn backup_sets<I, S, C, W>(
  connection: &Connection,
  full_numbers: I,
  catalogs: &C,
  producer: &str,
  now: DateTime<Utc>,
  writer: W,
) -> BackupResult<BackupSnapshot>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
  C: CatalogLookup + ?Sized,
  W: Write,
{
  let snapshot = export_snapshot(connection, full_numbers, producer, now)?;
  let completed: Vec<(&str, u32)> = snapshot
    .sets
    .iter()
    .filter_map(|set| match catalogs.catalog(&set.full_number) {
      Some(catalog) => Some((
        set.full_number.as_str(),
        current_completed(&set.progress, catalog),
      )),
      None => {
        log::warn!("no catalog for {}, backup marker not set", set.full_number);
        None
      }
    })
    .collect();

  snapshot.write_to(writer)?;

  let when = now.timestamp_millis();
  let tx = connection.unchecked_transaction()?;
  for (full_number, count) in &completed {
    mark_backed_up(&tx, full_number, *count, when)?;
  }
  tx.commit()?;
  Ok(snapshot)
}

/// Writes a single-set backup to `writer` and only then deletes the record.
pub fn backup_and_delete<W: Write>(
  connection: &Connection,
  full_number: &str,
  producer: &str,
  now: DateTime<Utc>,
  writer: W,
) -> BackupResult<BackupSnapshot> {
  let snapshot = export_snapshot(connection, [full_number], producer, now)?;
  snapshot.write_to(writer)?;
  delete_record(connection, full_number)?;
  log::info!("backed up and deleted set {full_number}");
  Ok(snapshot)
}
