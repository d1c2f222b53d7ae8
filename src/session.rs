use std::io::Write;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::backup::{export_snapshot, BackupSnapshot};
use crate::catalog::{Catalog, ProgressTally};
use crate::entry::{EntryKey, InventoryEntry};
use crate::error::{BackupResult, StoreResult};
use crate::progress::{decode_or_empty, encode, CatalogMismatch, ProgressMap};
use crate::record::{get_record, mark_backed_up, open_record, save_progress, SetInfo};
use crate::staleness::{evaluate, BackupStatus};

pub const DEFAULT_SAVE_DEBOUNCE_MS: i64 = 300;

/// `Idle -> PendingFlush -> Flushing -> Idle`. A mutation while pending moves the
/// deadline instead of queueing a second write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
  Idle,
  PendingFlush { deadline: i64 },
  Flushing,
}

#[derive(Debug)]
pub struct ProgressSession {
  full_number: String,
  catalog: Catalog,
  counts: ProgressMap,
  mismatches: Vec<CatalogMismatch>,
  state: SaveState,
  debounce_ms: i64,
}

impl ProgressSession {
  /// Loads the set's record, creating it on first open. Progress that cannot be
  /// read starts the session from zero rather than failing the load.
  pub fn open(
    connection: &Connection,
    info: SetInfo,
    catalog: Catalog,
    debounce_ms: i64,
    now: i64,
  ) -> StoreResult<Self> {
    let full_number = info.full_number.clone();
    let record = open_record(connection, info, now)?;

    let decoded = decode_or_empty(record.progress_str(), &catalog);
    log::debug!(
      "opened set {full_number} ({} dialect, {} counted entries)",
      decoded.dialect,
      decoded.counts.len()
    );
    Ok(Self {
      full_number,
      catalog,
      counts: decoded.counts,
      mismatches: decoded.mismatches,
      state: SaveState::Idle,
      debounce_ms: debounce_ms.max(0),
    })
  }

  pub fn full_number(&self) -> &str {
    &self.full_number
  }

  pub fn catalog(&self) -> &Catalog {
    &self.catalog
  }

  pub fn counts(&self) -> &ProgressMap {
    &self.counts
  }

  /// Entries dropped on load because the catalog no longer lists them.
  pub fn mismatches(&self) -> &[CatalogMismatch] {
    &self.mismatches
  }

  pub fn state(&self) -> SaveState {
    self.state
  }

  pub fn is_dirty(&self) -> bool {
    matches!(self.state, SaveState::PendingFlush { .. })
  }

  pub fn count(&self, key: &EntryKey) -> u32 {
    self.counts.get(key).copied().unwrap_or(0)
  }

  pub fn entries(&self) -> Vec<InventoryEntry> {
    self.catalog.entries(&self.counts)
  }

  pub fn tally(&self) -> ProgressTally {
    self.catalog.tally(&self.counts)
  }

  /// Sets the found count for `key`, clamped to what the catalog requires.
  /// Returns the stored count, or `None` when the catalog has no such entry.
  pub fn set_count(&mut self, key: &EntryKey, count: u32, now: i64) -> Option<u32> {
    let required = self.catalog.get(key)?.required_count;
    let count = count.min(required);
    let previous = self.count(key);
    if count == previous {
      return Some(count);
    }

    if count == 0 {
      self.counts.remove(key);
    } else {
      self.counts.insert(key.clone(), count);
    }
    self.schedule(now);
    Some(count)
  }

  pub fn increment(&mut self, key: &EntryKey, now: i64) -> Option<u32> {
    let next = self.count(key).saturating_add(1);
    self.set_count(key, next, now)
  }

  pub fn decrement(&mut self, key: &EntryKey, now: i64) -> Option<u32> {
    let next = self.count(key).saturating_sub(1);
    self.set_count(key, next, now)
  }

  pub fn fill(&mut self, key: &EntryKey, now: i64) -> Option<u32> {
    self.set_count(key, u32::MAX, now)
  }

  pub fn reset(&mut self, now: i64) {
    if self.counts.is_empty() {
      return;
    }
    self.counts.clear();
    self.schedule(now);
  }

  fn schedule(&mut self, now: i64) {
    let deadline = now.saturating_add(self.debounce_ms);
    log::debug!("save for {} scheduled at {deadline}", self.full_number);
    self.state = SaveState::PendingFlush { deadline };
  }

  /// Writes the pending save once its deadline has passed. Returns whether a
  /// write happened.
  pub fn poll(&mut self, connection: &Connection, now: i64) -> StoreResult<bool> {
    match self.state {
      SaveState::PendingFlush { deadline } if now >= deadline => self.flush(connection, now),
      _ => Ok(false),
    }
  }

  pub fn flush_now(&mut self, connection: &Connection, now: i64) -> StoreResult<bool> {
    match self.state {
      SaveState::PendingFlush { .. } => self.flush(connection, now),
      _ => Ok(false),
    }
  }

  fn flush(&mut self, connection: &Connection, now: i64) -> StoreResult<bool> {
    let pending = self.state;
    self.state = SaveState::Flushing;

    let result = encode(&self.entries())
      .map_err(Into::into)
      .and_then(|encoded| save_progress(connection, &self.full_number, &encoded, now));
    match result {
      Ok(_) => {
        self.state = SaveState::Idle;
        log::debug!("saved progress for {}", self.full_number);
        Ok(true)
      }
      Err(err) => {
        self.state = pending;
        Err(err)
      }
    }
  }

  pub fn close(mut self, connection: &Connection, now: i64) -> StoreResult<()> {
    self.flush_now(connection, now)?;
    Ok(())
  }

  /// Flushes, writes this set's snapshot to `writer`, then records the completed
  /// count as backed up. A failed write leaves the backup marker untouched.
  pub fn backup<W: Write>(
    &mut self,
    connection: &Connection,
    producer: &str,
    now: DateTime<Utc>,
    writer: W,
  ) -> BackupResult<BackupSnapshot> {
    let when = now.timestamp_millis();
    self.flush_now(connection, when)?;
    let snapshot = export_snapshot(connection, [self.full_number.as_str()], producer, now)?;
    snapshot.write_to(writer)?;
    mark_backed_up(connection, &self.full_number, self.tally().completed, when)?;
    Ok(snapshot)
  }

  pub fn backup_status(&self, connection: &Connection) -> StoreResult<BackupStatus> {
    let completed = self.tally().completed;
    Ok(match get_record(connection, &self.full_number)? {
      Some(record) => evaluate(&record, completed),
      None => BackupStatus::NeverBackedUp,
    })
  }
}
