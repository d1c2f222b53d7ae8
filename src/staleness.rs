use serde::Serialize;

use crate::catalog::Catalog;
use crate::progress::decode_or_empty;
use crate::record::SetRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BackupStatus {
  NeverBackedUp,
  Safe,
  #[serde(rename_all = "camelCase")]
  Outdated {
    backed_up_count: u32,
    current_count: u32,
  },
}

impl BackupStatus {
  /// Deleting a set in this state would lose progress that no backup holds.
  pub fn offers_backup_before_delete(&self) -> bool {
    !matches!(self, BackupStatus::Safe)
  }
}

pub fn evaluate(record: &SetRecord, current_completed: u32) -> BackupStatus {
  match record.backup {
    None => BackupStatus::NeverBackedUp,
    Some(marker) if marker.completed == current_completed => BackupStatus::Safe,
    Some(marker) => BackupStatus::Outdated {
      backed_up_count: marker.completed,
      current_count: current_completed,
    },
  }
}

/// Completed pieces for a stored progress string; unreadable progress counts as none.
pub fn current_completed(progress: &str, catalog: &Catalog) -> u32 {
  let decoded = decode_or_empty(progress, catalog);
  catalog.tally(&decoded.counts).completed
}
