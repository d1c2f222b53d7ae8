use chrono::Utc;

pub mod backup;
pub mod catalog;
pub mod config;
pub mod entry;
pub mod error;
pub mod progress;
pub mod record;
pub mod session;
pub mod staleness;
pub mod store;

pub use backup::{
  apply_restore, backup_and_delete, backup_file_name, backup_sets, export_snapshot, parse_snapshot,
  plan_restore, BackupSnapshot, CatalogLookup, RestoreDecision, RestorePlan, RestoreReport,
  RestoreStatus, SnapshotSet,
};
pub use catalog::{Catalog, ProgressTally};
pub use config::TallyConfig;
pub use entry::{key_of, tuple_of, CatalogItem, CountMode, EntryKey, InventoryEntry, ItemKind};
pub use error::{BackupError, ConfigError, ProgressError, StoreError};
pub use progress::{decode, decode_or_empty, encode, DecodedProgress, Dialect, ProgressMap};
pub use record::{migrate_if_needed, MigrationReport, SetInfo, SetRecord};
pub use session::{ProgressSession, SaveState};
pub use staleness::{evaluate, BackupStatus};

/// Milliseconds since the Unix epoch, the unit of every stored timestamp.
pub fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

pub(crate) fn now_iso() -> String {
  Utc::now().to_rfc3339()
}
