use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreResult;
use crate::now_iso;

const MIGRATION_SQL_0001: &str = include_str!("../migrations/0001_kv_entries.sql");
const MIGRATION_SQL_0002: &str = include_str!("../migrations/0002_restore_history.sql");

fn apply_schema(connection: &Connection) -> StoreResult<()> {
  connection.execute_batch("PRAGMA foreign_keys = ON;")?;
  connection.execute_batch(MIGRATION_SQL_0001)?;
  connection.execute_batch(MIGRATION_SQL_0002)?;
  Ok(())
}

pub fn init_database(db_path: &Path) -> StoreResult<()> {
  if let Some(parent) = db_path.parent() {
    if !parent.as_os_str().is_empty() {
      fs::create_dir_all(parent)?;
    }
  }

  let connection = Connection::open(db_path)?;
  apply_schema(&connection)
}

pub fn open_database(db_path: &Path) -> StoreResult<Connection> {
  let connection = Connection::open(db_path)?;
  connection.execute_batch("PRAGMA foreign_keys = ON;")?;
  Ok(connection)
}

/// Fresh schema-initialised database that lives as long as the connection.
pub fn open_in_memory() -> StoreResult<Connection> {
  let connection = Connection::open_in_memory()?;
  apply_schema(&connection)?;
  Ok(connection)
}

pub fn get_item(connection: &Connection, key: &str) -> StoreResult<Option<String>> {
  let value = connection
    .query_row(
      "SELECT value FROM kv_entries WHERE key = ?1 LIMIT 1",
      params![key],
      |row| row.get(0),
    )
    .optional()?;
  Ok(value)
}

pub fn set_item(connection: &Connection, key: &str, value: &str) -> StoreResult<()> {
  connection.execute(
    "INSERT INTO kv_entries (key, value, updated_at)
     VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET
       value = excluded.value,
       updated_at = excluded.updated_at",
    params![key, value, now_iso()],
  )?;
  Ok(())
}

pub fn remove_item(connection: &Connection, key: &str) -> StoreResult<bool> {
  let removed = connection.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
  Ok(removed > 0)
}

pub fn keys(connection: &Connection) -> StoreResult<Vec<String>> {
  let mut statement = connection.prepare("SELECT key FROM kv_entries ORDER BY key")?;
  let rows = statement.query_map([], |row| row.get::<usize, String>(0))?;

  let mut keys = Vec::new();
  for row in rows {
    keys.push(row?);
  }
  Ok(keys)
}

/// Every `(key, value)` pair whose key starts with `prefix`, ordered by key.
pub fn items_with_prefix(connection: &Connection, prefix: &str) -> StoreResult<Vec<(String, String)>> {
  let mut statement = connection.prepare(
    "SELECT key, value
     FROM kv_entries
     WHERE substr(key, 1, length(?1)) = ?1
     ORDER BY key",
  )?;
  let rows = statement.query_map(params![prefix], |row| {
    Ok((row.get::<usize, String>(0)?, row.get::<usize, String>(1)?))
  })?;

  let mut items = Vec::new();
  for row in rows {
    items.push(row?);
  }
  Ok(items)
}
