//! One countable line item of a set and its compact encodings.
//!
//! The compressed progress dialects address an entry by
//! `(catalog_number, color_id, type_flag)`; only the legacy plain dialect uses the
//! string key built by [`key_of`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const UNKNOWN_COLOR_NAME: &str = "Unknown";
pub const UNKNOWN_PART_NUMBER: &str = "0";
const SPARE_KEY_SUFFIX: &str = "_s";
const MINIFIG_KEY_PREFIX: &str = "fig_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
  Part,
  SparePart,
  Minifig,
}

impl ItemKind {
  /// Flag stored as the fourth element of a progress tuple.
  pub fn type_flag(self) -> u8 {
    match self {
      ItemKind::Part => 0,
      ItemKind::SparePart => 1,
      ItemKind::Minifig => 2,
    }
  }

  pub fn from_type_flag(flag: i64) -> Option<Self> {
    match flag {
      0 => Some(ItemKind::Part),
      1 => Some(ItemKind::SparePart),
      2 => Some(ItemKind::Minifig),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryKey {
  pub catalog_number: String,
  pub color_id: i64,
  pub kind: ItemKind,
}

impl EntryKey {
  pub fn new(catalog_number: impl Into<String>, color_id: i64, kind: ItemKind) -> Self {
    Self {
      catalog_number: catalog_number.into(),
      color_id,
      kind,
    }
  }

  pub fn part(catalog_number: impl Into<String>, color_id: i64) -> Self {
    Self::new(catalog_number, color_id, ItemKind::Part)
  }

  pub fn spare(catalog_number: impl Into<String>, color_id: i64) -> Self {
    Self::new(catalog_number, color_id, ItemKind::SparePart)
  }

  pub fn minifig(fig_number: impl Into<String>) -> Self {
    Self::new(fig_number, 0, ItemKind::Minifig)
  }
}

/// Catalog-provided skeleton of an entry: everything but the found count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
  pub kind: ItemKind,
  pub catalog_number: String,
  pub color_id: i64,
  pub color_name: String,
  pub required_count: u32,
}

impl CatalogItem {
  pub fn part(
    catalog_number: impl Into<String>,
    color_id: i64,
    color_name: impl Into<String>,
    required_count: u32,
  ) -> Self {
    Self {
      kind: ItemKind::Part,
      catalog_number: catalog_number.into(),
      color_id,
      color_name: color_name.into(),
      required_count,
    }
  }

  pub fn spare(
    catalog_number: impl Into<String>,
    color_id: i64,
    color_name: impl Into<String>,
    required_count: u32,
  ) -> Self {
    Self {
      kind: ItemKind::SparePart,
      ..Self::part(catalog_number, color_id, color_name, required_count)
    }
  }

  pub fn minifig(fig_number: impl Into<String>, required_count: u32) -> Self {
    Self {
      kind: ItemKind::Minifig,
      catalog_number: fig_number.into(),
      color_id: 0,
      color_name: String::new(),
      required_count,
    }
  }

  pub fn key(&self) -> EntryKey {
    EntryKey::new(self.catalog_number.clone(), self.color_id, self.kind)
  }

  /// Legacy plain key: `3001_Red`, `3001_Red_s` for spares, `fig_<number>` for minifigs.
  pub fn legacy_key(&self) -> String {
    match self.kind {
      ItemKind::Part => format!("{}_{}", self.catalog_number, self.color_name),
      ItemKind::SparePart => format!(
        "{}_{}{}",
        self.catalog_number, self.color_name, SPARE_KEY_SUFFIX
      ),
      ItemKind::Minifig => format!("{}{}", MINIFIG_KEY_PREFIX, self.catalog_number),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
  pub item: CatalogItem,
  pub found_count: u32,
}

impl InventoryEntry {
  /// Found counts above the required count are clamped.
  pub fn new(item: CatalogItem, found_count: u32) -> Self {
    let found_count = found_count.min(item.required_count);
    Self { item, found_count }
  }

  pub fn key(&self) -> EntryKey {
    self.item.key()
  }

  pub fn remaining(&self) -> u32 {
    self.item.required_count.saturating_sub(self.found_count)
  }

  pub fn is_complete(&self) -> bool {
    self.remaining() == 0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountMode {
  Found,
  Remaining,
}

impl CountMode {
  pub fn flag(self) -> u8 {
    match self {
      CountMode::Found => 0,
      CountMode::Remaining => 1,
    }
  }

  pub fn from_flag(flag: i64) -> Option<Self> {
    match flag {
      0 => Some(CountMode::Found),
      1 => Some(CountMode::Remaining),
      _ => None,
    }
  }
}

/// `[catalogNumber, colorId, count, typeFlag]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressTuple {
  pub catalog_number: String,
  pub color_id: i64,
  pub count: u32,
  pub kind: ItemKind,
}

impl ProgressTuple {
  pub fn key(&self) -> EntryKey {
    EntryKey::new(self.catalog_number.clone(), self.color_id, self.kind)
  }

  pub fn to_json(&self) -> Value {
    json!([
      self.catalog_number,
      self.color_id,
      self.count,
      self.kind.type_flag()
    ])
  }

  /// Reads a tuple back from its JSON array form. Numeric catalog numbers are
  /// accepted and turned into strings.
  pub fn from_json(value: &Value) -> Option<Self> {
    let [number, color, count, flag] = value.as_array()?.as_slice() else {
      return None;
    };
    let catalog_number = match number {
      Value::String(text) => text.clone(),
      Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
      _ => return None,
    };
    let color_id = color.as_i64()?;
    let count = u32::try_from(count.as_u64()?).ok()?;
    let kind = ItemKind::from_type_flag(flag.as_i64()?)?;
    Some(Self {
      catalog_number,
      color_id,
      count,
      kind,
    })
  }
}

pub fn key_of(entry: &InventoryEntry) -> String {
  entry.item.legacy_key()
}

/// Tuple for `entry` under `mode`, or `None` when the stored count would be zero.
pub fn tuple_of(entry: &InventoryEntry, mode: CountMode) -> Option<ProgressTuple> {
  let count = match mode {
    CountMode::Found => entry.found_count,
    CountMode::Remaining => entry.remaining(),
  };
  if count == 0 {
    return None;
  }
  Some(ProgressTuple {
    catalog_number: entry.item.catalog_number.clone(),
    color_id: entry.item.color_id,
    count,
    kind: entry.item.kind,
  })
}
