use std::collections::HashMap;

use serde::Deserialize;

use crate::entry::{
  CatalogItem, EntryKey, InventoryEntry, ItemKind, UNKNOWN_COLOR_NAME, UNKNOWN_PART_NUMBER,
};
use crate::progress::ProgressMap;

/// Upstream part row (`/lego/sets/{set}/parts/` result item).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartRow {
  #[serde(default)]
  pub part: Option<PartRef>,
  #[serde(default)]
  pub color: Option<ColorRef>,
  #[serde(default)]
  pub quantity: u32,
  #[serde(default)]
  pub is_spare: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartRef {
  #[serde(default)]
  pub part_num: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColorRef {
  #[serde(default)]
  pub id: Option<i64>,
  #[serde(default)]
  pub name: Option<String>,
}

/// Upstream minifigure row (`/lego/sets/{set}/minifigs/` result item).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinifigRow {
  #[serde(default, alias = "fig_num")]
  pub set_num: Option<String>,
  #[serde(default)]
  pub quantity: u32,
}

impl From<&PartRow> for CatalogItem {
  fn from(row: &PartRow) -> Self {
    let catalog_number = row
      .part
      .as_ref()
      .and_then(|part| part.part_num.as_deref())
      .map(str::trim)
      .filter(|number| !number.is_empty())
      .unwrap_or(UNKNOWN_PART_NUMBER)
      .to_string();
    let color_id = row.color.as_ref().and_then(|color| color.id).unwrap_or(0);
    let color_name = row
      .color
      .as_ref()
      .and_then(|color| color.name.as_deref())
      .filter(|name| !name.is_empty())
      .unwrap_or(UNKNOWN_COLOR_NAME)
      .to_string();

    if row.is_spare {
      CatalogItem::spare(catalog_number, color_id, color_name, row.quantity)
    } else {
      CatalogItem::part(catalog_number, color_id, color_name, row.quantity)
    }
  }
}

impl From<&MinifigRow> for CatalogItem {
  fn from(row: &MinifigRow) -> Self {
    let fig_number = row
      .set_num
      .as_deref()
      .map(str::trim)
      .filter(|number| !number.is_empty())
      .unwrap_or(UNKNOWN_PART_NUMBER);
    CatalogItem::minifig(fig_number, row.quantity)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTally {
  /// Pieces counted towards the set, spares included where they cover a shortfall.
  pub completed: u32,
  pub total: u32,
  /// Spare pieces beyond what the set needs; only reported once the set is complete.
  pub extras: u32,
}

impl ProgressTally {
  pub fn is_complete(&self) -> bool {
    self.total > 0 && self.completed >= self.total
  }

  /// Whole percentage, rounded down so 293/294 never reads as 100.
  pub fn percentage(&self) -> u32 {
    if self.total == 0 {
      return 0;
    }
    ((u64::from(self.completed) * 100) / u64::from(self.total)) as u32
  }
}

/// Ordered catalog of one set version.
///
/// Rows sharing an [`EntryKey`] are merged into the first occurrence with their
/// required counts summed; the original row order is kept for the oldest legacy
/// progress strings, which address entries by row position.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
  items: Vec<CatalogItem>,
  rows: Vec<usize>,
  by_key: HashMap<EntryKey, usize>,
  by_legacy_key: HashMap<String, usize>,
}

impl Catalog {
  pub fn new(items: impl IntoIterator<Item = CatalogItem>) -> Self {
    let mut catalog = Catalog::default();
    for item in items {
      catalog.push(item);
    }
    catalog
  }

  /// Builds the catalog from upstream rows; parts come first, then minifigures.
  pub fn from_rows(parts: &[PartRow], minifigs: &[MinifigRow]) -> Self {
    Self::new(
      parts
        .iter()
        .map(CatalogItem::from)
        .chain(minifigs.iter().map(CatalogItem::from)),
    )
  }

  fn push(&mut self, item: CatalogItem) {
    let key = item.key();
    if let Some(&position) = self.by_key.get(&key) {
      log::debug!(
        "merging duplicate catalog row {} (color {})",
        item.catalog_number,
        item.color_id
      );
      let merged = &mut self.items[position].required_count;
      *merged = merged.saturating_add(item.required_count);
      self.rows.push(position);
      return;
    }

    let position = self.items.len();
    self
      .by_legacy_key
      .entry(item.legacy_key())
      .or_insert(position);
    self.by_key.insert(key, position);
    self.rows.push(position);
    self.items.push(item);
  }

  pub fn items(&self) -> &[CatalogItem] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn get(&self, key: &EntryKey) -> Option<&CatalogItem> {
    self.by_key.get(key).map(|&position| &self.items[position])
  }

  pub fn find_legacy_key(&self, legacy_key: &str) -> Option<&CatalogItem> {
    self
      .by_legacy_key
      .get(legacy_key)
      .map(|&position| &self.items[position])
  }

  /// Item at upstream row `row`, counting every row handed to the constructor.
  pub fn item_at_row(&self, row: usize) -> Option<&CatalogItem> {
    self.rows.get(row).map(|&position| &self.items[position])
  }

  /// Every catalog item paired with its count from `counts` (missing keys are zero).
  pub fn entries(&self, counts: &ProgressMap) -> Vec<InventoryEntry> {
    self
      .items
      .iter()
      .map(|item| {
        let found = counts.get(&item.key()).copied().unwrap_or(0);
        InventoryEntry::new(item.clone(), found)
      })
      .collect()
  }

  pub fn total_pieces(&self) -> u32 {
    self
      .items
      .iter()
      .filter(|item| item.kind != ItemKind::SparePart)
      .fold(0u32, |total, item| total.saturating_add(item.required_count))
  }

  /// Piece accounting for `counts`. Spare pieces first cover any shortfall of the
  /// regular part with the same number and color; the rest become extras.
  pub fn tally(&self, counts: &ProgressMap) -> ProgressTally {
    let found = |key: &EntryKey| counts.get(key).copied().unwrap_or(0);
    let mut spare_left: HashMap<EntryKey, u32> = self
      .items
      .iter()
      .filter(|item| item.kind == ItemKind::SparePart)
      .map(|item| {
        let key = item.key();
        let count = found(&key).min(item.required_count);
        (key, count)
      })
      .collect();

    let mut tally = ProgressTally {
      total: self.total_pieces(),
      ..ProgressTally::default()
    };

    for item in &self.items {
      match item.kind {
        ItemKind::SparePart => {}
        ItemKind::Minifig => {
          tally.completed = tally
            .completed
            .saturating_add(found(&item.key()).min(item.required_count));
        }
        ItemKind::Part => {
          let regular = found(&item.key()).min(item.required_count);
          let shortfall = item.required_count - regular;
          let spare_key = EntryKey::spare(item.catalog_number.clone(), item.color_id);
          let covered = match spare_left.get_mut(&spare_key) {
            Some(left) => {
              let used = (*left).min(shortfall);
              *left -= used;
              used
            }
            None => 0,
          };
          tally.completed = tally.completed.saturating_add(regular + covered);
        }
      }
    }

    if tally.is_complete() {
      tally.extras = spare_left
        .values()
        .fold(0u32, |extras, left| extras.saturating_add(*left));
    }
    tally
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn counts(pairs: &[(EntryKey, u32)]) -> ProgressMap {
    pairs.iter().cloned().collect()
  }

  #[test]
  fn upstream_rows_fall_back_to_sentinels() {
    let parts: Vec<PartRow> = serde_json::from_str(
      r#"[
        {"part": {"part_num": "3001"}, "color": {"id": 5, "name": "Red"}, "quantity": 5, "is_spare": false},
        {"part": null, "color": null, "quantity": 2},
        {"part": {"part_num": "3004"}, "quantity": 1, "is_spare": true}
      ]"#,
    )
    .expect("part rows");
    let minifigs: Vec<MinifigRow> =
      serde_json::from_str(r#"[{"fig_num": "fig-001234", "quantity": 1}]"#).expect("minifig rows");

    let catalog = Catalog::from_rows(&parts, &minifigs);
    let items = catalog.items();

    assert_eq!(items[0].legacy_key(), "3001_Red");
    assert_eq!(items[1].catalog_number, "0");
    assert_eq!(items[1].color_id, 0);
    assert_eq!(items[1].color_name, "Unknown");
    assert_eq!(items[2].legacy_key(), "3004_Unknown_s");
    assert_eq!(items[3].key(), EntryKey::minifig("fig-001234"));
  }

  #[test]
  fn duplicate_rows_merge_but_keep_row_positions() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", 2),
      CatalogItem::part("3004", 11, "Blue", 1),
      CatalogItem::part("3001", 5, "Red", 3),
    ]);

    assert_eq!(catalog.len(), 2);
    assert_eq!(
      catalog
        .get(&EntryKey::part("3001", 5))
        .map(|item| item.required_count),
      Some(5)
    );
    assert_eq!(
      catalog.item_at_row(2).map(|item| item.catalog_number.as_str()),
      Some("3001")
    );
    assert!(catalog.item_at_row(3).is_none());
  }

  #[test]
  fn tally_counts_parts_and_minifigs() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", 5),
      CatalogItem::part("3004", 11, "Blue", 5),
      CatalogItem::minifig("fig-001234", 1),
      CatalogItem::minifig("fig-005678", 1),
    ]);
    let tally = catalog.tally(&counts(&[
      (EntryKey::part("3001", 5), 5),
      (EntryKey::part("3004", 11), 5),
      (EntryKey::minifig("fig-001234"), 1),
    ]));

    assert_eq!(tally.completed, 11);
    assert_eq!(tally.total, 12);
    assert!(!tally.is_complete());
  }

  #[test]
  fn spares_cover_shortfall_and_extras_show_only_when_complete() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", 5),
      CatalogItem::part("3004", 11, "Blue", 5),
      CatalogItem::spare("3001", 5, "Red", 2),
      CatalogItem::spare("3004", 11, "Blue", 1),
    ]);

    let substitute = catalog.tally(&counts(&[
      (EntryKey::part("3001", 5), 3),
      (EntryKey::spare("3001", 5), 2),
    ]));
    assert_eq!(substitute.completed, 5);
    assert_eq!(substitute.extras, 0);

    let incomplete = catalog.tally(&counts(&[
      (EntryKey::part("3001", 5), 5),
      (EntryKey::part("3004", 11), 3),
      (EntryKey::spare("3001", 5), 2),
    ]));
    assert_eq!(incomplete.completed, 8);
    assert_eq!(incomplete.extras, 0);

    let complete = catalog.tally(&counts(&[
      (EntryKey::part("3001", 5), 5),
      (EntryKey::part("3004", 11), 5),
      (EntryKey::spare("3001", 5), 2),
      (EntryKey::spare("3004", 11), 1),
    ]));
    assert!(complete.is_complete());
    assert_eq!(complete.extras, 3);
  }

  #[test]
  fn percentage_rounds_down() {
    let tally = ProgressTally {
      completed: 293,
      total: 294,
      extras: 0,
    };
    assert_eq!(tally.percentage(), 99);
  }

  #[test]
  fn extreme_quantities_saturate() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", u32::MAX),
      CatalogItem::part("3001", 5, "Red", 7),
      CatalogItem::part("3004", 11, "Blue", u32::MAX),
      CatalogItem::spare("3001", 5, "Red", u32::MAX),
      CatalogItem::spare("3004", 11, "Blue", u32::MAX),
    ]);

    assert_eq!(
      catalog
        .get(&EntryKey::part("3001", 5))
        .map(|item| item.required_count),
      Some(u32::MAX)
    );
    assert_eq!(catalog.total_pieces(), u32::MAX);

    let tally = catalog.tally(&counts(&[
      (EntryKey::part("3001", 5), u32::MAX),
      (EntryKey::part("3004", 11), u32::MAX),
      (EntryKey::spare("3001", 5), u32::MAX),
      (EntryKey::spare("3004", 11), u32::MAX),
    ]));
    assert_eq!(tally.completed, u32::MAX);
    assert_eq!(tally.extras, u32::MAX);
  }
}
