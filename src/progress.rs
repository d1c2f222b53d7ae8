//! Whole-set progress serialization.
//!
//! The current writer emits the compact dialect: a base64url (unpadded) string of a
//! zlib stream holding the JSON array `[version, mode, ...tuples]`. `mode` 0 means
//! the tuples carry found counts, 1 means they carry remaining counts; the writer
//! picks whichever list is shorter so nearly finished sets stay small.
//!
//! Readers accept, in order:
//!
//! 1. the empty string (nothing found),
//! 2. the compressed transport, either compact or the older mode-less
//!    `[version, ...tuples]` array,
//! 3. the legacy plain `key:count,key:count` text.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{json, Value};

use crate::catalog::Catalog;
use crate::entry::{tuple_of, CountMode, EntryKey, InventoryEntry, ProgressTuple};
use crate::error::{ProgressError, ProgressResult};

pub const PROGRESS_FORMAT_VERSION: i64 = 1;
const COMPRESSION_LEVEL: u32 = 9;

/// Unpadded URL-safe alphabet; padded input from hand-edited files is tolerated.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
  &alphabet::URL_SAFE,
  GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Found counts by entry. Zero counts are never stored.
pub type ProgressMap = BTreeMap<EntryKey, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
  Empty,
  Compact,
  LegacyArray,
  LegacyPlain,
}

impl fmt::Display for Dialect {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Dialect::Empty => "empty",
      Dialect::Compact => "compact",
      Dialect::LegacyArray => "legacy array",
      Dialect::LegacyPlain => "legacy plain",
    };
    f.write_str(name)
  }
}

/// A stored reference the current catalog does not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMismatch {
  /// The tuple key or legacy key as it appeared in the stored string.
  pub reference: String,
  pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedProgress {
  pub counts: ProgressMap,
  pub dialect: Dialect,
  pub mismatches: Vec<CatalogMismatch>,
}

impl DecodedProgress {
  fn empty(dialect: Dialect) -> Self {
    Self {
      counts: ProgressMap::new(),
      dialect,
      mismatches: Vec::new(),
    }
  }
}

enum DialectOutcome {
  Recognized(DecodedProgress),
  NotThisDialect,
  Malformed(String),
}

type DialectDecoder = fn(&str, &Catalog) -> DialectOutcome;

/// Tried in order; the first decoder that recognizes the input decides the result.
const DIALECTS: &[(&str, DialectDecoder)] = &[
  ("empty", decode_empty),
  ("compressed", decode_compressed),
  ("legacy plain", decode_legacy_plain),
];

/// Encodes `entries` in whichever mode yields fewer tuples (ties go to found mode).
///
/// Returns the empty string when nothing has been found. A fully complete set still
/// encodes to a non-empty string.
pub fn encode<'a, I>(entries: I) -> ProgressResult<String>
where
  I: IntoIterator<Item = &'a InventoryEntry>,
{
  let mut found = Vec::new();
  let mut remaining = Vec::new();
  for entry in entries {
    found.extend(tuple_of(entry, CountMode::Found));
    remaining.extend(tuple_of(entry, CountMode::Remaining));
  }

  let (mode, tuples) = if found.len() <= remaining.len() {
    (CountMode::Found, found)
  } else {
    (CountMode::Remaining, remaining)
  };

  if mode == CountMode::Found && tuples.is_empty() {
    return Ok(String::new());
  }
  pack(mode, &tuples)
}

/// Encodes `entries` in a fixed mode. Only meant for size comparisons; stored
/// progress should go through [`encode`].
pub fn encode_in_mode<'a, I>(entries: I, mode: CountMode) -> ProgressResult<String>
where
  I: IntoIterator<Item = &'a InventoryEntry>,
{
  let tuples: Vec<ProgressTuple> = entries
    .into_iter()
    .filter_map(|entry| tuple_of(entry, mode))
    .collect();
  pack(mode, &tuples)
}

fn pack(mode: CountMode, tuples: &[ProgressTuple]) -> ProgressResult<String> {
  let mut payload = Vec::with_capacity(tuples.len() + 2);
  payload.push(json!(PROGRESS_FORMAT_VERSION));
  payload.push(json!(mode.flag()));
  payload.extend(tuples.iter().map(ProgressTuple::to_json));

  let json = serde_json::to_vec(&Value::Array(payload))?;
  let compressed = deflate(&json)?;
  Ok(BASE64URL.encode(compressed))
}

pub(crate) fn deflate(bytes: &[u8]) -> ProgressResult<Vec<u8>> {
  let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
  encoder.write_all(bytes)?;
  Ok(encoder.finish()?)
}

/// Decodes a stored progress string against the catalog it was written for.
///
/// Either the whole string is understood or an error is returned; entries the
/// catalog no longer has are dropped and listed in `mismatches`.
pub fn decode(raw: &str, catalog: &Catalog) -> ProgressResult<DecodedProgress> {
  for (name, decoder) in DIALECTS {
    match decoder(raw, catalog) {
      DialectOutcome::Recognized(decoded) => {
        for mismatch in &decoded.mismatches {
          log::warn!(
            "dropping progress for {} ({} found): not in the current catalog",
            mismatch.reference,
            mismatch.count
          );
        }
        return Ok(decoded);
      }
      DialectOutcome::NotThisDialect => continue,
      DialectOutcome::Malformed(reason) => {
        return Err(ProgressError::malformed(format!("{name}: {reason}")));
      }
    }
  }
  Err(ProgressError::malformed("no known progress format matched"))
}

/// Set-load boundary: malformed progress is logged and treated as nothing found.
pub fn decode_or_empty(raw: &str, catalog: &Catalog) -> DecodedProgress {
  match decode(raw, catalog) {
    Ok(decoded) => decoded,
    Err(err) => {
      log::warn!("ignoring unreadable progress, starting from zero: {err}");
      DecodedProgress::empty(Dialect::Empty)
    }
  }
}

fn decode_empty(raw: &str, _catalog: &Catalog) -> DialectOutcome {
  if raw.is_empty() {
    DialectOutcome::Recognized(DecodedProgress::empty(Dialect::Empty))
  } else {
    DialectOutcome::NotThisDialect
  }
}

fn is_base64url(raw: &str) -> bool {
  let body = raw.trim_end_matches('=');
  !body.is_empty()
    && body
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn decode_compressed(raw: &str, catalog: &Catalog) -> DialectOutcome {
  if !is_base64url(raw) {
    return DialectOutcome::NotThisDialect;
  }
  let Ok(compressed) = BASE64URL.decode(raw) else {
    return DialectOutcome::NotThisDialect;
  };
  let mut json = Vec::new();
  if ZlibDecoder::new(compressed.as_slice())
    .read_to_end(&mut json)
    .is_err()
  {
    return DialectOutcome::NotThisDialect;
  }

  let payload: Value = match serde_json::from_slice(&json) {
    Ok(value) => value,
    Err(err) => return DialectOutcome::Malformed(format!("payload is not JSON: {err}")),
  };
  let Some(items) = payload.as_array() else {
    return DialectOutcome::Malformed("payload is not an array".to_string());
  };
  let Some(version) = items.first().and_then(Value::as_i64) else {
    return DialectOutcome::Malformed("payload has no version".to_string());
  };
  if version != PROGRESS_FORMAT_VERSION {
    return DialectOutcome::Malformed(format!("unsupported progress version {version}"));
  }

  let (dialect, mode, tuple_values) = match items.get(1) {
    None => (Dialect::LegacyArray, CountMode::Found, &items[1..]),
    Some(Value::Array(_)) => (Dialect::LegacyArray, CountMode::Found, &items[1..]),
    Some(flag) => match flag.as_i64().and_then(CountMode::from_flag) {
      Some(mode) => (Dialect::Compact, mode, &items[2..]),
      None => return DialectOutcome::Malformed(format!("unknown mode flag {flag}")),
    },
  };

  let mut tuples = Vec::with_capacity(tuple_values.len());
  for (index, value) in tuple_values.iter().enumerate() {
    match ProgressTuple::from_json(value) {
      Some(tuple) => tuples.push(tuple),
      None => {
        return DialectOutcome::Malformed(format!("entry {index} is not a progress tuple: {value}"))
      }
    }
  }

  let decoded = match mode {
    CountMode::Found => apply_found(tuples, catalog, dialect),
    CountMode::Remaining => apply_remaining(tuples, catalog, dialect),
  };
  DialectOutcome::Recognized(decoded)
}

fn tuple_reference(tuple: &ProgressTuple) -> String {
  format!(
    "[{}, {}, {}]",
    tuple.catalog_number,
    tuple.color_id,
    tuple.kind.type_flag()
  )
}

fn apply_found(tuples: Vec<ProgressTuple>, catalog: &Catalog, dialect: Dialect) -> DecodedProgress {
  let mut decoded = DecodedProgress::empty(dialect);
  for tuple in tuples {
    let key = tuple.key();
    match catalog.get(&key) {
      Some(item) => add_found(&mut decoded.counts, key, tuple.count, item.required_count),
      None => decoded.mismatches.push(CatalogMismatch {
        reference: tuple_reference(&tuple),
        count: tuple.count,
      }),
    }
  }
  decoded
}

/// Several references to one merged catalog item add up, capped at what it requires.
fn add_found(counts: &mut ProgressMap, key: EntryKey, count: u32, required: u32) {
  if count == 0 {
    return;
  }
  let found = counts.entry(key).or_insert(0);
  *found = found.saturating_add(count).min(required);
}

/// Remaining mode only lists entries with something left to find, so every catalog
/// entry missing from the payload counts as fully found.
fn apply_remaining(
  tuples: Vec<ProgressTuple>,
  catalog: &Catalog,
  dialect: Dialect,
) -> DecodedProgress {
  let mut decoded = DecodedProgress::empty(dialect);
  for item in catalog.items() {
    if item.required_count > 0 {
      decoded.counts.insert(item.key(), item.required_count);
    }
  }

  let mut remaining = ProgressMap::new();
  for tuple in tuples {
    let key = tuple.key();
    if catalog.get(&key).is_some() {
      let left = remaining.entry(key).or_insert(0);
      *left = left.saturating_add(tuple.count);
    } else {
      decoded.mismatches.push(CatalogMismatch {
        reference: tuple_reference(&tuple),
        count: tuple.count,
      });
    }
  }

  for (key, left) in remaining {
    let Some(item) = catalog.get(&key) else {
      continue;
    };
    let found = item.required_count.saturating_sub(left);
    if found > 0 {
      decoded.counts.insert(key, found);
    } else {
      decoded.counts.remove(&key);
    }
  }
  decoded
}

fn decode_legacy_plain(raw: &str, catalog: &Catalog) -> DialectOutcome {
  if !raw.contains(':') {
    return DialectOutcome::NotThisDialect;
  }

  let mut decoded = DecodedProgress::empty(Dialect::LegacyPlain);
  for piece in raw.split(',').filter(|piece| !piece.is_empty()) {
    let Some((legacy_key, count)) = piece.rsplit_once(':') else {
      return DialectOutcome::Malformed(format!("pair without count: {piece:?}"));
    };
    let Ok(count) = count.trim().parse::<u32>() else {
      return DialectOutcome::Malformed(format!("invalid count in pair {piece:?}"));
    };

    let item = if !legacy_key.is_empty() && legacy_key.bytes().all(|b| b.is_ascii_digit()) {
      legacy_key
        .parse::<usize>()
        .ok()
        .and_then(|row| catalog.item_at_row(row))
    } else {
      catalog.find_legacy_key(legacy_key)
    };

    match item {
      Some(item) => add_found(&mut decoded.counts, item.key(), count, item.required_count),
      None => decoded.mismatches.push(CatalogMismatch {
        reference: legacy_key.to_string(),
        count,
      }),
    }
  }
  DialectOutcome::Recognized(decoded)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entry::CatalogItem;

  fn basic_catalog() -> Catalog {
    Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", 5),
      CatalogItem::part("3004", 11, "Blue", 3),
      CatalogItem::part("3005", 6, "Green", 2),
    ])
  }

  fn with_counts(catalog: &Catalog, pairs: &[(EntryKey, u32)]) -> Vec<InventoryEntry> {
    let counts: ProgressMap = pairs.iter().cloned().collect();
    catalog.entries(&counts)
  }

  fn compressed_json(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).expect("json");
    BASE64URL.encode(deflate(&bytes).expect("deflate"))
  }

  #[test]
  fn nothing_found_encodes_to_empty_string() {
    let catalog = basic_catalog();
    let encoded = encode(&with_counts(&catalog, &[])).expect("encode");
    assert_eq!(encoded, "");
  }

  #[test]
  fn complete_set_encodes_to_non_empty_string() {
    let catalog = basic_catalog();
    let entries = with_counts(
      &catalog,
      &[
        (EntryKey::part("3001", 5), 5),
        (EntryKey::part("3004", 11), 3),
        (EntryKey::part("3005", 6), 2),
      ],
    );
    let encoded = encode(&entries).expect("encode");
    assert!(!encoded.is_empty());
    assert!(!encoded.contains(':'));

    let decoded = decode(&encoded, &catalog).expect("decode");
    assert_eq!(decoded.dialect, Dialect::Compact);
    assert_eq!(decoded.counts.len(), 3);
    assert_eq!(decoded.counts[&EntryKey::part("3001", 5)], 5);
  }

  #[test]
  fn remaining_mode_reconstructs_absent_entries_as_found() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("A", 1, "Red", 5),
      CatalogItem::part("B", 1, "Red", 3),
    ]);
    let entries = with_counts(
      &catalog,
      &[(EntryKey::part("A", 1), 5), (EntryKey::part("B", 1), 1)],
    );

    let encoded = encode(&entries).expect("encode");
    let decoded = decode(&encoded, &catalog).expect("decode");

    let expected: ProgressMap = [(EntryKey::part("A", 1), 5), (EntryKey::part("B", 1), 1)]
      .into_iter()
      .collect();
    assert_eq!(decoded.counts, expected);

    // One remaining tuple (B) beats two found tuples.
    let raw = BASE64URL.decode(&encoded).expect("base64");
    let mut json = Vec::new();
    ZlibDecoder::new(raw.as_slice())
      .read_to_end(&mut json)
      .expect("inflate");
    let payload: Value = serde_json::from_slice(&json).expect("payload");
    assert_eq!(payload, json!([1, 1, ["B", 1, 2, 0]]));
  }

  #[test]
  fn ties_stay_in_found_mode() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("A", 1, "Red", 2),
      CatalogItem::part("B", 1, "Red", 2),
    ]);
    let entries = with_counts(&catalog, &[(EntryKey::part("A", 1), 1)]);
    let encoded = encode(&entries).expect("encode");
    assert_eq!(encoded, encode_in_mode(&entries, CountMode::Found).expect("found"));
  }

  #[test]
  fn mostly_complete_sets_encode_smaller_than_found_mode() {
    let items: Vec<CatalogItem> = (0..40)
      .map(|n| CatalogItem::part(format!("{}", 3000 + n), n, "Color", 4))
      .collect();
    let catalog = Catalog::new(items);
    let counts: ProgressMap = catalog
      .items()
      .iter()
      .enumerate()
      .map(|(n, item)| (item.key(), if n % 4 == 0 { 1 } else { 4 }))
      .collect();
    let entries = catalog.entries(&counts);

    let chosen = encode(&entries).expect("encode");
    let found_only = encode_in_mode(&entries, CountMode::Found).expect("found");
    assert!(chosen.len() <= found_only.len());
  }

  #[test]
  fn legacy_plain_names_decode() {
    let catalog = basic_catalog();
    let decoded = decode("3001_Red:5,3004_Blue:1", &catalog).expect("decode");

    assert_eq!(decoded.dialect, Dialect::LegacyPlain);
    let expected: ProgressMap = [(EntryKey::part("3001", 5), 5), (EntryKey::part("3004", 11), 1)]
      .into_iter()
      .collect();
    assert_eq!(decoded.counts, expected);
  }

  #[test]
  fn legacy_plain_spares_minifigs_and_row_indexes() {
    let catalog = Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", 5),
      CatalogItem::part("3004", 11, "Blue", 3),
      CatalogItem::spare("3001", 5, "Red", 2),
      CatalogItem::minifig("fig-001234", 1),
    ]);

    let named = decode("3001_Red_s:2,fig_fig-001234:1", &catalog).expect("named keys");
    assert_eq!(named.counts[&EntryKey::spare("3001", 5)], 2);
    assert_eq!(named.counts[&EntryKey::minifig("fig-001234")], 1);
    assert!(!named.counts.contains_key(&EntryKey::part("3001", 5)));

    let indexed = decode("0:5,1:3", &catalog).expect("row keys");
    assert_eq!(indexed.counts[&EntryKey::part("3001", 5)], 5);
    assert_eq!(indexed.counts[&EntryKey::part("3004", 11)], 3);
  }

  #[test]
  fn legacy_array_is_read_as_found_counts() {
    let catalog = basic_catalog();
    let raw = compressed_json(&json!([1, ["3001", 5, 4, 0], ["3005", 6, 1, 0]]));
    let decoded = decode(&raw, &catalog).expect("decode");

    assert_eq!(decoded.dialect, Dialect::LegacyArray);
    assert_eq!(decoded.counts[&EntryKey::part("3001", 5)], 4);
    assert_eq!(decoded.counts[&EntryKey::part("3005", 6)], 1);

    let bare = decode(&compressed_json(&json!([1])), &catalog).expect("bare version");
    assert_eq!(bare.dialect, Dialect::LegacyArray);
    assert!(bare.counts.is_empty());
  }

  #[test]
  fn unknown_catalog_entries_are_dropped_not_fatal() {
    let catalog = basic_catalog();
    let raw = compressed_json(&json!([1, 0, ["3001", 5, 2, 0], ["9999", 1, 3, 0]]));
    let decoded = decode(&raw, &catalog).expect("decode");

    assert_eq!(decoded.counts.len(), 1);
    assert_eq!(decoded.mismatches.len(), 1);
    assert_eq!(decoded.mismatches[0].count, 3);

    let plain = decode("3001_Red:1,3001_Purple:2", &catalog).expect("plain");
    assert_eq!(plain.mismatches[0].reference, "3001_Purple");
  }

  #[test]
  fn remaining_mode_drops_unknown_entries_and_clamps_drift() {
    let catalog = basic_catalog();
    let raw = compressed_json(&json!([
      1,
      1,
      ["3001", 5, 2, 0],
      ["9999", 1, 4, 0],
      ["3005", 6, 9, 0]
    ]));
    let decoded = decode(&raw, &catalog).expect("decode");

    let expected: ProgressMap = [(EntryKey::part("3001", 5), 3), (EntryKey::part("3004", 11), 3)]
      .into_iter()
      .collect();
    assert_eq!(decoded.counts, expected);
    assert_eq!(
      decoded.mismatches,
      vec![CatalogMismatch {
        reference: "[9999, 1, 0]".to_string(),
        count: 4
      }]
    );
  }

  fn merged_catalog() -> Catalog {
    Catalog::new(vec![
      CatalogItem::part("3001", 5, "Red", 2),
      CatalogItem::part("3004", 11, "Blue", 1),
      CatalogItem::part("3001", 5, "Red", 3),
    ])
  }

  #[test]
  fn legacy_plain_references_to_merged_rows_add_up() {
    let catalog = merged_catalog();
    let red = EntryKey::part("3001", 5);

    let by_row = decode("0:2,2:1", &catalog).expect("row keys");
    assert_eq!(by_row.counts[&red], 3);

    let by_name = decode("3001_Red:2,3001_Red:1", &catalog).expect("named keys");
    assert_eq!(by_name.counts[&red], 3);

    let overfull = decode("0:2,2:9", &catalog).expect("capped");
    assert_eq!(overfull.counts[&red], 5);
  }

  #[test]
  fn repeated_compact_tuples_add_up_in_both_modes() {
    let catalog = merged_catalog();
    let red = EntryKey::part("3001", 5);
    let blue = EntryKey::part("3004", 11);

    let found = decode(
      &compressed_json(&json!([1, 0, ["3001", 5, 2, 0], ["3001", 5, 1, 0]])),
      &catalog,
    )
    .expect("found mode");
    assert_eq!(found.counts[&red], 3);
    assert!(!found.counts.contains_key(&blue));

    let remaining = decode(
      &compressed_json(&json!([1, 1, ["3001", 5, 1, 0], ["3001", 5, 1, 0]])),
      &catalog,
    )
    .expect("remaining mode");
    assert_eq!(remaining.counts[&red], 3);
    assert_eq!(remaining.counts[&blue], 1);
  }

  #[test]
  fn merged_rows_survive_encode_and_decode() {
    let catalog = merged_catalog();
    let entries = with_counts(
      &catalog,
      &[(EntryKey::part("3001", 5), 4), (EntryKey::part("3004", 11), 1)],
    );
    let decoded = decode(&encode(&entries).expect("encode"), &catalog).expect("decode");

    assert_eq!(decoded.counts[&EntryKey::part("3001", 5)], 4);
    assert_eq!(decoded.counts[&EntryKey::part("3004", 11)], 1);
  }

  #[test]
  fn malformed_input_is_rejected_whole() {
    let catalog = basic_catalog();
    let cases = vec![
      "not progress".to_string(),
      "3001_Red:five".to_string(),
      "AAAA".to_string(),
      compressed_json(&json!({"sets": []})),
      compressed_json(&json!([2, 0])),
      compressed_json(&json!([1, 7])),
      compressed_json(&json!([1, 0, ["3001", 5, 1]])),
    ];
    for raw in &cases {
      assert!(
        matches!(decode(raw, &catalog), Err(ProgressError::Malformed(_))),
        "{raw:?} should be malformed"
      );
    }
  }

  #[test]
  fn load_boundary_recovers_with_empty_progress() {
    let catalog = basic_catalog();
    let decoded = decode_or_empty("%%%", &catalog);
    assert!(decoded.counts.is_empty());
  }

  #[test]
  fn padded_input_is_tolerated() {
    let catalog = basic_catalog();
    let entries = with_counts(&catalog, &[(EntryKey::part("3004", 11), 2)]);
    let encoded = encode(&entries).expect("encode");
    let padding = (4 - encoded.len() % 4) % 4;
    let padded = format!("{encoded}{}", "=".repeat(padding));

    let decoded = decode(&padded, &catalog).expect("decode");
    assert_eq!(decoded.counts[&EntryKey::part("3004", 11)], 2);
  }
}
