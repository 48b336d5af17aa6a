//! Raw payload -> flat record conversion. Nothing here fails: missing or
//! mistyped values become empty text.

use indexmap::IndexMap;
use livestat_core::{fields, FlatRecord, TargetId};
use serde_json::Value as JsonValue;
use tracing::warn;

const NAME_KEYS: &[&str] = &["name", "sourceName", "channelName", "label"];
const COUNT_KEYS: &[&str] = &["count", "value", "cnt", "num"];

/// Scalar -> text. Strings are trimmed; null, objects and arrays give `""`.
pub fn value_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => String::new(),
    }
}

pub fn lookup<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub fn text_at(value: &JsonValue, path: &[&str]) -> String {
    lookup(value, path).map(value_to_text).unwrap_or_default()
}

/// First non-empty text among alternative key paths.
pub fn first_text(value: &JsonValue, paths: &[&[&str]]) -> String {
    paths
        .iter()
        .map(|path| text_at(value, path))
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

fn named_entry(item: &JsonValue) -> Option<(String, String)> {
    let obj = item.as_object()?;
    let name = NAME_KEYS
        .iter()
        .filter_map(|k| obj.get(*k))
        .map(value_to_text)
        .find(|s| !s.is_empty())?;
    let count = COUNT_KEYS.iter().find_map(|k| obj.get(*k))?;
    Some((name, value_to_text(count)))
}

/// Walks the payload for lists of `{name, count}`-shaped objects and returns
/// one entry per discovered name, in document order. Later duplicates of a
/// name are dropped.
pub fn discover_named_entries(value: &JsonValue) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    collect_named_entries(value, &mut out);
    out
}

fn collect_named_entries(value: &JsonValue, out: &mut IndexMap<String, String>) {
    match value {
        JsonValue::Array(items) => {
            let entries: Vec<_> = items.iter().filter_map(named_entry).collect();
            if entries.is_empty() {
                for item in items {
                    collect_named_entries(item, out);
                }
            } else {
                for (name, count) in entries {
                    out.entry(name).or_insert(count);
                }
            }
        }
        JsonValue::Object(map) => {
            for child in map.values() {
                collect_named_entries(child, out);
            }
        }
        _ => {}
    }
}

/// Emits every scalar leaf under `value` as a field. Nested objects are
/// joined with `.`; arrays of scalars become a comma list; arrays of objects
/// are left to [`discover_named_entries`]. Keys in `skip` (top level only)
/// are ignored. Collisions get a numeric suffix.
pub fn flatten_leaves(value: &JsonValue, prefix: &str, record: &mut FlatRecord, skip: &[&str]) {
    let Some(map) = value.as_object() else {
        if !prefix.is_empty() {
            record.insert_unique(prefix, value_to_text(value));
        }
        return;
    };
    for (key, child) in map {
        if prefix.is_empty() && skip.contains(&key.as_str()) {
            continue;
        }
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match child {
            JsonValue::Object(_) => flatten_leaves(child, &name, record, &[]),
            JsonValue::Array(items) => {
                if items.iter().all(|i| !i.is_object() && !i.is_array()) {
                    let joined = items
                        .iter()
                        .map(value_to_text)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(", ");
                    record.insert_unique(&name, joined);
                }
            }
            scalar => {
                record.insert_unique(&name, value_to_text(scalar));
            }
        }
    }
}

/// Zips headers to cells by position. Short rows are padded with `""`;
/// surplus cells land in `column_<n>` (1-based). Zero rows still produce one
/// record with the identifier, context fields and every header left empty.
pub fn flatten_table(
    id_field: &str,
    target: &TargetId,
    context: &[(&str, String)],
    headers: &[String],
    rows: &[Vec<String>],
) -> Vec<FlatRecord> {
    let base = || {
        let mut record = FlatRecord::for_target(id_field, target);
        for (key, value) in context {
            record.insert(*key, value.clone());
        }
        record
    };

    if rows.is_empty() {
        let mut record = base();
        for header in headers {
            record.insert_unique(header, "");
        }
        return vec![record];
    }
    if let Some(first) = rows.first() {
        if first.len() != headers.len() {
            warn!(
                target_id = %target,
                headers = headers.len(),
                cells = first.len(),
                "header count does not match first row"
            );
        }
    }

    rows.iter()
        .map(|cells| {
            let mut record = base();
            for (idx, header) in headers.iter().enumerate() {
                let value = cells.get(idx).map(|c| c.trim()).unwrap_or("");
                record.insert_unique(header, value);
            }
            for (idx, cell) in cells.iter().enumerate().skip(headers.len()) {
                record.insert_unique(&format!("column_{}", idx + 1), cell.trim());
            }
            record
        })
        .collect()
}

/// Record stub for an identifier whose fetch never produced a valid payload.
pub fn failure_record(id_field: &str, target: &TargetId, extra: &[(&str, &str)]) -> FlatRecord {
    let mut record = FlatRecord::for_target(id_field, target);
    for (key, value) in extra {
        record.insert(*key, *value);
    }
    record.insert(fields::REMARK, fields::REMARK_FAILED);
    record
}
