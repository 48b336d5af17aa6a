//! Core domain model for livestat: identifiers, flat records, credentials.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "livestat-core";

/// Untyped payload returned by one fetch attempt. Shape varies per source.
pub type RawPayload = serde_json::Value;

/// Well-known output column names shared across sources.
pub mod fields {
    pub const LIVE_OBJECT_ID: &str = "liveObjectId";
    pub const CURRENT_URL: &str = "currentUrl";
    pub const TITLE: &str = "title";
    pub const RESERVE_COUNT: &str = "reserveCount";
    pub const RESERVE_RATE: &str = "reserveRate";
    pub const REMARK: &str = "remark";
    pub const PROMOTION_SCORE: &str = "promotionScore";

    pub const REMARK_FAILED: &str = "failed";
}

/// Opaque handle for one broadcast session. Always held as text so that
/// 19-digit numeric ids never pass through a float.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.len() == raw.len() {
            Self(raw)
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<u64> for TargetId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Single-level field-name -> text mapping. Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRecord {
    fields: IndexMap<String, String>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a record with the identifier stamped as its first field.
    pub fn for_target(id_field: &str, target: &TargetId) -> Self {
        let mut record = Self::new();
        record.insert(id_field, target.as_str());
        record
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.fields.insert(key.into(), value.into())
    }

    /// Inserts under `key`, or under `key_2`, `key_3`, ... when `key` is taken.
    /// Returns the name actually used.
    pub fn insert_unique(&mut self, key: &str, value: impl Into<String>) -> String {
        let mut name = key.to_string();
        let mut n = 2usize;
        while self.fields.contains_key(&name) {
            name = format!("{key}_{n}");
            n += 1;
        }
        self.fields.insert(name.clone(), value.into());
        name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FlatRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Ordered, append-only collection of records for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordSet {
    records: Vec<FlatRecord>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: FlatRecord) {
        self.records.push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = FlatRecord>) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FlatRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, FlatRecord> {
        self.records.iter_mut()
    }

    /// Union of all field names, in first-seen order, with `id_field` leading.
    pub fn columns(&self, id_field: &str) -> Vec<String> {
        let mut seen: IndexMap<&str, ()> = IndexMap::new();
        if self.records.iter().any(|r| r.contains_key(id_field)) {
            seen.insert(id_field, ());
        }
        for record in &self.records {
            for key in record.keys() {
                seen.entry(key).or_insert(());
            }
        }
        seen.into_keys().map(ToString::to_string).collect()
    }

    /// Distinct identifiers in first-seen order.
    pub fn target_ids(&self, id_field: &str) -> Vec<TargetId> {
        let mut seen: IndexMap<&str, ()> = IndexMap::new();
        for record in &self.records {
            if let Some(id) = record.get(id_field) {
                if !id.trim().is_empty() {
                    seen.entry(id).or_insert(());
                }
            }
        }
        seen.into_keys().map(TargetId::from).collect()
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a FlatRecord;
    type IntoIter = std::slice::Iter<'a, FlatRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<FlatRecord> for RecordSet {
    fn from_iter<I: IntoIterator<Item = FlatRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Borrowed authenticated identity: default headers plus cookies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub headers: IndexMap<String, String>,
    pub cookies: IndexMap<String, String>,
}

impl SessionCredentials {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .map(|(_, v)| v.as_str())
    }

    /// Keeps `self` when it carries cookies, otherwise falls back to `seed`.
    pub fn or_seed(self, seed: SessionCredentials) -> SessionCredentials {
        if self.cookies.is_empty() {
            seed
        } else {
            self
        }
    }
}

/// Start/end instants bounding list enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn last_days(days: i64, now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::days(days),
            end: now,
        }
    }

    pub fn start_unix(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_unix(&self) -> i64 {
        self.end.timestamp()
    }
}

/// The remote sources a run can harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Listing,
    Reservation,
    ProductTable,
    Spu,
    Conversion,
    Diagnostic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Listing => "listing",
            SourceKind::Reservation => "reservation",
            SourceKind::ProductTable => "product_table",
            SourceKind::Spu => "spu",
            SourceKind::Conversion => "conversion",
            SourceKind::Diagnostic => "diagnostic",
        }
    }

    /// Worksheet name used when persisting this source.
    pub fn sheet_label(&self) -> &'static str {
        match self {
            SourceKind::Listing => "live_list",
            SourceKind::Reservation => "reservations",
            SourceKind::ProductTable => "products",
            SourceKind::Spu => "spu_sales",
            SourceKind::Conversion => "conversion",
            SourceKind::Diagnostic => "diagnostic",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
