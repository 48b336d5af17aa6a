use std::borrow::Cow;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDateTime;
use livestat_core::{FlatRecord, RecordSet, TargetId};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Longest text a single xlsx cell accepts.
pub const MAX_CELL_CHARS: usize = 32_767;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("encoding workbook: {0}")]
    Encode(#[from] XlsxError),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("workbook {0} does not exist")]
    Missing(PathBuf),
    #[error("reading workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("workbook {0} has no worksheets")]
    NoSheet(PathBuf),
    #[error("column {column} not found in {path}")]
    MissingColumn { path: PathBuf, column: String },
}

/// Checkpoint target for one run. Backs up a pre-existing destination once,
/// right before the first non-empty write.
#[derive(Debug, Clone)]
pub struct WorkbookStore {
    destination: PathBuf,
    sheet_label: String,
    id_field: String,
    backup_done: bool,
}

impl WorkbookStore {
    pub fn new(
        destination: impl Into<PathBuf>,
        sheet_label: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            sheet_label: sheet_label.into(),
            id_field: id_field.into(),
            backup_done: false,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn persist(&mut self, records: &RecordSet) -> bool {
        if records.is_empty() {
            return true;
        }
        if !self.backup_done {
            backup_file(&self.destination).await;
            self.backup_done = true;
        }
        persist(&self.destination, records, &self.sheet_label, &self.id_field).await
    }
}

/// Writes the whole record set to `destination`, replacing prior content.
/// An empty set is a successful no-op. Failures are logged, not raised.
pub async fn persist(
    destination: &Path,
    records: &RecordSet,
    sheet_label: &str,
    id_field: &str,
) -> bool {
    if records.is_empty() {
        return true;
    }
    match write_workbook(destination, records, sheet_label, id_field).await {
        Ok(()) => {
            info!(path = %destination.display(), rows = records.len(), "checkpoint written");
            true
        }
        Err(err) => {
            error!(path = %destination.display(), error = %err, "checkpoint failed");
            false
        }
    }
}

/// Encodes the workbook in memory, then swaps it into place via temp-file rename
/// so a concurrent reader only ever sees a complete snapshot.
pub async fn write_workbook(
    destination: &Path,
    records: &RecordSet,
    sheet_label: &str,
    id_field: &str,
) -> Result<(), PersistError> {
    let bytes = encode_workbook(records, sheet_label, id_field)?;

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|source| PersistError::Io {
            action: "creating directory",
            path: parent.to_path_buf(),
            source,
        })?;

    let temp_path = parent.join(format!(".{}.xlsx.tmp", Uuid::new_v4()));
    let written = write_temp(&temp_path, &bytes).await;
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, destination).await {
        Ok(()) => Ok(()),
        Err(source) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(PersistError::Io {
                action: "replacing",
                path: destination.to_path_buf(),
                source,
            })
        }
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let io_err = |action: &'static str| {
        let path = temp_path.to_path_buf();
        move |source| PersistError::Io {
            action,
            path,
            source,
        }
    };
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(io_err("opening temp workbook"))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp workbook"))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp workbook"))?;
    file.sync_all()
        .await
        .map_err(io_err("syncing temp workbook"))?;
    Ok(())
}

fn encode_workbook(
    records: &RecordSet,
    sheet_label: &str,
    id_field: &str,
) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let text = Format::new().set_num_format("@");
    let header = Format::new().set_bold();
    let header_text = Format::new().set_bold().set_num_format("@");
    let columns = records.columns(id_field);

    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_label)?;

    for (col, name) in columns.iter().enumerate() {
        let col = col as u16;
        if name == id_field {
            sheet.set_column_format(col, &text)?;
            sheet.write_string_with_format(0, col, name, &header_text)?;
        } else {
            sheet.write_string_with_format(0, col, name, &header)?;
        }
    }

    for (idx, record) in records.iter().enumerate() {
        let row = (idx + 1) as u32;
        for (col, name) in columns.iter().enumerate() {
            let col = col as u16;
            let value = fit_cell(record.get(name).unwrap_or(""), row, name);
            if name == id_field {
                sheet.write_string_with_format(row, col, value.as_ref(), &text)?;
            } else if !value.is_empty() {
                sheet.write_string(row, col, value.as_ref())?;
            }
        }
    }

    workbook.save_to_buffer()
}

/// Cuts text the cell limit would reject, so one oversize value cannot fail
/// the whole checkpoint.
fn fit_cell<'a>(value: &'a str, row: u32, column: &str) -> Cow<'a, str> {
    if value.len() <= MAX_CELL_CHARS {
        return Cow::Borrowed(value);
    }
    let chars = value.chars().count();
    if chars <= MAX_CELL_CHARS {
        return Cow::Borrowed(value);
    }
    warn!(row, column, chars, limit = MAX_CELL_CHARS, "truncating oversize cell");
    Cow::Owned(value.chars().take(MAX_CELL_CHARS).collect())
}

/// `report.xlsx` -> `report_backup.xlsx`; other names get a `_backup` suffix.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let backup_name = match name.strip_suffix(".xlsx") {
        Some(stem) => format!("{stem}_backup.xlsx"),
        None => format!("{name}_backup"),
    };
    path.with_file_name(backup_name)
}

/// Copies an existing file to its backup sibling. Missing files are skipped.
pub async fn backup_file(path: &Path) -> Option<PathBuf> {
    match fs::try_exists(path).await {
        Ok(true) => {}
        _ => return None,
    }
    let backup = backup_path_for(path);
    match fs::copy(path, &backup).await {
        Ok(_) => {
            info!(path = %path.display(), backup = %backup.display(), "backed up previous output");
            Some(backup)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "backup failed");
            None
        }
    }
}

/// `out.xlsx` + 2025-06-01 08:09:10 -> `out_20250601080910.xlsx`.
pub fn timestamped_path(path: &Path, at: NaiveDateTime) -> PathBuf {
    let stamp = at.format("%Y%m%d%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stamped = match name.strip_suffix(".xlsx") {
        Some(stem) => format!("{stem}_{stamp}.xlsx"),
        None => format!("{name}_{stamp}.xlsx"),
    };
    path.with_file_name(stamped)
}

/// Reads a whole sheet (the first one when `sheet` is `None`) as flat records.
/// Every cell comes back as text.
pub fn read_records(path: &Path, sheet: Option<&str>) -> Result<(String, RecordSet), ReadError> {
    if !path.exists() {
        return Err(ReadError::Missing(path.to_path_buf()));
    }
    let workbook_err = |source| ReadError::Workbook {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook = open_workbook_auto(path).map_err(workbook_err)?;
    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| ReadError::NoSheet(path.to_path_buf()))?,
    };
    let range = workbook.worksheet_range(&sheet_name).map_err(workbook_err)?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .map(|row| row.iter().map(cell_text).collect())
        .unwrap_or_default();

    let mut records = RecordSet::new();
    for row in rows {
        let mut record = FlatRecord::new();
        for (idx, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let value = row.get(idx).map(cell_text).unwrap_or_default();
            record.insert(header.clone(), value);
        }
        if record.iter().any(|(_, v)| !v.is_empty()) {
            records.push(record);
        }
    }
    Ok((sheet_name, records))
}

/// Identifiers from `id_field`, in row order, blanks skipped.
pub fn read_id_column(
    path: &Path,
    sheet: Option<&str>,
    id_field: &str,
) -> Result<Vec<TargetId>, ReadError> {
    let (_, records) = read_records(path, sheet)?;
    if !records.iter().any(|r| r.contains_key(id_field)) {
        return Err(ReadError::MissingColumn {
            path: path.to_path_buf(),
            column: id_field.to_string(),
        });
    }
    Ok(records
        .iter()
        .filter_map(|r| r.get(id_field))
        .filter(|id| !id.trim().is_empty())
        .map(TargetId::from)
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 => format!("{f:.0}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn record(pairs: &[(&str, &str)]) -> FlatRecord {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[tokio::test]
    async fn empty_record_set_is_a_noop_success() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.xlsx");
        assert!(persist(&path, &RecordSet::new(), "sheet", "liveObjectId").await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn large_numeric_ids_round_trip_as_exact_text() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ids.xlsx");
        let mut set = RecordSet::new();
        set.push(record(&[("liveObjectId", "700000000000000001"), ("title", "a")]));
        set.push(record(&[("liveObjectId", "14512345678901234567"), ("views", "12")]));
        assert!(persist(&path, &set, "live_list", "liveObjectId").await);

        let ids = read_id_column(&path, Some("live_list"), "liveObjectId").expect("ids");
        assert_eq!(
            ids,
            vec![
                TargetId::from("700000000000000001"),
                TargetId::from("14512345678901234567")
            ]
        );
    }

    #[tokio::test]
    async fn second_write_replaces_first_snapshot() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snap.xlsx");
        let mut set = RecordSet::new();
        set.push(record(&[("liveObjectId", "1"), ("a", "x")]));
        assert!(persist(&path, &set, "s", "liveObjectId").await);

        let mut grown = RecordSet::new();
        grown.push(record(&[("liveObjectId", "1"), ("a", "y")]));
        grown.push(record(&[("liveObjectId", "2"), ("b", "z")]));
        assert!(persist(&path, &grown, "s", "liveObjectId").await);

        let (sheet, read_back) = read_records(&path, None).expect("read");
        assert_eq!(sheet, "s");
        assert_eq!(read_back.len(), 2);
        let rows: Vec<_> = read_back.iter().collect();
        assert_eq!(rows[0].get("a"), Some("y"));
        assert_eq!(rows[0].get("b"), Some(""));
        assert_eq!(rows[1].get("b"), Some("z"));
        assert_eq!(read_back.columns("liveObjectId"), vec!["liveObjectId", "a", "b"]);
    }

    #[tokio::test]
    async fn store_backs_up_existing_destination_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("prev.xlsx");
        let mut old = RecordSet::new();
        old.push(record(&[("liveObjectId", "old")]));
        assert!(persist(&path, &old, "s", "liveObjectId").await);

        let mut store = WorkbookStore::new(&path, "s", "liveObjectId");
        let mut fresh = RecordSet::new();
        fresh.push(record(&[("liveObjectId", "new")]));
        assert!(store.persist(&fresh).await);
        fresh.push(record(&[("liveObjectId", "newer")]));
        assert!(store.persist(&fresh).await);

        let backup = dir.path().join("prev_backup.xlsx");
        let backed_up = read_id_column(&backup, None, "liveObjectId").expect("backup ids");
        assert_eq!(backed_up, vec![TargetId::from("old")]);
        let current = read_id_column(&path, None, "liveObjectId").expect("ids");
        assert_eq!(current.len(), 2);
    }

    #[tokio::test]
    async fn oversize_cell_is_truncated_instead_of_failing_the_write() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("big.xlsx");
        let huge = "x".repeat(40_000);
        let wide = "é".repeat(MAX_CELL_CHARS);
        let mut set = RecordSet::new();
        set.push(record(&[("liveObjectId", "1"), ("body", huge.as_str()), ("wide", wide.as_str())]));
        set.push(record(&[("liveObjectId", "2"), ("body", "short")]));
        assert!(persist(&path, &set, "s", "liveObjectId").await);

        let (_, read_back) = read_records(&path, None).expect("read");
        let rows: Vec<_> = read_back.iter().collect();
        assert_eq!(rows[0].get("body").map(str::len), Some(MAX_CELL_CHARS));
        assert_eq!(rows[0].get("wide").map(|v| v.chars().count()), Some(MAX_CELL_CHARS));
        assert_eq!(rows[1].get("body"), Some("short"));
        assert_eq!(read_back.target_ids("liveObjectId").len(), 2);
    }

    #[test]
    fn missing_upstream_and_missing_column_are_distinct_errors() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("nope.xlsx");
        assert!(matches!(
            read_id_column(&missing, None, "liveObjectId"),
            Err(ReadError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn missing_id_column_is_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("other.xlsx");
        let mut set = RecordSet::new();
        set.push(record(&[("something", "1")]));
        assert!(persist(&path, &set, "s", "liveObjectId").await);
        assert!(matches!(
            read_id_column(&path, None, "liveObjectId"),
            Err(ReadError::MissingColumn { .. })
        ));
    }

    #[test]
    fn derived_paths() {
        let at = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(8, 9, 10)
            .unwrap();
        assert_eq!(
            timestamped_path(Path::new("out/products.xlsx"), at),
            PathBuf::from("out/products_20250601080910.xlsx")
        );
        assert_eq!(
            backup_path_for(Path::new("out/list.xlsx")),
            PathBuf::from("out/list_backup.xlsx")
        );
        assert_eq!(
            backup_path_for(Path::new("out/list.dat")),
            PathBuf::from("out/list.dat_backup")
        );
    }
}
