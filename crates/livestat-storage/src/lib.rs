//! JSON API transport + workbook persistence for livestat.

mod http;
mod workbook;

pub use http::{ApiClient, FetchError, HttpClientConfig};
pub use workbook::{
    backup_file, backup_path_for, persist, read_id_column, read_records, timestamped_path,
    write_workbook, PersistError, ReadError, WorkbookStore,
};

pub const CRATE_NAME: &str = "livestat-storage";
