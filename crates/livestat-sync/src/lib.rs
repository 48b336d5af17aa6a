//! Run orchestration: configuration, retry/pagination control, and the
//! listing, drill-down and diagnostic collection runs.

mod config;
mod pipeline;
mod retry;

pub use config::{OutputNames, Pacing, RunConfig, DEFAULT_CONFIG_FILE};
pub use pipeline::{Pipeline, RunError, RunSummary};
pub use retry::{fetch_with_retry, paginate, Paginated, RetryPolicy};

pub const CRATE_NAME: &str = "livestat-sync";
