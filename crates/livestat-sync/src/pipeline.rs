use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use livestat_adapters::{
    promotion_score, DiagnosticAdapter, DrillDownAdapter, FetchContext, FetchStrategy,
    ListingAdapter, PageDriver,
};
use livestat_core::{fields, RecordSet, SessionCredentials, SourceKind, TargetId};
use livestat_storage::{read_id_column, read_records, ApiClient, ReadError, WorkbookStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::retry::{fetch_with_retry, paginate};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("not authenticated: login was declined")]
    NotAuthenticated,
    #[error("upstream file {path} not found; run the listing first")]
    UpstreamMissing { path: PathBuf },
    #[error("upstream file {path} has no {column} column")]
    UpstreamColumnMissing { path: PathBuf, column: String },
    #[error("upstream file {path} is unreadable: {reason}")]
    UpstreamUnreadable { path: PathBuf, reason: String },
    #[error("{0} source needs a browser but none was provided")]
    BrowserUnavailable(SourceKind),
    #[error("setting up the run: {0}")]
    Setup(String),
    #[error("final checkpoint to {path} failed")]
    FinalCheckpointFailed { path: PathBuf },
    #[error("no records were collected")]
    NothingCollected,
}

impl RunError {
    fn from_upstream(err: ReadError) -> Self {
        match err {
            ReadError::Missing(path) => RunError::UpstreamMissing { path },
            ReadError::MissingColumn { path, column } => {
                RunError::UpstreamColumnMissing { path, column }
            }
            ReadError::NoSheet(path) => RunError::UpstreamUnreadable {
                path,
                reason: "no worksheets".to_string(),
            },
            ReadError::Workbook { path, source } => RunError::UpstreamUnreadable {
                path,
                reason: source.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: SourceKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records: usize,
    pub output: PathBuf,
}

/// Drives collection runs. One run processes its targets strictly in order
/// and owns the page (when given) for its whole duration.
pub struct Pipeline<'p> {
    config: RunConfig,
    api: ApiClient,
    page: Option<&'p dyn PageDriver>,
}

impl<'p> Pipeline<'p> {
    pub fn new(config: RunConfig, api: ApiClient) -> Self {
        Self {
            config,
            api,
            page: None,
        }
    }

    /// Builds the API client from the profile's credentials, falling back to
    /// the configured seed when the profile gave none.
    pub fn connect(config: RunConfig, credentials: SessionCredentials) -> Result<Self, RunError> {
        let credentials = credentials.or_seed(config.seed_credentials.clone());
        if credentials.cookies.is_empty() {
            warn!("no session cookies available; requests will likely be rejected");
        }
        let api = ApiClient::new(config.http_config(), &credentials)
            .map_err(|e| RunError::Setup(format!("{e:#}")))?;
        Ok(Self::new(config, api))
    }

    pub fn with_page(mut self, page: &'p dyn PageDriver) -> Self {
        self.page = Some(page);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Enumerates the broadcast history page by page and writes the listing
    /// workbook.
    pub async fn run_listing(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = SourceKind::Listing.as_str());
        self.listing_inner(run_id).instrument(span).await
    }

    async fn listing_inner(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let config = &self.config;
        let destination = config.output_path(SourceKind::Listing, Local::now());
        let window = config.time_window_at(started_at);
        info!(
            start = %window.start,
            end = %window.end,
            output = %destination.display(),
            "listing run started"
        );

        let adapter = ListingAdapter::new(config.endpoints.clone()).with_id_field(&config.id_field);
        let api = &self.api;
        let adapter_ref = &adapter;
        let window_ref = &window;
        let page_size = config.page_size;
        let retry = &config.retry;
        let paginated = paginate(config.max_pages, config.pacing.list_page(), |page_no| async move {
            fetch_with_retry(
                retry,
                format!("page {page_no}"),
                |_| adapter_ref.fetch_page(api, page_size, page_no, window_ref),
                |p| p.is_some(),
            )
            .await
            .map(|payload| ListingAdapter::parse_page(&payload))
        })
        .await;

        let records: RecordSet = paginated
            .items
            .iter()
            .filter_map(|item| adapter.flatten_item(item))
            .collect();
        if records.is_empty() {
            return Err(RunError::NothingCollected);
        }
        if paginated.interrupted {
            warn!(collected = records.len(), "listing incomplete; saving what was collected");
        }

        let mut store = WorkbookStore::new(
            &destination,
            SourceKind::Listing.sheet_label(),
            config.id_field.as_str(),
        );
        if !store.persist(&records).await {
            return Err(RunError::FinalCheckpointFailed { path: destination });
        }

        let summary = RunSummary {
            run_id,
            source: SourceKind::Listing,
            started_at,
            finished_at: Utc::now(),
            targets: paginated.items.len(),
            succeeded: records.len(),
            failed: paginated.items.len() - records.len(),
            records: records.len(),
            output: destination,
        };
        info!(records = summary.records, pages = paginated.pages, "listing run finished");
        Ok(summary)
    }

    /// Fetches `adapter`'s data for every identifier in the upstream listing
    /// workbook. Every identifier ends up with at least one row.
    pub async fn run_drill_down(&self, adapter: &dyn DrillDownAdapter) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = adapter.source().as_str());
        self.drill_down_inner(run_id, adapter).instrument(span).await
    }

    fn upstream_targets(&self, id_field: &str) -> Result<(PathBuf, Vec<TargetId>), RunError> {
        let upstream = self.config.listing_path();
        let mut targets =
            read_id_column(&upstream, None, id_field).map_err(RunError::from_upstream)?;
        if let Some(limit) = self.config.limit {
            targets.truncate(limit);
        }
        Ok((upstream, targets))
    }

    fn context(&self, strategy: FetchStrategy, source: SourceKind) -> Result<FetchContext<'_>, RunError> {
        if strategy == FetchStrategy::Browser && self.page.is_none() {
            return Err(RunError::BrowserUnavailable(source));
        }
        Ok(FetchContext::new(&self.api, self.page))
    }

    fn checkpoint_due(&self, processed: usize) -> bool {
        self.config.checkpoint_every > 0 && processed % self.config.checkpoint_every == 0
    }

    async fn drill_down_inner(
        &self,
        run_id: Uuid,
        adapter: &dyn DrillDownAdapter,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let source = adapter.source();
        let ctx = self.context(adapter.strategy(), source)?;
        let (upstream, targets) = self.upstream_targets(adapter.id_field())?;
        let destination = self.config.output_path(source, Local::now());
        info!(
            upstream = %upstream.display(),
            output = %destination.display(),
            targets = targets.len(),
            "drill-down run started"
        );
        if targets.is_empty() {
            warn!(upstream = %upstream.display(), "upstream lists no identifiers");
        }

        let mut store = WorkbookStore::new(&destination, source.sheet_label(), adapter.id_field());
        let mut records = RecordSet::new();
        let (mut succeeded, mut failed) = (0usize, 0usize);
        let total = targets.len();

        for (idx, target) in targets.iter().enumerate() {
            let span = info_span!("target", target_id = %target);
            async {
                info!("[{}/{}] fetching {}", idx + 1, total, target);
                let payload = fetch_with_retry(
                    &self.config.retry,
                    target,
                    |_| adapter.fetch(&ctx, target),
                    |p| adapter.is_valid(p),
                )
                .await;
                match payload {
                    Some(payload) => {
                        let rows = adapter.flatten(target, &payload);
                        info!(rows = rows.len(), "collected");
                        records.extend(rows);
                        succeeded += 1;
                    }
                    None => {
                        let context = adapter.failure_context(&ctx).await;
                        records.extend(adapter.failure_records(target, &context));
                        warn!("recorded as failed");
                        failed += 1;
                    }
                }
            }
            .instrument(span)
            .await;

            let processed = idx + 1;
            if self.checkpoint_due(processed) {
                store.persist(&records).await;
            }
            if processed < total {
                tokio::time::sleep(self.config.pacing.target()).await;
            }
        }

        if !store.persist(&records).await {
            return Err(RunError::FinalCheckpointFailed { path: destination });
        }
        let summary = RunSummary {
            run_id,
            source,
            started_at,
            finished_at: Utc::now(),
            targets: total,
            succeeded,
            failed,
            records: records.len(),
            output: destination,
        };
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            records = summary.records,
            "drill-down run finished"
        );
        Ok(summary)
    }

    /// Adds a `promotionScore` column to the listing workbook in place.
    /// Identifiers whose score could not be fetched get an empty cell.
    pub async fn augment_listing_with_diagnostics(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = SourceKind::Diagnostic.as_str());
        let adapter =
            DiagnosticAdapter::new(self.config.endpoints.clone()).with_id_field(&self.config.id_field);
        self.augment_inner(run_id, &adapter).instrument(span).await
    }

    async fn augment_inner(
        &self,
        run_id: Uuid,
        adapter: &DiagnosticAdapter,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let id_field = self.config.id_field.as_str();
        let path = self.config.listing_path();
        let (sheet, mut listing) = read_records(&path, None).map_err(RunError::from_upstream)?;
        if !listing.iter().any(|r| r.contains_key(id_field)) {
            return Err(RunError::UpstreamColumnMissing {
                path,
                column: id_field.to_string(),
            });
        }
        let mut targets = listing.target_ids(id_field);
        if let Some(limit) = self.config.limit {
            targets.truncate(limit);
        }
        info!(listing = %path.display(), targets = targets.len(), "diagnostic augmentation started");

        let ctx = FetchContext::new(&self.api, None);
        let mut store = WorkbookStore::new(&path, sheet, id_field);
        let (mut succeeded, mut failed) = (0usize, 0usize);
        let total = targets.len();

        for (idx, target) in targets.iter().enumerate() {
            info!("[{}/{}] fetching score for {}", idx + 1, total, target);
            let score = fetch_with_retry(
                &self.config.retry,
                target,
                |_| adapter.fetch(&ctx, target),
                |p| adapter.is_valid(p),
            )
            .await
            .and_then(|payload| promotion_score(&payload));
            match &score {
                Some(_) => succeeded += 1,
                None => {
                    warn!(target_id = %target, "no score; leaving cell empty");
                    failed += 1;
                }
            }
            set_column(&mut listing, id_field, target, fields::PROMOTION_SCORE, score.unwrap_or_default());

            let processed = idx + 1;
            if self.checkpoint_due(processed) {
                store.persist(&listing).await;
            }
            if processed < total {
                tokio::time::sleep(self.config.pacing.target()).await;
            }
        }

        if !store.persist(&listing).await {
            return Err(RunError::FinalCheckpointFailed { path });
        }
        Ok(RunSummary {
            run_id,
            source: SourceKind::Diagnostic,
            started_at,
            finished_at: Utc::now(),
            targets: total,
            succeeded,
            failed,
            records: listing.len(),
            output: path,
        })
    }
}

fn set_column(records: &mut RecordSet, id_field: &str, target: &TargetId, column: &str, value: String) {
    for record in records.iter_mut() {
        if record.get(id_field) == Some(target.as_str()) {
            record.insert(column, value.clone());
        }
    }
}
