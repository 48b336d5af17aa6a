use async_trait::async_trait;
use indexmap::IndexMap;
use livestat_core::{fields, FlatRecord, RawPayload, SourceKind, TargetId};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::driver::{open_and_wait, PageDriver, PageWait, ReadinessProbe};
use crate::normalize::{discover_named_entries, failure_record, first_text, value_to_text};
use crate::{
    extract, AdapterError, DrillDownAdapter, Endpoints, FailureContext, FetchContext,
    FetchStrategy,
};

const RESERVE_COUNT_LABEL: &str = "预约人数";
const RESERVE_RATE_LABEL: &str = "预约转化率";

const TITLE_SELECTOR: &str = ".live-build-info .content .title .text-wrap";
const SUMMARY_LABEL_SELECTOR: &str = ".live-data-card-summary-label";
const SUMMARY_VALUE_SELECTOR: &str = ".live-data-card-summary-value";
const LEGEND_SELECTOR: &str = ".reverse-data-legend";
const LEGEND_PARTS_SELECTOR: &str = ".reverse-data-legend-name, .reverse-data-legend-count";

const PROBE: ReadinessProbe = ReadinessProbe {
    data_markers: &[RESERVE_COUNT_LABEL, RESERVE_RATE_LABEL],
    page_marker: Some("直播"),
};

const CHANNEL_BREAKDOWN: &str = "channelBreakdown";

/// Reservation funnel for one broadcast: headline counters plus a per-channel
/// breakdown whose channel names are only known once the page is read.
#[derive(Debug, Clone)]
pub struct ReservationAdapter {
    endpoints: Endpoints,
    wait: PageWait,
    strategy: FetchStrategy,
    id_field: String,
}

impl ReservationAdapter {
    pub fn new(endpoints: Endpoints, wait: PageWait, strategy: FetchStrategy) -> Self {
        Self {
            endpoints,
            wait,
            strategy,
            id_field: fields::LIVE_OBJECT_ID.to_string(),
        }
    }

    /// Names the identifier column of the rows this adapter emits.
    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    async fn fetch_api(&self, ctx: &FetchContext<'_>, target: &TargetId) -> Result<RawPayload, AdapterError> {
        let body = self
            .endpoints
            .request(json!({ (fields::LIVE_OBJECT_ID): target.as_str() }));
        Ok(ctx.api.post_envelope(&self.endpoints.reservation, &body).await?)
    }

    async fn scrape(&self, ctx: &FetchContext<'_>, target: &TargetId) -> Result<RawPayload, AdapterError> {
        let page = ctx.require_page(SourceKind::Reservation)?;
        let url = self
            .endpoints
            .page_url(ctx.api, &self.endpoints.detail_page, target);
        open_and_wait(page, &url, &PROBE, &self.wait).await;

        let current_url = page.current_url().await.unwrap_or_default();
        let source = page.page_source().await?;
        let title = scrape_title(page, &source).await;

        let mut summary: IndexMap<String, String> = IndexMap::new();
        let labels = structured(page.query_all_text(SUMMARY_LABEL_SELECTOR).await);
        let values = structured(page.query_all_text(SUMMARY_VALUE_SELECTOR).await);
        for (label, value) in labels.iter().zip(values.iter()) {
            summary.insert(label.clone(), value.clone());
        }
        let reserve_count = summary_lookup(&summary, RESERVE_COUNT_LABEL)
            .or_else(|| extract::summary_value(&source, RESERVE_COUNT_LABEL))
            .unwrap_or_default();
        let reserve_rate = summary_lookup(&summary, RESERVE_RATE_LABEL)
            .or_else(|| extract::summary_value(&source, RESERVE_RATE_LABEL))
            .unwrap_or_default();

        let mut channels: IndexMap<String, String> = IndexMap::new();
        for parts in structured(page.query_children_text(LEGEND_SELECTOR, LEGEND_PARTS_SELECTOR).await) {
            if let [name, count, ..] = parts.as_slice() {
                if !name.is_empty() {
                    channels.entry(name.clone()).or_insert_with(|| count.clone());
                }
            }
        }
        // The markup pass always runs; it picks up legends the element query missed.
        for (name, count) in extract::legend_entries(&source) {
            channels.entry(name).or_insert(count);
        }

        let breakdown: Vec<JsonValue> = channels
            .into_iter()
            .map(|(name, count)| json!({"name": name, "count": count}))
            .collect();
        Ok(json!({
            (fields::CURRENT_URL): current_url,
            (fields::TITLE): title,
            (fields::RESERVE_COUNT): reserve_count,
            (fields::RESERVE_RATE): reserve_rate,
            (CHANNEL_BREAKDOWN): breakdown,
        }))
    }
}

fn structured<T: Default>(result: Result<T, crate::DriverError>) -> T {
    result.unwrap_or_else(|err| {
        debug!(error = %err, "element query failed; relying on markup");
        T::default()
    })
}

fn summary_lookup(summary: &IndexMap<String, String>, label: &str) -> Option<String> {
    summary
        .iter()
        .find(|(k, _)| k.contains(label))
        .map(|(_, v)| v.trim().to_string())
}

async fn scrape_title(page: &dyn PageDriver, source: &str) -> String {
    structured(page.query_all_text(TITLE_SELECTOR).await)
        .into_iter()
        .find(|t| !t.is_empty())
        .or_else(|| extract::title(source))
        .unwrap_or_default()
}

fn reserve_count(payload: &RawPayload) -> String {
    first_text(
        payload,
        &[&[fields::RESERVE_COUNT], &["counts", fields::RESERVE_COUNT]],
    )
}

#[async_trait]
impl DrillDownAdapter for ReservationAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Reservation
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn strategy(&self) -> FetchStrategy {
        self.strategy
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, target: &TargetId) -> Result<RawPayload, AdapterError> {
        match self.strategy {
            FetchStrategy::Api => self.fetch_api(ctx, target).await,
            FetchStrategy::Browser => self.scrape(ctx, target).await,
        }
    }

    /// Usable only once the reservation counter has rendered.
    fn is_valid(&self, payload: Option<&RawPayload>) -> bool {
        payload.is_some_and(|p| !reserve_count(p).is_empty())
    }

    fn flatten(&self, target: &TargetId, payload: &RawPayload) -> Vec<FlatRecord> {
        let mut record = FlatRecord::for_target(self.id_field(), target);
        record.insert(fields::CURRENT_URL, first_text(payload, &[&[fields::CURRENT_URL]]));
        record.insert(fields::TITLE, first_text(payload, &[&[fields::TITLE]]));
        record.insert(fields::RESERVE_COUNT, reserve_count(payload));
        record.insert(
            fields::RESERVE_RATE,
            first_text(
                payload,
                &[&[fields::RESERVE_RATE], &["rateFields", fields::RESERVE_RATE]],
            ),
        );
        record.insert(fields::REMARK, "");

        for container in ["counts", "rateFields"] {
            let Some(map) = payload.get(container).and_then(JsonValue::as_object) else {
                continue;
            };
            for (key, value) in map {
                if key == fields::RESERVE_COUNT || key == fields::RESERVE_RATE {
                    continue;
                }
                if !value.is_object() && !value.is_array() {
                    record.insert_unique(key, value_to_text(value));
                }
            }
        }
        for (name, count) in discover_named_entries(payload) {
            record.insert_unique(&name, count);
        }
        vec![record]
    }

    async fn failure_context(&self, ctx: &FetchContext<'_>) -> FailureContext {
        let Some(page) = ctx.page else {
            return FailureContext::default();
        };
        let current_url = page.current_url().await.unwrap_or_default();
        let title = match page.page_source().await {
            Ok(source) => scrape_title(page, &source).await,
            Err(_) => String::new(),
        };
        FailureContext { current_url, title }
    }

    fn failure_records(&self, target: &TargetId, context: &FailureContext) -> Vec<FlatRecord> {
        vec![failure_record(
            self.id_field(),
            target,
            &[
                (fields::CURRENT_URL, context.current_url.as_str()),
                (fields::TITLE, context.title.as_str()),
                (fields::RESERVE_COUNT, ""),
                (fields::RESERVE_RATE, ""),
            ],
        )]
    }
}
