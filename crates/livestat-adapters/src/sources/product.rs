use async_trait::async_trait;
use livestat_core::{fields, FlatRecord, RawPayload, SourceKind, TargetId};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::driver::{open_and_wait, PageWait, ReadinessProbe};
use crate::normalize::{failure_record, flatten_table, text_at, value_to_text};
use crate::{
    extract, AdapterError, DrillDownAdapter, Endpoints, FailureContext, FetchContext,
    FetchStrategy,
};

const HEADER_SELECTOR: &str = ".ant-table-scroll .ant-table-header.ant-table-hide-scrollbar tr th";
const ROW_SELECTOR: &str = ".ant-table-body .ant-table-tbody tr";

const PROBE: ReadinessProbe = ReadinessProbe {
    data_markers: &["ant-table"],
    page_marker: None,
};

/// Per-broadcast product table scraped from the dashboard. Column names come
/// from the rendered header row.
#[derive(Debug, Clone)]
pub struct ProductTableAdapter {
    endpoints: Endpoints,
    wait: PageWait,
    id_field: String,
}

impl ProductTableAdapter {
    pub fn new(endpoints: Endpoints, wait: PageWait) -> Self {
        Self {
            endpoints,
            wait,
            id_field: fields::LIVE_OBJECT_ID.to_string(),
        }
    }

    /// Names the identifier column of the rows this adapter emits.
    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    value
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().map(value_to_text).collect())
        .unwrap_or_default()
}

#[async_trait]
impl DrillDownAdapter for ProductTableAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::ProductTable
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::Browser
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, target: &TargetId) -> Result<RawPayload, AdapterError> {
        let page = ctx.require_page(SourceKind::ProductTable)?;
        let url = self
            .endpoints
            .page_url(ctx.api, &self.endpoints.product_page, target);
        open_and_wait(page, &url, &PROBE, &self.wait).await;

        let current_url = page.current_url().await.unwrap_or_default();
        let source = page.page_source().await?;

        let mut headers: Vec<String> = match page.query_all_text(HEADER_SELECTOR).await {
            Ok(texts) => texts.into_iter().filter(|t| !t.is_empty()).collect(),
            Err(err) => {
                debug!(error = %err, "header query failed");
                Vec::new()
            }
        };
        if headers.is_empty() {
            headers = extract::table_headers(&source);
        }

        let mut rows: Vec<Vec<String>> = match page.query_children_text(ROW_SELECTOR, "td").await {
            Ok(rows) => rows.into_iter().filter(|cells| !cells.is_empty()).collect(),
            Err(err) => {
                debug!(error = %err, "row query failed");
                Vec::new()
            }
        };
        if rows.is_empty() {
            rows = extract::table_rows(&source);
        }
        debug!(target_id = %target, headers = headers.len(), rows = rows.len(), "product table read");

        Ok(json!({
            (fields::CURRENT_URL): current_url,
            "headers": headers,
            "rows": rows,
        }))
    }

    /// A table with no rows is still a result; only a failed fetch retries.
    fn is_valid(&self, payload: Option<&RawPayload>) -> bool {
        payload.is_some()
    }

    fn flatten(&self, target: &TargetId, payload: &RawPayload) -> Vec<FlatRecord> {
        let headers = string_list(payload.get("headers"));
        let rows: Vec<Vec<String>> = payload
            .get("rows")
            .and_then(JsonValue::as_array)
            .map(|rows| rows.iter().map(|r| string_list(Some(r))).collect())
            .unwrap_or_default();
        let context = [(fields::CURRENT_URL, text_at(payload, &[fields::CURRENT_URL]))];
        flatten_table(self.id_field(), target, &context, &headers, &rows)
    }

    async fn failure_context(&self, ctx: &FetchContext<'_>) -> FailureContext {
        let current_url = match ctx.page {
            Some(page) => page.current_url().await.unwrap_or_default(),
            None => String::new(),
        };
        FailureContext {
            current_url,
            title: String::new(),
        }
    }

    fn failure_records(&self, target: &TargetId, context: &FailureContext) -> Vec<FlatRecord> {
        vec![failure_record(
            self.id_field(),
            target,
            &[(fields::CURRENT_URL, context.current_url.as_str())],
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HtmlSnapshotDriver;
    use livestat_core::SessionCredentials;
    use livestat_storage::{ApiClient, HttpClientConfig};

    fn api() -> ApiClient {
        ApiClient::new(
            HttpClientConfig {
                base_url: "https://h.test".to_string(),
                ..Default::default()
            },
            &SessionCredentials::empty(),
        )
        .expect("client")
    }

    const TABLE_PAGE: &str = r#"<html><body>
      <div class="ant-table-scroll">
        <div class="ant-table-header ant-table-hide-scrollbar"><table><thead>
          <tr><th>Product</th><th>Sales</th><th></th></tr>
        </thead></table></div>
        <div class="ant-table-body"><table><tbody class="ant-table-tbody">
          <tr><td>Cup</td><td>12</td></tr>
          <tr><td>Bowl</td><td>3</td><td>gift</td></tr>
        </tbody></table></div>
      </div></body></html>"#;

    const EMPTY_TABLE_PAGE: &str = r#"<html><body>
      <div class="ant-table-scroll">
        <div class="ant-table-header ant-table-hide-scrollbar"><table><thead>
          <tr><th>Product</th></tr></thead></table></div>
        <div class="ant-table-body"><table><tbody class="ant-table-tbody"></tbody></table></div>
      </div></body></html>"#;

    const MARKUP_ONLY_PAGE: &str = r#"<html><body><table>
        <thead class="ant-table-thead"><tr><th>Name</th><th>Qty</th></tr></thead>
        <tbody><tr class="ant-table-row"><td>Tea</td><td>7</td></tr></tbody>
      </table></body></html>"#;

    #[tokio::test(start_paused = true)]
    async fn rows_zip_to_headers_with_surplus_cells_kept() {
        let driver = HtmlSnapshotDriver::new().with_snapshot("tab=product", TABLE_PAGE);
        let api = api();
        let ctx = FetchContext::new(&api, Some(&driver));
        let adapter = ProductTableAdapter::new(Endpoints::default(), PageWait::default());
        let target = TargetId::from("8");

        let payload = adapter.fetch(&ctx, &target).await.expect("payload");
        assert!(adapter.is_valid(Some(&payload)));
        let records = adapter.flatten(&target, &payload);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get(fields::LIVE_OBJECT_ID), Some("8"));
        assert!(records[0]
            .get(fields::CURRENT_URL)
            .is_some_and(|u| u.contains("dashboardV4?objetctId=8")));
        assert_eq!(records[0].get("Product"), Some("Cup"));
        assert_eq!(records[0].get("Sales"), Some("12"));
        assert_eq!(records[1].get("column_3"), Some("gift"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_table_still_yields_identifier_row() {
        let driver = HtmlSnapshotDriver::new().with_snapshot("tab=product", EMPTY_TABLE_PAGE);
        let api = api();
        let ctx = FetchContext::new(&api, Some(&driver));
        let adapter = ProductTableAdapter::new(Endpoints::default(), PageWait::default());
        let target = TargetId::from("8");

        let payload = adapter.fetch(&ctx, &target).await.expect("payload");
        assert!(adapter.is_valid(Some(&payload)));
        let records = adapter.flatten(&target, &payload);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get(fields::LIVE_OBJECT_ID), Some("8"));
        assert_eq!(records[0].get("Product"), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn markup_fallback_when_structured_query_is_empty() {
        let driver = HtmlSnapshotDriver::new().with_snapshot("tab=product", MARKUP_ONLY_PAGE);
        let api = api();
        let ctx = FetchContext::new(&api, Some(&driver));
        let adapter = ProductTableAdapter::new(Endpoints::default(), PageWait::default());
        let target = TargetId::from("3");

        let payload = adapter.fetch(&ctx, &target).await.expect("payload");
        let records = adapter.flatten(&target, &payload);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("Name"), Some("Tea"));
        assert_eq!(records[0].get("Qty"), Some("7"));
    }

    #[test]
    fn only_missing_payload_is_invalid() {
        let adapter = ProductTableAdapter::new(Endpoints::default(), PageWait::default());
        assert!(!adapter.is_valid(None));
        assert!(adapter.is_valid(Some(&json!({"headers": [], "rows": []}))));
        let failed = adapter.failure_records(
            &TargetId::from("3"),
            &FailureContext {
                current_url: "https://h.test/x".to_string(),
                title: String::new(),
            },
        );
        assert_eq!(failed[0].get(fields::REMARK), Some(fields::REMARK_FAILED));
        assert_eq!(failed[0].get(fields::CURRENT_URL), Some("https://h.test/x"));
    }
}
