use async_trait::async_trait;
use livestat_core::{fields, FlatRecord, RawPayload, SourceKind, TargetId};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::normalize::flatten_leaves;
use crate::{AdapterError, DrillDownAdapter, Endpoints, FetchContext, FetchStrategy};

/// Product/SPU sales rows for one broadcast, paged by offset.
#[derive(Debug, Clone)]
pub struct SpuAdapter {
    endpoints: Endpoints,
    id_field: String,
}

impl SpuAdapter {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            id_field: fields::LIVE_OBJECT_ID.to_string(),
        }
    }

    /// Names the identifier column of the rows this adapter emits.
    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn request_payload(&self, target: &TargetId, offset: u32) -> JsonValue {
        self.endpoints.request(json!({
            (fields::LIVE_OBJECT_ID): target.as_str(),
            "offset": offset,
            "limit": self.endpoints.spu_page_size,
            "fieldList": self.endpoints.spu_fields,
        }))
    }
}

fn page_rows(data: &JsonValue) -> Vec<JsonValue> {
    ["rows", "list"]
        .iter()
        .find_map(|k| data.get(*k).and_then(JsonValue::as_array))
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl DrillDownAdapter for SpuAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Spu
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::Api
    }

    /// Pages until a short or empty page. Any failed page fails the whole
    /// fetch so the retry starts from offset zero with a clean row set.
    async fn fetch(&self, ctx: &FetchContext<'_>, target: &TargetId) -> Result<RawPayload, AdapterError> {
        let limit = self.endpoints.spu_page_size.max(1);
        let mut rows = Vec::new();
        let mut offset = 0u32;
        for _ in 0..self.endpoints.spu_max_pages.max(1) {
            let body = self.request_payload(target, offset);
            let data = ctx.api.post_envelope(&self.endpoints.spu, &body).await?;
            let page = page_rows(&data);
            let fetched = page.len();
            rows.extend(page);
            debug!(target_id = %target, offset, fetched, "spu page");
            if fetched < limit as usize {
                break;
            }
            offset += limit;
        }
        Ok(json!({ "rows": rows }))
    }

    fn is_valid(&self, payload: Option<&RawPayload>) -> bool {
        payload.is_some_and(|p| p.get("rows").is_some_and(JsonValue::is_array))
    }

    fn flatten(&self, target: &TargetId, payload: &RawPayload) -> Vec<FlatRecord> {
        let rows = page_rows(payload);
        if rows.is_empty() {
            return vec![FlatRecord::for_target(self.id_field(), target)];
        }
        rows.iter()
            .map(|row| {
                let mut record = FlatRecord::for_target(self.id_field(), target);
                flatten_leaves(row, "", &mut record, &[]);
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livestat_core::SessionCredentials;
    use livestat_storage::{ApiClient, HttpClientConfig};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn row(id: u32) -> JsonValue {
        json!({"baseInfo": {"spuId": id, "title": format!("item {id}")}, "payCnt": id * 2})
    }

    #[tokio::test]
    async fn pages_by_offset_until_short_page() {
        let server = MockServer::start().await;
        let endpoints = Endpoints {
            spu_page_size: 2,
            ..Default::default()
        };
        Mock::given(method("POST"))
            .and(path(endpoints.spu.as_str()))
            .and(body_partial_json(json!({"offset": 0, "limit": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errCode": 0, "data": {"rows": [row(1), row(2)]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoints.spu.as_str()))
            .and(body_partial_json(json!({"offset": 2, "limit": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errCode": 0, "data": {"rows": [row(3)]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(
            HttpClientConfig {
                base_url: server.uri(),
                ..Default::default()
            },
            &SessionCredentials::empty(),
        )
        .expect("client");
        let ctx = FetchContext::new(&api, None);
        let adapter = SpuAdapter::new(endpoints);
        let target = TargetId::from("70");
        let payload = adapter.fetch(&ctx, &target).await.expect("payload");
        assert!(adapter.is_valid(Some(&payload)));

        let records = adapter.flatten(&target, &payload);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].get(fields::LIVE_OBJECT_ID), Some("70"));
        assert_eq!(records[2].get("baseInfo.spuId"), Some("3"));
        assert_eq!(records[2].get("baseInfo.title"), Some("item 3"));
        assert_eq!(records[2].get("payCnt"), Some("6"));
    }

    #[test]
    fn empty_row_set_keeps_identifier() {
        let adapter = SpuAdapter::new(Endpoints::default());
        let payload = json!({"rows": []});
        assert!(adapter.is_valid(Some(&payload)));
        assert!(!adapter.is_valid(Some(&json!({}))));
        let records = adapter.flatten(&TargetId::from("1"), &payload);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len(), 1);
    }
}
