use livestat_core::{fields, FlatRecord, RawPayload, TargetId, TimeWindow};
use livestat_storage::{ApiClient, FetchError};
use serde_json::{json, Value as JsonValue};

use crate::normalize::{first_text, text_at, value_to_text};
use crate::Endpoints;

/// One page of the broadcast history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub items: Vec<JsonValue>,
    /// Server-reported total across all pages, when the response carries one.
    pub total: Option<u64>,
}

/// Paginated broadcast history (API strategy only).
#[derive(Debug, Clone)]
pub struct ListingAdapter {
    endpoints: Endpoints,
    id_field: String,
}

impl ListingAdapter {
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

    pub fn request_payload(&self, page_size: u32, current_page: u32, window: &TimeWindow) -> JsonValue {
        self.endpoints.request(json!({
            "pageSize": page_size,
            "currentPage": current_page,
            "reqType": 2,
            "filterStartTime": window.start_unix(),
            "filterEndTime": window.end_unix(),
        }))
    }

    pub async fn fetch_page(
        &self,
        api: &ApiClient,
        page_size: u32,
        current_page: u32,
        window: &TimeWindow,
    ) -> Result<RawPayload, FetchError> {
        let payload = self.request_payload(page_size, current_page, window);
        api.post_envelope(&self.endpoints.listing, &payload).await
    }

    /// Accepts both the `liveObjectList`/`totalLiveCount` and the
    /// `items`/`totalCount` response shapes.
    pub fn parse_page(payload: &RawPayload) -> ListingPage {
        let items = ["liveObjectList", "items"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(JsonValue::as_array))
            .cloned()
            .unwrap_or_default();
        let total = ["totalLiveCount", "totalCount"]
            .iter()
            .filter_map(|k| payload.get(*k))
            .find_map(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())));
        ListingPage { items, total }
    }

    /// `None` for items that carry no identifier.
    pub fn flatten_item(&self, item: &JsonValue) -> Option<FlatRecord> {
        let id = TargetId::new(value_to_text(item.get(fields::LIVE_OBJECT_ID)?));
        if id.is_blank() {
            return None;
        }
        let mut record = FlatRecord::for_target(&self.id_field, &id);
        record.insert("description", text_at(item, &["description"]));
        record.insert(
            "liveDurationSeconds",
            text_at(item, &["liveStats", "liveDurationInSeconds"]),
        );
        record.insert(
            "totalAudience",
            text_at(item, &["liveStats", "totalAudienceCount"]),
        );
        record.insert(
            "maxOnline",
            first_text(item, &[&["maxOnlineCount"], &["liveStats", "maxOnlineCount"]]),
        );
        record.insert("hotQuota", text_at(item, &["hotQuota"]));
        record.insert("payedGmv", text_at(item, &["payedGmv"]));
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use livestat_core::SessionCredentials;
    use livestat_storage::HttpClientConfig;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).single().unwrap(),
        )
    }

    #[test]
    fn payload_carries_paging_window_and_literals() {
        let adapter = ListingAdapter::new(Endpoints::default());
        let body = adapter.request_payload(50, 3, &window());
        assert_eq!(body["pageSize"], 50);
        assert_eq!(body["currentPage"], 3);
        assert_eq!(body["reqType"], 2);
        assert_eq!(body["filterStartTime"], 1_748_736_000i64);
        assert_eq!(body["scene"], 7);
        assert_eq!(body["reqScene"], 7);
    }

    #[test]
    fn parses_both_page_shapes() {
        let a = ListingAdapter::parse_page(&json!({
            "liveObjectList": [{"liveObjectId": "1"}],
            "totalLiveCount": 9
        }));
        assert_eq!(a.items.len(), 1);
        assert_eq!(a.total, Some(9));

        let b = ListingAdapter::parse_page(&json!({"items": [], "totalCount": "4"}));
        assert!(b.items.is_empty());
        assert_eq!(b.total, Some(4));

        let c = ListingAdapter::parse_page(&json!(null));
        assert_eq!(c, ListingPage::default());
    }

    #[test]
    fn flattens_item_with_id_as_text_and_blank_defaults() {
        let adapter = ListingAdapter::new(Endpoints::default());
        let record = adapter
            .flatten_item(&json!({
                "liveObjectId": 700000000000000001u64,
                "description": "launch",
                "liveStats": {"liveDurationInSeconds": 3600, "totalAudienceCount": 120},
                "maxOnlineCount": 33,
                "payedGmv": "88.5"
            }))
            .expect("record");
        assert_eq!(record.keys().next(), Some(fields::LIVE_OBJECT_ID));
        assert_eq!(record.get(fields::LIVE_OBJECT_ID), Some("700000000000000001"));
        assert_eq!(record.get("liveDurationSeconds"), Some("3600"));
        assert_eq!(record.get("totalAudience"), Some("120"));
        assert_eq!(record.get("maxOnline"), Some("33"));
        assert_eq!(record.get("hotQuota"), Some(""));
        assert_eq!(record.get("payedGmv"), Some("88.5"));

        assert!(adapter.flatten_item(&json!({"description": "no id"})).is_none());
    }

    #[test]
    fn identifier_column_follows_configured_name() {
        let adapter = ListingAdapter::new(Endpoints::default()).with_id_field("objectId");
        let record = adapter
            .flatten_item(&json!({"liveObjectId": "9", "description": "d"}))
            .expect("record");
        assert_eq!(record.keys().next(), Some("objectId"));
        assert_eq!(record.get("objectId"), Some("9"));
        assert!(!record.contains_key(fields::LIVE_OBJECT_ID));
    }

    #[tokio::test]
    async fn fetch_page_posts_to_listing_endpoint() {
        let server = MockServer::start().await;
        let endpoints = Endpoints::default();
        Mock::given(method("POST"))
            .and(path(endpoints.listing.as_str()))
            .and(body_partial_json(json!({"currentPage": 2, "pageSize": 10})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errCode": 0,
                "data": {"liveObjectList": [{"liveObjectId": "5"}], "totalLiveCount": 11}
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
        let adapter = ListingAdapter::new(endpoints);
        let payload = adapter.fetch_page(&api, 10, 2, &window()).await.expect("page");
        let page = ListingAdapter::parse_page(&payload);
        assert_eq!(page.total, Some(11));
        assert_eq!(page.items[0]["liveObjectId"], "5");
    }
}
