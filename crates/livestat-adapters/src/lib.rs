//! Source adapter contracts + per-endpoint fetch/validate/flatten implementations.

pub mod driver;
pub mod extract;
pub mod normalize;
pub mod session;
mod sources;

use async_trait::async_trait;
use chrono::Utc;
use livestat_core::{FlatRecord, RawPayload, SourceKind, TargetId};
use livestat_storage::{ApiClient, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub use driver::{
    open_and_wait, BrowserConfig, DriverError, HtmlSnapshotDriver, PageDriver, PageWait,
    ReadinessProbe, WebDriverPage,
};
pub use session::{AssumeYes, LoginOutcome, Operator, SessionProvider, TerminalOperator};
pub use sources::{
    promotion_score, ConversionAdapter, DiagnosticAdapter, ListingAdapter, ListingPage,
    ProductTableAdapter, ReservationAdapter, SpuAdapter,
};

pub const CRATE_NAME: &str = "livestat-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    Api,
    Browser,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("{0} source needs a browser page")]
    NoPage(SourceKind),
    #[error("{0}")]
    Message(String),
}

/// Per-run handles an adapter fetches through. The page is present only for
/// runs whose adapter scrapes.
#[derive(Clone, Copy)]
pub struct FetchContext<'a> {
    pub api: &'a ApiClient,
    pub page: Option<&'a dyn PageDriver>,
}

impl<'a> FetchContext<'a> {
    pub fn new(api: &'a ApiClient, page: Option<&'a dyn PageDriver>) -> Self {
        Self { api, page }
    }

    pub fn require_page(&self, source: SourceKind) -> Result<&'a dyn PageDriver, AdapterError> {
        self.page.ok_or(AdapterError::NoPage(source))
    }
}

/// Whatever could still be read off the page after the last failed attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureContext {
    pub current_url: String,
    pub title: String,
}

/// Remote endpoint paths and the request literals they expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub listing: String,
    pub reservation: String,
    pub spu: String,
    pub conversion: String,
    pub diagnostic: String,
    /// Page templates; `{id}` is replaced by the target identifier.
    pub detail_page: String,
    pub product_page: String,
    pub login_page: String,
    pub finder_id: String,
    pub scene: u32,
    pub spu_fields: Vec<String>,
    pub spu_page_size: u32,
    pub spu_max_pages: u32,
}

impl Default for Endpoints {
    fn default() -> Self {
        let api = "/micro/statistic/cgi-bin/mmfinderassistant-bin";
        Self {
            listing: format!("{api}/live/get_live_history"),
            reservation: format!("{api}/live/get_live_reserve_info"),
            spu: format!("{api}/live/get_live_spu_list"),
            conversion: format!("{api}/live/get_live_ecom_summary"),
            diagnostic: format!("{api}/live/get_live_diagnosis"),
            detail_page: "/platform/statistic/live?mode=detail&objetctId={id}".to_string(),
            product_page: "/platform/statistic/dashboardV4?objetctId={id}&entrance_id=3&tab=product"
                .to_string(),
            login_page: "/platform/login".to_string(),
            finder_id: String::new(),
            scene: 7,
            spu_fields: vec![
                "spuId".to_string(),
                "title".to_string(),
                "payCnt".to_string(),
                "payGmv".to_string(),
                "clickCnt".to_string(),
            ],
            spu_page_size: 50,
            spu_max_pages: 100,
        }
    }
}

impl Endpoints {
    /// Literal fields every API request carries: scene tags, a millisecond
    /// timestamp and the account's finder id.
    pub fn scene_tags(&self) -> Map<String, JsonValue> {
        let mut tags = Map::new();
        tags.insert("timestamp".into(), json!(Utc::now().timestamp_millis().to_string()));
        tags.insert("_log_finder_uin".into(), json!(""));
        tags.insert("_log_finder_id".into(), json!(self.finder_id));
        tags.insert("rawKeyBuff".into(), JsonValue::Null);
        tags.insert("pluginSessionId".into(), JsonValue::Null);
        tags.insert("scene".into(), json!(self.scene));
        tags.insert("reqScene".into(), json!(self.scene));
        tags
    }

    /// `fields` merged over the scene tags.
    pub fn request(&self, fields: JsonValue) -> JsonValue {
        let mut body = self.scene_tags();
        if let JsonValue::Object(extra) = fields {
            body.extend(extra);
        }
        JsonValue::Object(body)
    }

    pub fn page_url(&self, api: &ApiClient, template: &str, target: &TargetId) -> String {
        api.endpoint_url(&template.replace("{id}", target.as_str()))
    }
}

/// One drill-down source: fetch a payload for an identifier, judge it, and
/// flatten it into output rows.
#[async_trait]
pub trait DrillDownAdapter: Send + Sync {
    fn source(&self) -> SourceKind;
    fn strategy(&self) -> FetchStrategy;

    /// Identifier column of the upstream listing and of every emitted row.
    fn id_field(&self) -> &str;

    async fn fetch(
        &self,
        ctx: &FetchContext<'_>,
        target: &TargetId,
    ) -> Result<RawPayload, AdapterError>;

    fn is_valid(&self, payload: Option<&RawPayload>) -> bool;

    fn flatten(&self, target: &TargetId, payload: &RawPayload) -> Vec<FlatRecord>;

    async fn failure_context(&self, _ctx: &FetchContext<'_>) -> FailureContext {
        FailureContext::default()
    }

    /// Rows standing in for an identifier whose attempts were exhausted.
    fn failure_records(&self, target: &TargetId, _context: &FailureContext) -> Vec<FlatRecord> {
        vec![normalize::failure_record(self.id_field(), target, &[])]
    }
}

/// Registry. `reservation_strategy` picks between the API and the rendered
/// page for the reservation source; the other sources have one strategy each.
/// Every adapter keys its rows by `id_field`. The listing source is not a
/// drill-down and yields `None`.
pub fn drill_down_adapter(
    kind: SourceKind,
    endpoints: &Endpoints,
    wait: &PageWait,
    reservation_strategy: FetchStrategy,
    id_field: &str,
) -> Option<Box<dyn DrillDownAdapter>> {
    let endpoints = endpoints.clone();
    let adapter: Box<dyn DrillDownAdapter> = match kind {
        SourceKind::Listing => return None,
        SourceKind::Reservation => Box::new(
            ReservationAdapter::new(endpoints, wait.clone(), reservation_strategy)
                .with_id_field(id_field),
        ),
        SourceKind::ProductTable => {
            Box::new(ProductTableAdapter::new(endpoints, wait.clone()).with_id_field(id_field))
        }
        SourceKind::Spu => Box::new(SpuAdapter::new(endpoints).with_id_field(id_field)),
        SourceKind::Conversion => Box::new(ConversionAdapter::new(endpoints).with_id_field(id_field)),
        SourceKind::Diagnostic => Box::new(DiagnosticAdapter::new(endpoints).with_id_field(id_field)),
    };
    Some(adapter)
}
