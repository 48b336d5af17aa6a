use async_trait::async_trait;
use livestat_core::{fields, FlatRecord, RawPayload, SourceKind, TargetId};
use serde_json::{json, Value as JsonValue};

use crate::normalize::{discover_named_entries, flatten_leaves};
use crate::{AdapterError, DrillDownAdapter, Endpoints, FetchContext, FetchStrategy};

/// E-commerce conversion summary: a flat bag of metrics per broadcast.
#[derive(Debug, Clone)]
pub struct ConversionAdapter {
    endpoints: Endpoints,
    id_field: String,
}

impl ConversionAdapter {
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
}

#[async_trait]
impl DrillDownAdapter for ConversionAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Conversion
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::Api
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, target: &TargetId) -> Result<RawPayload, AdapterError> {
        let body = self
            .endpoints
            .request(json!({ (fields::LIVE_OBJECT_ID): target.as_str() }));
        Ok(ctx.api.post_envelope(&self.endpoints.conversion, &body).await?)
    }

    fn is_valid(&self, payload: Option<&RawPayload>) -> bool {
        payload
            .and_then(JsonValue::as_object)
            .is_some_and(|map| !map.is_empty())
    }

    fn flatten(&self, target: &TargetId, payload: &RawPayload) -> Vec<FlatRecord> {
        let mut record = FlatRecord::for_target(self.id_field(), target);
        flatten_leaves(payload, "", &mut record, &[self.id_field()]);
        for (name, value) in discover_named_entries(payload) {
            record.insert_unique(&name, value);
        }
        vec![record]
    }
}
