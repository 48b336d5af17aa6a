use async_trait::async_trait;
use livestat_core::{fields, FlatRecord, RawPayload, SourceKind, TargetId};
use serde_json::json;

use crate::normalize::first_text;
use crate::{AdapterError, DrillDownAdapter, Endpoints, FetchContext, FetchStrategy};

/// Diagnostic promotion score for one broadcast.
#[derive(Debug, Clone)]
pub struct DiagnosticAdapter {
    endpoints: Endpoints,
    id_field: String,
}

impl DiagnosticAdapter {
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

/// `promotionScore.value`, or a bare `promotionScore` scalar.
pub fn promotion_score(payload: &RawPayload) -> Option<String> {
    let score = first_text(
        payload,
        &[&[fields::PROMOTION_SCORE, "value"], &[fields::PROMOTION_SCORE]],
    );
    (!score.is_empty()).then_some(score)
}

#[async_trait]
impl DrillDownAdapter for DiagnosticAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Diagnostic
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
        Ok(ctx.api.post_envelope(&self.endpoints.diagnostic, &body).await?)
    }

    fn is_valid(&self, payload: Option<&RawPayload>) -> bool {
        payload.and_then(promotion_score).is_some()
    }

    fn flatten(&self, target: &TargetId, payload: &RawPayload) -> Vec<FlatRecord> {
        let mut record = FlatRecord::for_target(self.id_field(), target);
        record.insert(fields::PROMOTION_SCORE, promotion_score(payload).unwrap_or_default());
        vec![record]
    }
}
