use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use livestat_adapters::ListingPage;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

/// Bounded attempts with a pause that grows linearly with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt `attempt` (1-based): 1 unit, 2 units, ...
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_unit_ms.saturating_mul(u64::from(attempt.max(1)));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Runs `fetch` until `is_valid` accepts its payload or the attempts run out.
/// An `Err` counts the same as an invalid payload. `None` means exhausted; the
/// caller records a failure and moves on.
pub async fn fetch_with_retry<T, E, F, Fut, V>(
    policy: &RetryPolicy,
    subject: impl Display,
    mut fetch: F,
    is_valid: V,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    V: Fn(Option<&T>) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match fetch(attempt).await {
            Ok(payload) if is_valid(Some(&payload)) => {
                if attempt > 1 {
                    info!(%subject, attempt, "succeeded after retry");
                }
                return Some(payload);
            }
            Ok(_) => warn!(%subject, attempt, max_attempts, "payload failed validation"),
            Err(err) => warn!(%subject, attempt, max_attempts, error = %err, "fetch failed"),
        }
        if attempt < max_attempts {
            tokio::time::sleep(policy.delay_after_attempt(attempt)).await;
        }
    }
    warn!(%subject, max_attempts, "giving up");
    None
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paginated {
    pub items: Vec<JsonValue>,
    pub pages: u32,
    pub total: Option<u64>,
    /// A page could not be fetched and enumeration stopped early.
    pub interrupted: bool,
}

/// Cursor loop over a paginated source, pages numbered from 1. Stops on an
/// empty page, once the running count reaches the first positive total the
/// server reports, on a failed page, or after `max_pages`. Pauses between pages.
pub async fn paginate<F, Fut>(max_pages: u32, pause: Duration, mut fetch_page: F) -> Paginated
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<ListingPage>>,
{
    let mut out = Paginated::default();
    for page_no in 1..=max_pages {
        let Some(page) = fetch_page(page_no).await else {
            warn!(page = page_no, "page fetch failed; stopping enumeration");
            out.interrupted = true;
            break;
        };
        out.pages = page_no;
        if page.items.is_empty() {
            info!(page = page_no, "empty page; enumeration complete");
            break;
        }
        out.items.extend(page.items);
        if out.total.is_none() {
            out.total = page.total.filter(|t| *t > 0);
        }
        info!(page = page_no, fetched = out.items.len(), total = ?out.total, "page collected");
        if out.total.is_some_and(|t| out.items.len() as u64 >= t) {
            break;
        }
        if page_no < max_pages {
            tokio::time::sleep(pause).await;
        }
    }
    out
}
