use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use livestat_adapters::{BrowserConfig, Endpoints, FetchStrategy, PageWait};
use livestat_core::{fields, SessionCredentials, SourceKind, TimeWindow};
use livestat_storage::{timestamped_path, HttpClientConfig};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "livestat.yaml";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    pub list_page_ms: u64,
    pub target_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            list_page_ms: 1_000,
            target_ms: 5_000,
        }
    }
}

impl Pacing {
    pub fn list_page(&self) -> Duration {
        Duration::from_millis(self.list_page_ms)
    }

    pub fn target(&self) -> Duration {
        Duration::from_millis(self.target_ms)
    }
}

/// Workbook file names per source, relative to `output_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputNames {
    pub listing: String,
    pub reservation: String,
    pub product_table: String,
    pub spu: String,
    pub conversion: String,
    pub diagnostic: String,
}

impl Default for OutputNames {
    fn default() -> Self {
        Self {
            listing: "live_list.xlsx".to_string(),
            reservation: "reservations.xlsx".to_string(),
            product_table: "products.xlsx".to_string(),
            spu: "spu_sales.xlsx".to_string(),
            conversion: "conversion.xlsx".to_string(),
            diagnostic: "diagnostic.xlsx".to_string(),
        }
    }
}

impl OutputNames {
    pub fn for_source(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Listing => &self.listing,
            SourceKind::Reservation => &self.reservation,
            SourceKind::ProductTable => &self.product_table,
            SourceKind::Spu => &self.spu,
            SourceKind::Conversion => &self.conversion,
            SourceKind::Diagnostic => &self.diagnostic,
        }
    }
}

/// Immutable per-run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub base_url: String,
    pub endpoints: Endpoints,
    /// Overrides `base_url` + `endpoints.login_page`.
    pub login_url: Option<String>,
    pub browser: BrowserConfig,
    pub output_dir: PathBuf,
    pub outputs: OutputNames,
    /// Upstream identifier source for drill-downs; defaults to the listing output.
    pub listing_file: Option<PathBuf>,
    pub id_field: String,
    /// Fixed window; when absent the last `window_days` days ending now.
    pub time_window: Option<TimeWindow>,
    pub window_days: i64,
    pub page_size: u32,
    pub max_pages: u32,
    pub retry: RetryPolicy,
    pub pacing: Pacing,
    pub checkpoint_every: usize,
    pub page_wait: PageWait,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reservation_strategy: FetchStrategy,
    /// Used when the browser profile yields no cookies.
    pub seed_credentials: SessionCredentials,
    /// Process only the first N identifiers.
    pub limit: Option<usize>,
    /// Suffix drill-down outputs with `_YYYYMMDDHHMMSS`.
    pub timestamp_outputs: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: "https://channels.weixin.qq.com".to_string(),
            endpoints: Endpoints::default(),
            login_url: None,
            browser: BrowserConfig::default(),
            output_dir: PathBuf::from("."),
            outputs: OutputNames::default(),
            listing_file: None,
            id_field: fields::LIVE_OBJECT_ID.to_string(),
            time_window: None,
            window_days: 183,
            page_size: 50,
            max_pages: 1_000,
            retry: RetryPolicy::default(),
            pacing: Pacing::default(),
            checkpoint_every: 50,
            page_wait: PageWait::default(),
            http_timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            reservation_strategy: FetchStrategy::Browser,
            seed_credentials: SessionCredentials::empty(),
            limit: None,
            timestamp_outputs: true,
        }
    }
}

impl RunConfig {
    /// Reads `path` (or `livestat.yaml` in the working directory when present),
    /// then applies `LIVESTAT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("LIVESTAT_PROFILE_DIR") {
            self.browser.profile_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LIVESTAT_WEBDRIVER_URL") {
            self.browser.webdriver_url = v;
        }
        if let Some(v) = lookup("LIVESTAT_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("LIVESTAT_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LIVESTAT_FINDER_ID") {
            self.endpoints.finder_id = v;
        }
        if let Some(v) = lookup("LIVESTAT_HEADLESS") {
            self.browser.headless = match v.trim() {
                "1" | "true" | "TRUE" | "True" | "yes" => true,
                "0" | "false" | "FALSE" | "False" | "no" => false,
                other => anyhow::bail!("LIVESTAT_HEADLESS must be true or false, got {other:?}"),
            };
        }
        Ok(())
    }

    pub fn time_window_at(&self, now: DateTime<Utc>) -> TimeWindow {
        self.time_window
            .unwrap_or_else(|| TimeWindow::last_days(self.window_days, now))
    }

    pub fn listing_path(&self) -> PathBuf {
        self.listing_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join(&self.outputs.listing))
    }

    /// Destination for `kind`. The listing output keeps a stable name since
    /// drill-downs read it back.
    pub fn output_path(&self, kind: SourceKind, now: DateTime<Local>) -> PathBuf {
        if kind == SourceKind::Listing {
            return self.listing_path();
        }
        let path = self.output_dir.join(self.outputs.for_source(kind));
        if self.timestamp_outputs {
            timestamped_path(&path, now.naive_local())
        } else {
            path
        }
    }

    pub fn login_url(&self) -> String {
        self.login_url.clone().unwrap_or_else(|| {
            format!(
                "{}{}",
                self.base_url.trim_end_matches('/'),
                self.endpoints.login_page
            )
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = RunConfig::default();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pacing.target(), Duration::from_secs(5));
        assert_eq!(config.checkpoint_every, 50);
        assert_eq!(config.id_field, "liveObjectId");
        assert_eq!(config.login_url(), "https://channels.weixin.qq.com/platform/login");
    }

    #[test]
    fn yaml_overrides_only_what_it_names() {
        let config = RunConfig::from_yaml(
            r#"
page_size: 20
limit: 10
retry:
  max_attempts: 5
endpoints:
  finder_id: "v2_x@finder"
browser:
  profile_dir: /data/profile
reservation_strategy: api
"#,
        )
        .expect("parse");
        assert_eq!(config.page_size, 20);
        assert_eq!(config.limit, Some(10));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_unit_ms, 1_000);
        assert_eq!(config.endpoints.finder_id, "v2_x@finder");
        assert_eq!(config.endpoints.scene, 7);
        assert_eq!(config.browser.profile_dir, PathBuf::from("/data/profile"));
        assert_eq!(config.reservation_strategy, FetchStrategy::Api);
        assert_eq!(config.max_pages, 1_000);
        assert!(RunConfig::from_yaml("").is_ok());
    }

    #[test]
    fn env_overrides_apply_and_reject_bad_bool() {
        let env: HashMap<&str, &str> = [
            ("LIVESTAT_PROFILE_DIR", "/p"),
            ("LIVESTAT_OUTPUT_DIR", "/out"),
            ("LIVESTAT_HEADLESS", "false"),
            ("LIVESTAT_FINDER_ID", "fid"),
        ]
        .into_iter()
        .collect();
        let mut config = RunConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.browser.profile_dir, PathBuf::from("/p"));
        assert!(!config.browser.headless);
        assert_eq!(config.endpoints.finder_id, "fid");
        assert_eq!(config.listing_path(), PathBuf::from("/out/live_list.xlsx"));

        let mut bad = RunConfig::default();
        assert!(bad
            .apply_overrides(|k| (k == "LIVESTAT_HEADLESS").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn drill_down_outputs_are_timestamped_listing_is_not() {
        let config = RunConfig {
            output_dir: PathBuf::from("/out"),
            ..Default::default()
        };
        let now = Local.with_ymd_and_hms(2025, 6, 1, 8, 9, 10).single().unwrap();
        assert_eq!(
            config.output_path(SourceKind::Reservation, now),
            PathBuf::from("/out/reservations_20250601080910.xlsx")
        );
        assert_eq!(
            config.output_path(SourceKind::Listing, now),
            PathBuf::from("/out/live_list.xlsx")
        );
        let plain = RunConfig {
            timestamp_outputs: false,
            ..config
        };
        assert_eq!(
            plain.output_path(SourceKind::Spu, now),
            PathBuf::from("/out/spu_sales.xlsx")
        );
    }

    #[test]
    fn default_window_spans_configured_days() {
        let config = RunConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).single().unwrap();
        let window = config.time_window_at(now);
        assert_eq!(window.end, now);
        assert_eq!(window.end_unix() - window.start_unix(), 183 * 86_400);
    }
}
