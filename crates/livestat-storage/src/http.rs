use std::time::Duration;

use anyhow::Context;
use livestat_core::{RawPayload, SessionCredentials};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, USER_AGENT};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Used only when the session credentials carry no user-agent of their own.
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://channels.weixin.qq.com".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "errCode")]
    err_code: Option<i64>,
    #[serde(rename = "errMsg", default)]
    err_msg: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

/// POST-with-envelope client sharing one set of session credentials.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: HttpClientConfig, credentials: &SessionCredentials) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &credentials.headers {
            let parsed = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            );
            match parsed {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping session header that is not valid HTTP"),
            }
        }
        let cookies: Vec<String> = credentials
            .cookies
            .iter()
            .filter_map(|(name, value)| {
                let pair = format!("{name}={value}");
                if HeaderValue::from_str(&pair).is_ok() {
                    Some(pair)
                } else {
                    warn!(cookie = %name, "skipping session cookie that is not valid HTTP");
                    None
                }
            })
            .collect();
        if !cookies.is_empty() {
            let value = HeaderValue::from_str(&cookies.join("; ")).context("encoding cookie header")?;
            headers.insert(COOKIE, value);
        }
        if !headers.contains_key(USER_AGENT) {
            if let Some(user_agent) = &config.user_agent {
                let value = HeaderValue::from_str(user_agent).context("encoding user-agent")?;
                headers.insert(USER_AGENT, value);
            }
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Posts `payload` and unwraps the `{errCode, errMsg, data}` envelope.
    /// Success is `errCode == 0`; anything else is an error.
    pub async fn post_envelope(
        &self,
        path: &str,
        payload: &JsonValue,
    ) -> Result<RawPayload, FetchError> {
        let url = self.endpoint_url(path);
        let resp = self.client.post(&url).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        match envelope.err_code {
            Some(0) => {
                debug!(%url, "api call succeeded");
                Ok(envelope.data.unwrap_or(JsonValue::Null))
            }
            Some(code) => Err(FetchError::Api {
                code,
                message: envelope.err_msg.unwrap_or_default(),
            }),
            None => Err(FetchError::Decode {
                url,
                reason: "envelope has no errCode".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, credentials: &SessionCredentials) -> ApiClient {
        ApiClient::new(
            HttpClientConfig {
                base_url: server.uri(),
                timeout: Duration::from_secs(2),
                user_agent: Some("livestat-test".to_string()),
            },
            credentials,
        )
        .expect("client")
    }

    #[tokio::test]
    async fn success_envelope_returns_data_and_sends_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/live/get_live_history"))
            .and(header("cookie", "sessionid=abc"))
            .and(header("user-agent", "livestat-test"))
            .and(body_partial_json(json!({"currentPage": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errCode": 0,
                "errMsg": "ok",
                "data": {"totalLiveCount": 1, "liveObjectList": [{"liveObjectId": "1"}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut creds = SessionCredentials::empty();
        creds.cookies.insert("sessionid".into(), "abc".into());
        let client = client_for(&server, &creds);
        let data = client
            .post_envelope("/live/get_live_history", &json!({"currentPage": 1}))
            .await
            .expect("data");
        assert_eq!(data["totalLiveCount"], 1);
    }

    #[tokio::test]
    async fn malformed_cookie_is_dropped_and_the_rest_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("cookie", "sessionid=abc; lang=zh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errCode": 0, "data": {"ok": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut creds = SessionCredentials::empty();
        creds.cookies.insert("sessionid".into(), "abc".into());
        creds.cookies.insert("broken".into(), "line\nbreak".into());
        creds.cookies.insert("lang".into(), "zh".into());
        let client = client_for(&server, &creds);
        let data = client.post_envelope("x", &json!({})).await.expect("data");
        assert_eq!(data["ok"], true);
    }

    #[tokio::test]
    async fn nonzero_err_code_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errCode": 300334,
                "errMsg": "login expired"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, &SessionCredentials::empty());
        let err = client.post_envelope("x", &json!({})).await.unwrap_err();
        match err {
            FetchError::Api { code, message } => {
                assert_eq!(code, 300334);
                assert_eq!(message, "login expired");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_and_malformed_body_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, &SessionCredentials::empty());
        assert!(matches!(
            client.post_envelope("/down", &json!({})).await,
            Err(FetchError::HttpStatus { status: 503, .. })
        ));
        assert!(matches!(
            client.post_envelope("/garbage", &json!({})).await,
            Err(FetchError::Decode { .. })
        ));
    }

    #[test]
    fn endpoint_url_joins_relative_and_keeps_absolute() {
        let client = ApiClient::new(
            HttpClientConfig {
                base_url: "https://example.test/".to_string(),
                ..Default::default()
            },
            &SessionCredentials::empty(),
        )
        .expect("client");
        assert_eq!(client.endpoint_url("/a"), "https://example.test/a");
        assert_eq!(client.endpoint_url("a"), "https://example.test/a");
        assert_eq!(client.endpoint_url("http://other/x"), "http://other/x");
    }
}
