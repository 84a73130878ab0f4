//! Google Analytics Core Reporting API adapter
//!
//! Implements [`MetricsProvider`] over `GET {endpoint}/data/ga`, blocking on
//! a private single-threaded runtime so callers stay synchronous. The access
//! token is refreshed whenever it nears expiry, and once more when the API
//! rejects it.

use std::cell::RefCell;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Deserialize;

use crate::auth::{self, TokenFile};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

use super::{MetricsProvider, MetricsQuery, QueryPage};

/// Error reasons the API uses for rate limiting
const RATE_LIMIT_REASONS: &[&str] = &["quotaExceeded", "rateLimitExceeded", "userRateLimitExceeded"];

/// Response from GET /data/ga
#[derive(Debug, Deserialize)]
struct DataResponse {
    #[serde(default)]
    rows: Vec<Vec<String>>,
    #[serde(rename = "totalResults", default)]
    total_results: usize,
}

/// Error body returned by Google APIs
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

/// Current access token and where it is persisted.
struct Session {
    token: TokenFile,
    token_path: PathBuf,
    auth_header: HeaderValue,
}

/// Authenticated session against one analytics view.
pub struct GoogleAnalyticsProvider {
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    base_url: String,
    profile_id: String,
    session: RefCell<Session>,
}

impl GoogleAnalyticsProvider {
    /// Load the token file named in `config` and open a session.
    ///
    /// Fails with `AuthNotConfigured` before any network call when the token
    /// path or profile id is missing or the token file is unusable. An
    /// expired access token is refreshed and written back.
    pub fn connect(config: &ProviderConfig) -> Result<Self> {
        let token_path = config.token_file().ok_or_else(|| {
            Error::AuthNotConfigured(
                "provider.token_path must name the token file written by get-auth-token"
                    .to_string(),
            )
        })?;
        let profile_id = config
            .profile_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::AuthNotConfigured("provider.profile_id is not set".to_string())
            })?;
        let token = TokenFile::load(&token_path)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let provider = Self {
            session: RefCell::new(Session {
                auth_header: bearer(&token.access_token)?,
                token,
                token_path,
            }),
            http_client,
            runtime,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            profile_id,
        };
        provider.authorization()?;
        Ok(provider)
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Bearer header for the next request, refreshing an expiring token first.
    fn authorization(&self) -> Result<HeaderValue> {
        let mut session = self.session.borrow_mut();
        if session.token.needs_refresh(Utc::now()) {
            self.refresh(&mut session)?;
        }
        Ok(session.auth_header.clone())
    }

    /// Exchange the refresh token and write the new access token back.
    fn refresh(&self, session: &mut Session) -> Result<()> {
        self.runtime
            .block_on(auth::refresh(&self.http_client, &mut session.token))?;
        session.token.save(&session.token_path)?;
        session.auth_header = bearer(&session.token.access_token)?;
        Ok(())
    }

    async fn query_page(
        &self,
        query: &MetricsQuery,
        start_index: usize,
        max_results: usize,
        auth_header: HeaderValue,
    ) -> Result<QueryPage> {
        let url = format!("{}/data/ga", self.base_url);
        let params = query_params(&self.profile_id, query, start_index, max_results);

        let response = self
            .http_client
            .get(&url)
            .header(AUTHORIZATION, auth_header)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Provider {
                status: 0,
                message: format!("HTTP request failed: {}", e),
                transient: e.is_timeout() || e.is_connect() || e.is_request(),
            })?;

        let status = response.status();

        if status.is_success() {
            let data: DataResponse = response.json().await.map_err(|e| Error::Provider {
                status: status.as_u16(),
                message: format!("failed to parse response: {}", e),
                transient: false,
            })?;
            Ok(QueryPage {
                rows: data.rows,
                total_results: data.total_results,
            })
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(classify_failure(status.as_u16(), &body))
        }
    }
}

impl MetricsProvider for GoogleAnalyticsProvider {
    fn execute_query(
        &self,
        query: &MetricsQuery,
        start_index: usize,
        max_results: usize,
    ) -> Result<QueryPage> {
        let auth_header = self.authorization()?;
        match self
            .runtime
            .block_on(self.query_page(query, start_index, max_results, auth_header))
        {
            // Only a 401 maps to AuthNotConfigured here
            Err(Error::AuthNotConfigured(reason)) => {
                tracing::warn!(%reason, "Access token rejected, refreshing");
                let auth_header = {
                    let mut session = self.session.borrow_mut();
                    self.refresh(&mut session)?;
                    session.auth_header.clone()
                };
                self.runtime
                    .block_on(self.query_page(query, start_index, max_results, auth_header))
            }
            other => other,
        }
    }
}

fn bearer(access_token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {}", access_token))
        .map_err(|e| Error::AuthNotConfigured(format!("invalid access token: {}", e)))
}

/// Query string for one page of `query`.
fn query_params(
    profile_id: &str,
    query: &MetricsQuery,
    start_index: usize,
    max_results: usize,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("ids", format!("ga:{}", profile_id)),
        ("start-date", query.start_date.format("%Y-%m-%d").to_string()),
        ("end-date", query.end_date.format("%Y-%m-%d").to_string()),
        ("metrics", query.metrics.join(",")),
    ];
    if !query.dimensions.is_empty() {
        params.push(("dimensions", query.dimensions.join(",")));
    }
    if let Some(filters) = &query.filters {
        params.push(("filters", filters.clone()));
    }
    if let Some(sort) = &query.sort {
        params.push(("sort", sort.clone()));
    }
    params.push(("start-index", start_index.to_string()));
    params.push(("max-results", max_results.to_string()));
    params
}

/// Map a failed response to a provider error.
///
/// 5xx, 429 and rate-limit 403s are transient; 401 means the token is bad.
fn classify_failure(status: u16, body: &str) -> Error {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());
    let rate_limited = parsed
        .as_ref()
        .map(|b| {
            b.error
                .errors
                .iter()
                .any(|e| RATE_LIMIT_REASONS.contains(&e.reason.as_str()))
        })
        .unwrap_or(false);

    if status == 401 {
        return Error::AuthNotConfigured(format!("provider rejected the access token: {}", message));
    }

    Error::Provider {
        status,
        message,
        transient: status >= 500 || status == 429 || (status == 403 && rate_limited),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeGoogle {
        server: MockServer,
        runtime: tokio::runtime::Runtime,
        dir: TempDir,
    }

    impl FakeGoogle {
        fn start() -> Self {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let server = runtime.block_on(MockServer::start());
            Self {
                server,
                runtime,
                dir: TempDir::new().unwrap(),
            }
        }

        fn token_path(&self) -> PathBuf {
            self.dir.path().join("token.json")
        }

        fn write_token(&self, access_token: &str, expires_at: Option<DateTime<Utc>>) {
            TokenFile {
                access_token: access_token.to_string(),
                refresh_token: "1//refresh".to_string(),
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                token_uri: format!("{}/token", self.server.uri()),
                expires_at,
            }
            .save(&self.token_path())
            .unwrap();
        }

        fn config(&self) -> ProviderConfig {
            ProviderConfig {
                token_path: Some(self.token_path()),
                profile_id: Some("42".to_string()),
                endpoint: self.server.uri(),
                ..Default::default()
            }
        }

        fn mount(&self, mock: Mock) {
            self.runtime.block_on(mock.mount(&self.server));
        }

        fn grants_fresh_token(&self, times: u64) {
            self.mount(
                Mock::given(method("POST"))
                    .and(path("/token"))
                    .respond_with(
                        ResponseTemplate::new(200)
                            .set_body_json(json!({"access_token": "fresh", "expires_in": 3600})),
                    )
                    .expect(times),
            );
        }

        fn serves_rows_to(&self, bearer: &str) {
            self.mount(
                Mock::given(method("GET"))
                    .and(path("/data/ga"))
                    .and(header("authorization", format!("Bearer {bearer}").as_str()))
                    .respond_with(ResponseTemplate::new(200).set_body_json(
                        json!({"rows": [["/dataset/spend", "3"]], "totalResults": 1}),
                    )),
            );
        }

        fn rejects(&self, bearer: &str) {
            self.mount(
                Mock::given(method("GET"))
                    .and(path("/data/ga"))
                    .and(header("authorization", format!("Bearer {bearer}").as_str()))
                    .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials")),
            );
        }

        fn verify(&self) {
            self.runtime.block_on(self.server.verify());
        }
    }

    fn one_day() -> MetricsQuery {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        MetricsQuery::new(day, day, &["ga:pageviews"]).dimensions(&["ga:pagePath"])
    }

    #[test]
    fn test_expiring_token_is_refreshed_before_each_query() {
        let google = FakeGoogle::start();
        google.write_token("stale", Some(Utc::now() - chrono::Duration::hours(1)));
        google.grants_fresh_token(2);
        google.serves_rows_to("fresh");

        let provider = GoogleAnalyticsProvider::connect(&google.config()).unwrap();
        assert_eq!(TokenFile::load(&google.token_path()).unwrap().access_token, "fresh");

        // The token runs out partway through a long load
        provider.session.borrow_mut().token.expires_at =
            Some(Utc::now() - chrono::Duration::minutes(5));
        let page = provider.execute_query(&one_day(), 1, 1000).unwrap();

        assert_eq!(page.rows, vec![vec!["/dataset/spend".to_string(), "3".to_string()]]);
        google.verify();
    }

    #[test]
    fn test_rejected_token_is_refreshed_once_and_retried() {
        let google = FakeGoogle::start();
        google.write_token("revoked", None);
        google.grants_fresh_token(1);
        google.rejects("revoked");
        google.serves_rows_to("fresh");

        let provider = GoogleAnalyticsProvider::connect(&google.config()).unwrap();
        let page = provider.execute_query(&one_day(), 1, 1000).unwrap();

        assert_eq!(page.total_results, 1);
        google.verify();
    }

    #[test]
    fn test_token_rejected_after_refresh_is_auth_error() {
        let google = FakeGoogle::start();
        google.write_token("revoked", None);
        google.grants_fresh_token(1);
        google.rejects("revoked");
        google.rejects("fresh");

        let provider = GoogleAnalyticsProvider::connect(&google.config()).unwrap();
        let err = provider.execute_query(&one_day(), 1, 1000).unwrap_err();

        assert!(matches!(err, Error::AuthNotConfigured(_)));
        assert!(err.is_fatal());
        google.verify();
    }

    #[test]
    fn test_connect_requires_token_path() {
        let config = ProviderConfig {
            profile_id: Some("123".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            GoogleAnalyticsProvider::connect(&config),
            Err(Error::AuthNotConfigured(_))
        ));
    }

    #[test]
    fn test_connect_requires_profile_id() {
        let config = ProviderConfig {
            token_path: Some(PathBuf::from("/nonexistent/token.json")),
            ..Default::default()
        };
        assert!(matches!(
            GoogleAnalyticsProvider::connect(&config),
            Err(Error::AuthNotConfigured(_))
        ));
    }

    #[test]
    fn test_connect_with_missing_token_file() {
        let config = ProviderConfig {
            token_path: Some(PathBuf::from("/nonexistent/token.json")),
            profile_id: Some("123".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            GoogleAnalyticsProvider::connect(&config),
            Err(Error::AuthNotConfigured(_))
        ));
    }

    #[test]
    fn test_query_params() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let query = MetricsQuery::new(day, end, &["ga:pageviews", "ga:visits"])
            .dimensions(&["ga:pagePath"])
            .filters("ga:pagePath=~^/dataset/")
            .sort("-ga:pageviews");

        let params = query_params("42", &query, 1001, 1000);
        assert_eq!(
            params,
            vec![
                ("ids", "ga:42".to_string()),
                ("start-date", "2024-01-01".to_string()),
                ("end-date", "2024-01-31".to_string()),
                ("metrics", "ga:pageviews,ga:visits".to_string()),
                ("dimensions", "ga:pagePath".to_string()),
                ("filters", "ga:pagePath=~^/dataset/".to_string()),
                ("sort", "-ga:pageviews".to_string()),
                ("start-index", "1001".to_string()),
                ("max-results", "1000".to_string()),
            ]
        );
    }

    #[test]
    fn test_classify_failure() {
        assert!(classify_failure(503, "backend error").is_transient());
        assert!(classify_failure(429, "").is_transient());

        let quota = r#"{"error": {"code": 403, "message": "Quota Error",
            "errors": [{"reason": "userRateLimitExceeded"}]}}"#;
        let err = classify_failure(403, quota);
        assert!(err.is_transient());
        assert!(err.to_string().contains("Quota Error"));

        let forbidden = r#"{"error": {"code": 403, "message": "No access",
            "errors": [{"reason": "insufficientPermissions"}]}}"#;
        assert!(!classify_failure(403, forbidden).is_transient());
        assert!(!classify_failure(400, "bad").is_transient());
        assert!(matches!(
            classify_failure(401, "expired"),
            Error::AuthNotConfigured(_)
        ));
    }

    #[test]
    fn test_parse_data_response_without_rows() {
        let data: DataResponse = serde_json::from_str(r#"{"totalResults": 0}"#).unwrap();
        assert!(data.rows.is_empty());
        assert_eq!(data.total_results, 0);
    }
}
