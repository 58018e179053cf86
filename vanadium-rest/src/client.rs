//! Discord REST request pipeline.

use crate::error::{flatten_errors, ApiErrorBody, RestError};
use crate::multipart::{build_form, FileAttachment};
use crate::ratelimit::RateLimiter;
use crate::routes::{Gateway, GatewayBot, RouteKey};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Discord REST API version this pipeline speaks.
pub const REST_VERSION: u8 = 10;

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// User agent for requests.
const USER_AGENT_VALUE: &str = concat!(
    "DiscordBot (https://github.com/vanadium-rs/vanadium, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Tuning knobs for the request pipeline.
#[derive(Debug, Clone)]
pub struct RestOptions {
    /// API base URL, without a trailing slash.
    pub base_url: String,

    /// Per-attempt request timeout.
    pub request_timeout: Duration,

    /// Retries for transport failures and 5xx responses.
    pub retry_limit: u32,

    /// Clock-skew compensation added to computed rate-limit resets.
    pub ratelimiter_offset: Duration,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            retry_limit: 3,
            ratelimiter_offset: Duration::ZERO,
        }
    }
}

/// Per-request options.
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// JSON body (becomes `payload_json` when files are present).
    pub body: Option<Value>,

    /// File attachments; a non-empty list switches to multipart.
    pub files: Vec<FileAttachment>,

    /// Audit-log reason, sent percent-encoded in `X-Audit-Log-Reason`.
    pub reason: Option<String>,

    /// Whether to attach the Authorization header. Defaults on via
    /// [`RequestOptions::new`].
    pub auth: bool,

    /// Query string pairs.
    pub query: Vec<(String, String)>,

    /// Priority requests bypass the global rate-limit gate.
    pub priority: bool,

    /// Spread the JSON body as flat form fields instead of
    /// `payload_json` (legacy emoji/sticker endpoints).
    pub flat_files: bool,
}

impl RequestOptions {
    /// Authenticated request with no body.
    pub fn new() -> Self {
        Self {
            auth: true,
            ..Self::default()
        }
    }

    /// Authenticated request with a JSON body.
    pub fn json(body: Value) -> Self {
        Self {
            body: Some(body),
            auth: true,
            ..Self::default()
        }
    }

    /// Set the audit-log reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach files.
    pub fn with_files(mut self, files: Vec<FileAttachment>) -> Self {
        self.files = files;
        self
    }

    /// Append a query pair.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// Discord REST API client.
///
/// One instance per token; cheap to share behind an `Arc`. All requests
/// flow through the rate limiter, which serializes traffic per bucket and
/// schedules from the previous response's headers.
pub struct RestClient {
    client: Client,
    token: String,
    options: RestOptions,
    limiter: RateLimiter,
}

impl RestClient {
    /// Create a client with default options.
    pub fn new(token: impl Into<String>) -> Result<Self, RestError> {
        Self::with_options(token, RestOptions::default())
    }

    /// Create a client with explicit options.
    pub fn with_options(token: impl Into<String>, options: RestOptions) -> Result<Self, RestError> {
        let token = normalize_token(token.into());

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            client,
            token,
            limiter: RateLimiter::new(options.ratelimiter_offset),
            options,
        })
    }

    /// The normalized token, including its `Bot `/`Bearer ` prefix.
    pub fn token(&self) -> &str {
        &self.token
    }

    // =========================================================================
    // Gateway endpoints (consumed by the shard manager)
    // =========================================================================

    /// `GET /gateway/bot`: shard count, gateway URL, and session limits.
    pub async fn get_gateway_bot(&self) -> Result<GatewayBot, RestError> {
        let value = self.request(Method::GET, "/gateway/bot", RequestOptions::new()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `GET /gateway`: the unauthenticated gateway URL.
    pub async fn get_gateway(&self) -> Result<Gateway, RestError> {
        let value = self
            .request(Method::GET, "/gateway", RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    // =========================================================================
    // The request primitive
    // =========================================================================

    /// Perform a request against the Discord API.
    ///
    /// `path` is relative to the API base (e.g.
    /// `/channels/123/messages`). The returned value is the parsed JSON
    /// response body, or `Value::Null` for empty (204) responses.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        opts: RequestOptions,
    ) -> Result<Value, RestError> {
        let key = RouteKey::classify(method.clone(), path);
        let url = format!("{}{}", self.options.base_url, path);
        let mut attempts: u32 = 0;

        loop {
            // Re-resolve each try: the first response may alias this
            // route onto a shared bucket hash.
            let bucket = self.limiter.bucket(&key);
            let turn = self.limiter.acquire(&bucket, opts.priority).await;

            let request = self.build_request(&method, &url, &opts)?;

            debug!(method = %method, route = %key.bucket, major = %key.major, "dispatching request");

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    drop(turn);
                    attempts += 1;
                    if attempts > self.options.retry_limit {
                        return Err(if err.is_timeout() {
                            RestError::Timeout { attempts }
                        } else {
                            RestError::Network { attempts, source: err }
                        });
                    }
                    let backoff = retry_backoff(attempts);
                    warn!(error = %err, attempt = attempts, backoff_ms = backoff.as_millis() as u64, "transport error, retrying");
                    sleep(backoff).await;
                    continue;
                }
            };

            let status = response.status();
            let headers = response.headers().clone();
            let scope = headers
                .get("x-ratelimit-scope")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            // Shared-scope 429s belong to a limit shared with other
            // bots; recording them would poison our own bucket state.
            let shared_429 = status == StatusCode::TOO_MANY_REQUESTS && scope == "shared";
            if !shared_429 {
                self.limiter.record(&key, &headers);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after_of(&headers, &response_body_json(response).await);
                let global = scope == "global"
                    || headers
                        .get("x-ratelimit-global")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

                drop(turn);
                if global {
                    self.limiter.set_global(retry_after);
                } else {
                    warn!(
                        route = %key.bucket,
                        shared = shared_429,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "rate limited"
                    );
                    sleep(retry_after).await;
                }
                continue;
            }

            if status.is_server_error() {
                drop(turn);
                attempts += 1;
                if attempts > self.options.retry_limit {
                    return Err(RestError::Http {
                        status: status.as_u16(),
                        method: method.to_string(),
                        path: path.to_string(),
                    });
                }
                let backoff = retry_backoff(attempts);
                warn!(status = status.as_u16(), attempt = attempts, "server error, retrying");
                sleep(backoff).await;
                continue;
            }

            let body = response.bytes().await.unwrap_or_default();
            drop(turn);

            if status.is_success() {
                if body.is_empty() {
                    return Ok(Value::Null);
                }
                return Ok(serde_json::from_slice(&body)?);
            }

            return Err(classify_failure(&method, path, status, &headers, &body));
        }
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        opts: &RequestOptions,
    ) -> Result<reqwest::RequestBuilder, RestError> {
        let mut request = self.client.request(method.clone(), url);

        if !opts.query.is_empty() {
            request = request.query(&opts.query);
        }

        if opts.auth {
            request = request.header(AUTHORIZATION, HeaderValue::from_str(&self.token)?);
        }

        if let Some(reason) = &opts.reason {
            let encoded = utf8_percent_encode(reason, NON_ALPHANUMERIC).to_string();
            request = request.header("X-Audit-Log-Reason", HeaderValue::from_str(&encoded)?);
        }

        if !opts.files.is_empty() {
            let form = build_form(&opts.files, opts.body.as_ref(), opts.flat_files)?;
            request = request.multipart(form);
        } else if let Some(body) = &opts.body {
            request = request.json(body);
        }

        Ok(request)
    }
}

/// Prefix a bare token with `Bot `; pass prefixed tokens through.
fn normalize_token(token: String) -> String {
    let trimmed = token.trim();
    if trimmed.starts_with("Bot ") || trimmed.starts_with("Bearer ") {
        trimmed.to_string()
    } else {
        format!("Bot {trimmed}")
    }
}

/// Exponential backoff for transport retries.
fn retry_backoff(attempt: u32) -> Duration {
    let ms = 500u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(ms.min(15_000))
}

/// Pull the retry delay from `Retry-After` or the 429 body.
fn retry_after_of(headers: &HeaderMap, body: &Value) -> Duration {
    if let Some(seconds) = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        return Duration::from_secs_f64(seconds.max(0.0));
    }
    if let Some(seconds) = body.get("retry_after").and_then(|v| v.as_f64()) {
        return Duration::from_secs_f64(seconds.max(0.0));
    }
    Duration::from_secs(5)
}

async fn response_body_json(response: Response) -> Value {
    match response.bytes().await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}

/// Turn a non-2xx terminal response into the matching error.
fn classify_failure(
    method: &Method,
    path: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> RestError {
    if let Ok(api) = serde_json::from_slice::<ApiErrorBody>(body) {
        let errors = api
            .errors
            .as_ref()
            .map(flatten_errors)
            .unwrap_or_default();
        let headers: HashMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        return RestError::Api {
            status: status.as_u16(),
            code: api.code,
            message: api.message,
            errors,
            headers,
        };
    }

    RestError::Http {
        status: status.as_u16(),
        method: method.to_string(),
        path: path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_normalization() {
        assert_eq!(normalize_token("abc".into()), "Bot abc");
        assert_eq!(normalize_token("Bot abc".into()), "Bot abc");
        assert_eq!(normalize_token("Bearer abc".into()), "Bearer abc");
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_millis(500));
        assert_eq!(retry_backoff(2), Duration::from_millis(1000));
        assert_eq!(retry_backoff(3), Duration::from_millis(2000));
        assert_eq!(retry_backoff(10), Duration::from_millis(15_000));
    }

    #[test]
    fn retry_after_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("2.5"));
        let body = serde_json::json!({"retry_after": 9.0});
        assert_eq!(retry_after_of(&headers, &body), Duration::from_secs_f64(2.5));
        assert_eq!(
            retry_after_of(&HeaderMap::new(), &body),
            Duration::from_secs_f64(9.0)
        );
    }

    #[test]
    fn classify_failure_flattens_api_errors() {
        let body = serde_json::json!({
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {"content": {"_errors": [{"code": "x", "message": "too long"}]}}
        });
        let err = classify_failure(
            &Method::POST,
            "/channels/1/messages",
            StatusCode::BAD_REQUEST,
            &HeaderMap::new(),
            body.to_string().as_bytes(),
        );
        match err {
            RestError::Api { status, code, errors, .. } => {
                assert_eq!(status, 400);
                assert_eq!(code, 50035);
                assert_eq!(errors, vec![("content".to_string(), "too long".to_string())]);
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn classify_failure_without_json_body() {
        let err = classify_failure(
            &Method::GET,
            "/gateway",
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            b"<html>bad gateway</html>",
        );
        assert!(matches!(err, RestError::Http { status: 502, .. }));
    }
}
