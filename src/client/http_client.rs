//! Resilient HTTP client for the upstream JSON:API service
//!
//! Features:
//! - Global concurrent request limiting via semaphore
//! - Per-host minimum interval between requests
//! - Per-path rate limit tracking from response headers
//! - Retry with exponential backoff, honoring `Retry-After`
//! - In-flight deduplication of identical GET requests
//! - Cursor paging over `links.next`

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::query::ApiQuery;
use super::rate_limit::RateLimitTracker;
use super::retry::RetryManager;
use crate::config::ApiConfig;
use crate::error::ApiError;

const EXCERPT_CHARS: usize = 200;

type SharedResponse = Shared<BoxFuture<'static, Result<Arc<Value>, ApiError>>>;

/// Every resource object of a listing, across all pages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    /// Primary resource objects in received order
    pub data: Vec<Value>,

    /// Related resource objects requested via `include`
    pub included: Vec<Value>,

    /// Pages fetched
    pub pages: usize,
}

/// Client for the upstream API
///
/// Cheap to clone; clones share the connection pool, rate limit state and
/// in-flight request map.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    config: ApiConfig,
    base_url: Url,
    semaphore: Semaphore,
    last_request: Mutex<HashMap<String, Instant>>,
    tracker: RateLimitTracker,
    retry: RetryManager,
    in_flight: StdMutex<HashMap<String, SharedResponse>>,
}

impl ApiClient {
    /// Create a client from configuration
    ///
    /// Fails if the API key is missing or a header value is malformed.
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("missing API key".to_string()))?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("{} {}", config.auth_scheme, api_key))
            .map_err(|e| ApiError::InvalidRequest(format!("invalid API key: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&config.accept)
                .map_err(|e| ApiError::InvalidRequest(format!("invalid accept header: {}", e)))?,
        );
        headers.insert(
            "revision",
            HeaderValue::from_str(&config.revision)
                .map_err(|e| ApiError::InvalidRequest(format!("invalid revision: {}", e)))?,
        );

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {}", e)))?;

        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid base URL '{}': {}", base, e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                semaphore: Semaphore::new(config.rate_limit.max_concurrent.max(1)),
                last_request: Mutex::new(HashMap::new()),
                tracker: RateLimitTracker::new(config.rate_limit.clone()),
                retry: RetryManager::new(config.retry.clone()),
                in_flight: StdMutex::new(HashMap::new()),
                base_url,
                config,
            }),
        })
    }

    /// GET `path` (relative to the base URL) with the given query
    ///
    /// Identical concurrent requests share a single network call.
    pub async fn request(&self, path: &str, query: &ApiQuery) -> Result<Arc<Value>, ApiError> {
        query.validate()?;
        let mut url = self.resolve(path)?;
        let pairs = query.to_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        self.get_json(url).await
    }

    /// GET every page of a listing, following `links.next`
    ///
    /// A 404 on the first page means there is nothing to list and yields an
    /// empty collection.
    pub async fn fetch_all(&self, path: &str, query: &ApiQuery) -> Result<Collection, ApiError> {
        let first = match self.request(path, query).await {
            Ok(body) => body,
            Err(ApiError::NotFound) => {
                debug!(path = %path, "Listing not found, treating as empty");
                return Ok(Collection::default());
            }
            Err(err) => return Err(err),
        };

        let mut collection = Collection::default();
        let mut seen = HashSet::new();
        let mut next = append_page(&mut collection, &first)?;

        while let Some(link) = next {
            if collection.pages >= self.inner.config.max_pages {
                warn!(
                    path = %path,
                    max_pages = self.inner.config.max_pages,
                    "Page limit reached, stopping pagination"
                );
                break;
            }
            if !seen.insert(link.clone()) {
                warn!(path = %path, next = %link, "Repeated next link, stopping pagination");
                break;
            }

            let url = self.resolve_next(&link)?;
            let body = self.get_json(url).await?;
            next = append_page(&mut collection, &body)?;
        }

        debug!(
            path = %path,
            pages = collection.pages,
            records = collection.data.len(),
            "Fetched listing"
        );
        Ok(collection)
    }

    /// Rate limit state shared by every request of this client
    pub fn tracker(&self) -> &RateLimitTracker {
        &self.inner.tracker
    }

    /// Number of distinct requests currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    fn resolve(&self, path: &str) -> Result<Url, ApiError> {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            return Err(ApiError::InvalidRequest("empty request path".to_string()));
        }
        self.inner
            .base_url
            .join(relative)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid path '{}': {}", path, e)))
    }

    /// Next links must point back at the configured API origin
    fn resolve_next(&self, link: &str) -> Result<Url, ApiError> {
        let url = self
            .inner
            .base_url
            .join(link)
            .map_err(|e| ApiError::InvalidData(format!("invalid next link '{}': {}", link, e)))?;
        if url.origin() != self.inner.base_url.origin() {
            return Err(ApiError::InvalidData(format!(
                "next link '{}' leaves the API origin",
                link
            )));
        }
        Ok(url)
    }

    /// Deduplicated GET
    async fn get_json(&self, url: Url) -> Result<Arc<Value>, ApiError> {
        let key = canonical_key(&url);

        let shared = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(key = %key, "Joining in-flight request");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let task_key = key.clone();
                    // Runs to completion even if every caller goes away. The
                    // map lock is held until the entry is inserted, so the
                    // task's removal always happens after insertion.
                    let handle = tokio::spawn(async move {
                        let _guard = InFlightGuard {
                            inner: inner.clone(),
                            key: task_key,
                        };
                        inner.fetch_with_retry(&url).await
                    });
                    let shared = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(ApiError::Network(format!("request task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }
}

/// Removes the in-flight entry when the request settles, including on panic
struct InFlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl Inner {
    async fn fetch_with_retry(&self, url: &Url) -> Result<Arc<Value>, ApiError> {
        self.retry
            .execute(|| self.send_once(url))
            .await
            .map(Arc::new)
    }

    async fn send_once(&self, url: &Url) -> Result<Value, ApiError> {
        let path = url.path();

        let delay = self.tracker.compute_delay(path);
        if !delay.is_zero() {
            debug!(path = %path, wait_ms = delay.as_millis() as u64, "Waiting for rate limit reset");
            tokio::time::sleep(delay).await;
        }

        // Acquire semaphore permit to limit concurrent requests
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ApiError::Network("request semaphore closed".to_string()))?;

        self.wait_for_min_interval(url).await;

        debug!(url = %url, "Sending HTTP GET request");

        let response = self.http.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::NetworkTimeout
            } else if e.is_connect() {
                ApiError::ConnectionRefused
            } else {
                ApiError::Network(e.to_string())
            }
        })?;

        self.tracker.record_response_headers(path, response.headers());

        match response.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(self.config.rate_limit.rate_limit_wait_secs);
                self.tracker
                    .record_retry_after(path, Duration::from_secs(wait));

                warn!(url = %url, retry_after = wait, "Rate limited by upstream");
                return Err(ApiError::RateLimited(wait));
            }
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "Resource not found (404)");
                return Err(ApiError::NotFound);
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(url = %url, status = ?response.status(), "Unauthorized");
                return Err(ApiError::Unauthorized);
            }
            status if status.is_server_error() => {
                warn!(url = %url, status = status.as_u16(), "Server error");
                return Err(ApiError::ServerError(status.as_u16()));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(url = %url, status = status.as_u16(), "Request rejected");
                return Err(ApiError::ClientError {
                    status: status.as_u16(),
                    body: excerpt(&body),
                });
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !is_json_content_type(&content_type) {
            let text = String::from_utf8_lossy(&body);
            warn!(url = %url, content_type = %content_type, "Expected JSON response");
            return Err(ApiError::NonJsonResponse {
                content_type,
                excerpt: excerpt(&text),
            });
        }

        debug!(url = %url, body_size = body.len(), "Received response");

        serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidData(format!("malformed JSON body: {}", e)))
    }

    /// Wait for the minimum interval to pass for the given URL's host
    async fn wait_for_min_interval(&self, url: &Url) {
        let min_interval = Duration::from_millis(self.config.rate_limit.min_interval_ms);
        if min_interval.is_zero() {
            return;
        }
        let host = host_key(url);

        let mut last_requests = self.last_request.lock().await;

        if let Some(last) = last_requests.get(&host) {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!(host = %host, wait_ms = wait_time.as_millis() as u64, "Waiting for request interval");
                drop(last_requests); // Release lock while waiting
                tokio::time::sleep(wait_time).await;
                last_requests = self.last_request.lock().await;
            }
        }

        last_requests.insert(host, Instant::now());
    }
}

/// Append one page's resources and return its next link
fn append_page(collection: &mut Collection, body: &Value) -> Result<Option<String>, ApiError> {
    match body.get("data") {
        Some(Value::Array(items)) => collection.data.extend(items.iter().cloned()),
        Some(Value::Null) => {}
        Some(item @ Value::Object(_)) => collection.data.push(item.clone()),
        Some(_) => {
            return Err(ApiError::InvalidData(
                "top-level 'data' is neither an array nor an object".to_string(),
            ))
        }
        None => {
            return Err(ApiError::InvalidData(
                "response has no top-level 'data'".to_string(),
            ))
        }
    }
    if let Some(Value::Array(included)) = body.get("included") {
        collection.included.extend(included.iter().cloned());
    }
    collection.pages += 1;

    Ok(body
        .pointer("/links/next")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

/// Method plus URL with query pairs sorted by key then value
fn canonical_key(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut key = format!("GET {}://{}{}", url.scheme(), host_key(url), url.path());
    if !pairs.is_empty() {
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        key.push('?');
        key.push_str(&query.join("&"));
    }
    key
}

fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

fn excerpt(body: &str) -> String {
    body.chars().take(EXCERPT_CHARS).collect()
}
