//! HTTP request executor.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so any library
//! (or an in-process loopback) can carry the requests. GET responses for
//! documents and compare-exchange values go through the shared
//! [`HttpCache`] with conditional requests.

use crate::config::{DocumentConventions, RetryConfig};
use crate::error::{ClientError, ClientResult};
use crate::executor::{RequestExecutor, SessionInfo};
use crate::http_cache::{HttpCache, NOT_FOUND_CHANGE_VECTOR};
use bytes::Bytes;
use docstore_protocol::{
    BatchRequest, BatchResponse, GetCompareExchangeValuesResponse, GetDocumentsResponse,
    HiLoResult, HiLoReturnRequest, NextHiLoRequest, OperationState, ServerErrorBody,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body, if any.
    pub body: Option<Bytes>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// A received response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response without headers.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP client abstraction.
///
/// An `Err` means the request never produced a response (connection
/// refused, timeout); it is treated as retryable.
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Header carrying the session id.
pub const SESSION_ID_HEADER: &str = "Session-Id";

/// [`RequestExecutor`] that talks to a server over HTTP.
pub struct HttpRequestExecutor<C: HttpClient> {
    base_url: String,
    database: String,
    client: C,
    cache: Arc<HttpCache>,
    retry: RetryConfig,
    timeout: Duration,
    max_ids_per_get: usize,
    aggressive_cache: Option<Duration>,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
    requests_sent: AtomicU64,
}

impl<C: HttpClient> HttpRequestExecutor<C> {
    /// Creates an executor for `database` at `base_url`.
    pub fn new(base_url: impl Into<String>, database: impl Into<String>, client: C) -> Self {
        let defaults = DocumentConventions::default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: database.into(),
            client,
            cache: Arc::new(HttpCache::new()),
            retry: defaults.retry,
            timeout: defaults.request_timeout,
            max_ids_per_get: defaults.max_ids_to_catch,
            aggressive_cache: None,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
            requests_sent: AtomicU64::new(0),
        }
    }

    /// Takes retry policy, timeout and id batching from `conventions`.
    pub fn with_conventions(mut self, conventions: &DocumentConventions) -> Self {
        self.retry = conventions.retry.clone();
        self.timeout = conventions.request_timeout;
        self.max_ids_per_get = conventions.max_ids_to_catch.max(1);
        self
    }

    /// Shares `cache` with other executors or change subscriptions.
    pub fn with_cache(mut self, cache: Arc<HttpCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Serves cached GETs without asking the server while the entry is
    /// younger than `duration` and its generation is current.
    pub fn with_aggressive_caching(mut self, duration: Duration) -> Self {
        self.aggressive_cache = Some(duration);
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the response cache.
    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.cache
    }

    /// Returns the number of requests that reached the client.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns `true` while the last request reached the server.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/databases/{}/{}", self.base_url, self.database, path)
    }

    fn query(path: &str, params: &[(&str, String)]) -> String {
        let mut url = path.to_string();
        for (position, (name, value)) in params.iter().enumerate() {
            url.push(if position == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    fn request(&self, method: Method, url: String) -> HttpRequest {
        HttpRequest {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: self.timeout,
        }
    }

    /// Sends with retry on transport errors and retryable statuses.
    fn send(&self, request: &HttpRequest) -> ClientResult<HttpResponse> {
        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts.max(1) {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt);
                debug!(url = %request.url, attempt, ?delay, "retrying request");
                std::thread::sleep(delay);
            }

            match self.send_once(request) {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if error.is_retryable() && attempt + 1 < self.retry.max_attempts {
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::Protocol("no request attempts made".into())))
    }

    fn send_once(&self, request: &HttpRequest) -> ClientResult<HttpResponse> {
        trace!(method = ?request.method, url = %request.url, "sending request");
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        let response = self.client.send(request).map_err(|message| {
            warn!(url = %request.url, error = %message, "request failed");
            *self.last_error.write() = Some(message.clone());
            self.connected.store(false, Ordering::SeqCst);
            ClientError::transport_retryable(message)
        })?;
        self.connected.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;

        match response.status {
            200..=299 | 304 | 404 => Ok(response),
            status => Err(status_error(status, &response.body)),
        }
    }

    fn send_json<T: DeserializeOwned>(&self, request: &HttpRequest) -> ClientResult<T> {
        let response = self.send(request)?;
        if response.status == 404 {
            return Err(ClientError::ServerError(format!(
                "{} returned 404",
                request.url
            )));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// GET through the cache. Returns `None` for a 404.
    fn cached_get(
        &self,
        url: String,
        session: Option<&SessionInfo>,
    ) -> ClientResult<Option<Bytes>> {
        let lookup = self.cache.get(&url);
        if let (Some(window), true) = (self.aggressive_cache, lookup.handle.is_hit()) {
            if !lookup.handle.might_have_been_modified() && lookup.handle.age() < window {
                trace!(url = %url, "served from cache without revalidation");
                return Ok(lookup.payload);
            }
        }

        let mut request = self.request(Method::Get, url.clone());
        add_session_header(&mut request, session);
        if let Some(change_vector) = &lookup.change_vector {
            if change_vector != NOT_FOUND_CHANGE_VECTOR {
                request
                    .headers
                    .push(("If-None-Match".into(), format!("\"{change_vector}\"")));
            }
        }

        let response = self.send(&request)?;
        match response.status {
            304 => {
                trace!(url = %url, "not modified");
                lookup.handle.not_modified();
                Ok(lookup.payload)
            }
            404 => {
                self.cache.set_not_found(url);
                Ok(None)
            }
            _ => {
                if let Some(etag) = response.header("ETag") {
                    self.cache
                        .set(url, etag.trim_matches('"'), response.body.clone());
                }
                Ok(Some(response.body))
            }
        }
    }
}

fn add_session_header(request: &mut HttpRequest, session: Option<&SessionInfo>) {
    if let Some(session) = session {
        request
            .headers
            .push((SESSION_ID_HEADER.into(), session.session_id.to_string()));
    }
}

/// Maps a failed status to an error.
fn status_error(status: u16, body: &[u8]) -> ClientError {
    let parsed = serde_json::from_slice::<ServerErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .map(|error| error.message.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

    match status {
        409 => ClientError::concurrency(message, parsed.map(|error| error.ids).unwrap_or_default()),
        408 | 429 | 500..=599 => ClientError::transport_retryable(format!("{status}: {message}")),
        _ => ClientError::ServerError(format!("{status}: {message}")),
    }
}

impl<C: HttpClient> RequestExecutor for HttpRequestExecutor<C> {
    fn database(&self) -> &str {
        &self.database
    }

    fn batch(
        &self,
        request: &BatchRequest,
        session: Option<&SessionInfo>,
    ) -> ClientResult<BatchResponse> {
        let mut http = self.request(Method::Post, self.url("bulk_docs"));
        add_session_header(&mut http, session);
        http.headers
            .push(("Content-Type".into(), "application/json".into()));
        http.body = Some(Bytes::from(serde_json::to_vec(request)?));
        self.send_json(&http)
    }

    fn get_documents(
        &self,
        ids: &[String],
        session: Option<&SessionInfo>,
    ) -> ClientResult<GetDocumentsResponse> {
        let mut response = GetDocumentsResponse::default();
        for chunk in ids.chunks(self.max_ids_per_get) {
            let params: Vec<(&str, String)> =
                chunk.iter().map(|id| ("id", id.clone())).collect();
            let url = self.url(&Self::query("docs", &params));
            match self.cached_get(url, session)? {
                Some(body) => {
                    let part: GetDocumentsResponse = serde_json::from_slice(&body)?;
                    response.results.extend(part.results);
                }
                None => response.results.extend(std::iter::repeat(None).take(chunk.len())),
            }
        }
        Ok(response)
    }

    fn get_compare_exchange_values(
        &self,
        keys: &[String],
        session: Option<&SessionInfo>,
    ) -> ClientResult<GetCompareExchangeValuesResponse> {
        if keys.is_empty() {
            return Ok(GetCompareExchangeValuesResponse::default());
        }
        let params: Vec<(&str, String)> = keys.iter().map(|key| ("key", key.clone())).collect();
        let url = self.url(&Self::query("cmpxchg", &params));
        match self.cached_get(url, session)? {
            Some(body) => Ok(serde_json::from_slice(&body)?),
            None => Ok(GetCompareExchangeValuesResponse::default()),
        }
    }

    fn next_hilo(&self, request: &NextHiLoRequest) -> ClientResult<HiLoResult> {
        let mut params = vec![
            ("tag", request.tag.clone()),
            ("lastBatchSize", request.last_batch_size.to_string()),
            ("lastMax", request.last_max.to_string()),
            (
                "identityPartsSeparator",
                request.identity_parts_separator.to_string(),
            ),
        ];
        if let Some(last_range_at) = &request.last_range_at {
            params.push(("lastRangeAt", last_range_at.clone()));
        }
        let http = self.request(Method::Get, self.url(&Self::query("hilo/next", &params)));
        self.send_json(&http)
    }

    fn return_hilo(&self, request: &HiLoReturnRequest) -> ClientResult<()> {
        let params = [
            ("tag", request.tag.clone()),
            ("end", request.end.to_string()),
            ("last", request.last.to_string()),
        ];
        let http = self.request(Method::Put, self.url(&Self::query("hilo/return", &params)));
        self.send(&http).map(|_| ())
    }

    fn get_operation_state(&self, id: i64) -> ClientResult<OperationState> {
        let params = [("id", id.to_string())];
        let http = self.request(
            Method::Get,
            self.url(&Self::query("operations/state", &params)),
        );
        self.send_json(&http)
    }
}

impl<C: HttpClient> fmt::Debug for HttpRequestExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequestExecutor")
            .field("base_url", &self.base_url)
            .field("database", &self.database)
            .field("cache", &self.cache)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}
