//! Rate limiting, on-disk response cache and the JSON HTTP client shared by every outbound API.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Method;

pub const CRATE_NAME: &str = "vsync-storage";

/// Spaces the start of outbound calls to one API.
///
/// Callers are admitted in submission order (the inner mutex is fair) and each
/// admission happens no sooner than `min_interval` after the previous one.
/// The wrapped work runs outside the lock, so its errors are returned as-is.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            name: name.into(),
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn run<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        self.admit().await;
        work.await
    }

    async fn admit(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                debug!(limiter = %self.name, wait_ms = (ready_at - Instant::now()).as_millis() as u64, "rate limited");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Normalized query signature: route plus query parameters sorted by name then value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    signature: String,
}

impl CacheKey {
    pub fn new(route: &str, params: &[(String, String)]) -> Self {
        let mut sorted = params.to_vec();
        sorted.sort();
        let query = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        Self {
            signature: format!("{}?{}", route.trim_end_matches('/'), query),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn digest(&self) -> String {
        sha256_hex(self.signature.as_bytes())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope<T> {
    signature: String,
    stored_at: DateTime<Utc>,
    body: T,
}

/// One JSON file per query signature; entries live until the same query rewrites them.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.json", key.digest()))
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> anyhow::Result<Option<T>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading cache entry {}", path.display()))
            }
        };

        match serde_json::from_slice::<CacheEnvelope<T>>(&bytes) {
            Ok(envelope) if envelope.signature == key.signature() => Ok(Some(envelope.body)),
            Ok(envelope) => {
                warn!(path = %path.display(), stored = %envelope.signature, "cache signature mismatch");
                Ok(None)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache entry ignored");
                Ok(None)
            }
        }
    }

    /// Replace the entry for `key` using a temp file and an atomic rename.
    pub async fn write<T: Serialize>(&self, key: &CacheKey, body: &T) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache directory {}", self.root.display()))?;

        let envelope = CacheEnvelope {
            signature: key.signature().to_string(),
            stored_at: Utc::now(),
            body,
        };
        let bytes = serde_json::to_vec(&envelope).context("serializing cache entry")?;
        let path = self.path_for(key);
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), signature = key.signature(), "cache entry written");
        Ok(path)
    }
}

/// Write `bytes` to `path` through a sibling temp file so readers never see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Methods whose effect is the same however many times the server applies them.
pub fn is_replay_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// A POST may already have been applied when it fails with 5xx or a timeout.
/// It is only resent when the server cannot have processed it: a 429 rejection
/// or a failure to connect.
fn may_retry_status(method: &Method, status: StatusCode) -> bool {
    classify_status(status) == RetryDisposition::Retryable
        && (is_replay_safe(method) || status == StatusCode::TOO_MANY_REQUESTS)
}

fn may_retry_error(method: &Method, err: &reqwest::Error) -> bool {
    classify_reqwest_error(err) == RetryDisposition::Retryable
        && (is_replay_safe(method) || err.is_connect())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// A server-provided `Retry-After` overrides the computed delay, still capped.
    pub fn delay_with_hint(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub backoff: BackoffPolicy,
    /// Honor `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
    pub system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
            default_headers: Vec::new(),
            backoff: BackoffPolicy::default(),
            system_proxy: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// JSON-over-HTTP client whose every attempt passes through one shared [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct JsonClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl JsonClient {
    pub fn new(config: HttpClientConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limiter,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        self.send_json::<(), T>(Method::GET, url, query, None).await
    }

    pub async fn send_json<B, T>(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&B>,
    ) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let (final_url, bytes) = self.send(method, url, query, body).await?;
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }

    /// Send a request and return the final URL with the raw success body.
    pub async fn send<B>(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&B>,
    ) -> Result<(String, Vec<u8>), FetchError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!("http_request", limiter = %self.limiter.name(), %method, url);
        self.send_with_retries(method, url, query, body)
            .instrument(span)
            .await
    }

    async fn send_with_retries<B>(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&B>,
    ) -> Result<(String, Vec<u8>), FetchError>
    where
        B: Serialize + ?Sized,
    {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.request(method.clone(), url).query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            match self.limiter.run(request.send()).await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return Ok((final_url, bytes.to_vec()));
                    }

                    if may_retry_status(&method, status) && attempt < self.backoff.max_retries {
                        let delay = self
                            .backoff
                            .delay_with_hint(attempt, retry_after(resp.headers()));
                        warn!(status = status.as_u16(), attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if may_retry_error(&method, &err) && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
