//! Shared HTTP fetch layer.
//!
//! One reqwest client serves every monitor. Fetches are keyed by
//! normalized URL: concurrent requests for the same page collapse into a
//! single network round trip whose outcome every waiter shares, and a
//! completed result keeps answering for thirty seconds. Each outbound
//! request passes the host's circuit breaker, takes a governor token,
//! waits a short randomized delay, and carries headers from a rotating
//! browser-signature pool. A per-host cookie jar and a 24-hour robots.txt
//! cache ride along.
//!
//! The manager owns the breaker registry. Network-level failures are
//! recorded here; content-level verdicts arrive from the caller after
//! fingerprinting, via [`RequestManager::confirm_content`] (real page) or
//! [`RequestManager::note_block_page`] (challenge page).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use sitewatch_governor::TokenBucket;

use crate::breaker::{BreakerCounts, BreakerView, CircuitRegistry, COOLDOWN_SECONDS, Transition};
use crate::error::WatchError;
use crate::types::CircuitState;

/// Hard wall-clock bound on any single fetch, body included.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a completed result keeps answering collapsed callers.
pub const RESULT_CACHE_AGE: Duration = Duration::from_secs(30);

/// robots.txt cache lifetime.
pub const ROBOTS_TTL_HOURS: i64 = 24;

/// A successful fetch, shared among collapsed waiters.
#[derive(Debug, Clone)]
pub struct FetchSuccess {
    pub status: u16,
    pub body: Arc<String>,
    pub fetched_at: DateTime<Utc>,
}

/// What a fetch resolves to; cloneable so one round trip serves many callers.
pub type FetchOutcome = Result<FetchSuccess, WatchError>;

/// Emitted once whenever a host's breaker transitions to OPEN, so the chat
/// layer can tell affected users their monitors are cooling down.
#[derive(Debug, Clone)]
pub struct CooldownEvent {
    pub host: String,
    pub retry_after_seconds: u64,
}

/// Knobs for the fetch layer. Defaults are the production values; tests
/// shrink the delays.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub fetch_timeout: Duration,
    pub result_cache_age: Duration,
    /// Bounds of the uniform random pre-request delay.
    pub min_pre_delay: Duration,
    pub max_pre_delay: Duration,
    /// Whether robots.txt `Disallow` rules are honoured.
    pub respect_robots: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: FETCH_TIMEOUT,
            result_cache_age: RESULT_CACHE_AGE,
            min_pre_delay: Duration::from_secs(1),
            max_pre_delay: Duration::from_secs(5),
            respect_robots: true,
        }
    }
}

/// Lowercase scheme and host, drop the fragment, strip tracking keys
/// (`utm_*`, `fbclid`, `gclid`), and re-encode the remaining query sorted
/// lexicographically. Path case is preserved.
pub fn normalize_url(raw: &str) -> Result<String, WatchError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| WatchError::ConfigInvalid(format!("invalid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WatchError::ConfigInvalid(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_key(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url.query_pairs_mut();
        serializer.clear();
        serializer.extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(url.to_string())
}

fn is_tracking_key(key: &str) -> bool {
    key.starts_with("utm_") || key == "fbclid" || key == "gclid"
}

/// The circuit-breaker key for a normalized URL: `scheme://authority`.
pub fn host_key(normalized_url: &str) -> Option<String> {
    let url = Url::parse(normalized_url).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

struct BrowserSignature {
    user_agent: &'static str,
    accept: &'static str,
    accept_language: &'static str,
    sec_ch_ua: Option<&'static str>,
    sec_ch_ua_platform: Option<&'static str>,
}

const SIGNATURES: &[BrowserSignature] = &[
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        accept_language: "en-US,en;q=0.9",
        sec_ch_ua: Some("\"Chromium\";v=\"126\", \"Google Chrome\";v=\"126\", \"Not.A/Brand\";v=\"8\""),
        sec_ch_ua_platform: Some("\"Windows\""),
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        accept_language: "en-US,en;q=0.8",
        sec_ch_ua: Some("\"Chromium\";v=\"126\", \"Google Chrome\";v=\"126\", \"Not.A/Brand\";v=\"8\""),
        sec_ch_ua_platform: Some("\"macOS\""),
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        accept_language: "en-US,en;q=0.5",
        sec_ch_ua: None,
        sec_ch_ua_platform: None,
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                     (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        accept_language: "en-GB,en;q=0.9",
        sec_ch_ua: None,
        sec_ch_ua_platform: None,
    },
];

impl BrowserSignature {
    fn headers(&self, host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(self.user_agent));
        headers.insert(header::ACCEPT, HeaderValue::from_static(self.accept));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static(self.accept_language),
        );
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        if let Some(value) = self.sec_ch_ua {
            headers.insert(
                HeaderName::from_static("sec-ch-ua"),
                HeaderValue::from_static(value),
            );
            headers.insert(
                HeaderName::from_static("sec-ch-ua-mobile"),
                HeaderValue::from_static("?0"),
            );
        }
        if let Some(value) = self.sec_ch_ua_platform {
            headers.insert(
                HeaderName::from_static("sec-ch-ua-platform"),
                HeaderValue::from_static(value),
            );
        }
        if let Ok(referer) = HeaderValue::from_str(&format!("{host}/")) {
            headers.insert(header::REFERER, referer);
        }
        headers
    }
}

struct RobotsEntry {
    disallow: Vec<String>,
    fetched_at: DateTime<Utc>,
}

struct Inner {
    client: reqwest::Client,
    options: RequestOptions,
    tokens: TokenBucket,
    breakers: Mutex<CircuitRegistry>,
    pending: Mutex<HashMap<String, watch::Receiver<Option<FetchOutcome>>>>,
    cache: Mutex<HashMap<String, (FetchOutcome, Instant)>>,
    robots: Mutex<HashMap<String, RobotsEntry>>,
    cooldown_tx: mpsc::UnboundedSender<CooldownEvent>,
}

/// The single HTTP client facade. Cheap to clone.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<Inner>,
}

impl RequestManager {
    /// Build the manager and its cooldown event stream.
    ///
    /// Must be called from within a tokio runtime (the governor spawns its
    /// refill task).
    pub fn new(options: RequestOptions) -> Result<(Self, mpsc::UnboundedReceiver<CooldownEvent>)> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("failed to build HTTP client")?;
        let (cooldown_tx, cooldown_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                client,
                options,
                tokens: TokenBucket::for_fetches(),
                breakers: Mutex::new(CircuitRegistry::new()),
                pending: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                robots: Mutex::new(HashMap::new()),
                cooldown_tx,
            }),
        };
        Ok((manager, cooldown_rx))
    }

    /// Fetch a normalized URL, collapsing with any identical in-flight or
    /// recently completed request.
    pub async fn fetch(&self, normalized_url: &str) -> FetchOutcome {
        enum Role {
            Waiter(watch::Receiver<Option<FetchOutcome>>),
            Owner(watch::Sender<Option<FetchOutcome>>),
        }

        let role = {
            let mut pending = self.inner.pending.lock().expect("pending mutex");
            if let Some(rx) = pending.get(normalized_url) {
                Role::Waiter(rx.clone())
            } else {
                let mut cache = self.inner.cache.lock().expect("cache mutex");
                if let Some((outcome, at)) = cache.get(normalized_url) {
                    if at.elapsed() < self.inner.options.result_cache_age {
                        return outcome.clone();
                    }
                    cache.remove(normalized_url);
                }
                let (tx, rx) = watch::channel(None);
                pending.insert(normalized_url.to_string(), rx);
                Role::Owner(tx)
            }
        };

        match role {
            Role::Waiter(rx) => await_shared(rx).await,
            Role::Owner(tx) => {
                let inner = Arc::clone(&self.inner);
                let url = normalized_url.to_string();
                // One transient task per in-flight request: the fetch
                // completes and wakes every waiter even if this caller is
                // cancelled mid-await.
                let task = tokio::spawn(async move {
                    let outcome = perform(&inner, &url).await;
                    inner
                        .cache
                        .lock()
                        .expect("cache mutex")
                        .insert(url.clone(), (outcome.clone(), Instant::now()));
                    inner.pending.lock().expect("pending mutex").remove(&url);
                    let _ = tx.send(Some(outcome.clone()));
                    outcome
                });
                match task.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(WatchError::Network("fetch task failed".to_string())),
                }
            }
        }
    }

    /// Record that a fetched body turned out to be real content. Closes a
    /// half-open probe and resets the host's failure streak.
    pub fn confirm_content(&self, normalized_url: &str) {
        if let Some(host) = host_key(normalized_url) {
            self.inner
                .breakers
                .lock()
                .expect("breaker mutex")
                .record_success(&host);
        }
    }

    /// Record that a fetched body was a block page; counts as a breaker
    /// failure for the host.
    pub fn note_block_page(&self, normalized_url: &str) {
        if let Some(host) = host_key(normalized_url) {
            let transition = self
                .inner
                .breakers
                .lock()
                .expect("breaker mutex")
                .record_failure(&host, Utc::now());
            self.emit_cooldown(&host, transition);
        }
    }

    /// Current breaker view for a host, for persistence into monitor metadata.
    pub fn breaker_view(&self, host: &str) -> BreakerView {
        self.inner.breakers.lock().expect("breaker mutex").view(host)
    }

    /// Seed a breaker from persisted metadata at boot.
    pub fn restore_breaker(
        &self,
        host: &str,
        state: CircuitState,
        consecutive_failures: u32,
        opened_at: Option<DateTime<Utc>>,
    ) {
        self.inner
            .breakers
            .lock()
            .expect("breaker mutex")
            .restore(host, state, consecutive_failures, opened_at);
    }

    /// Hosts per breaker state, for the health snapshot.
    pub fn breaker_counts(&self) -> BreakerCounts {
        self.inner.breakers.lock().expect("breaker mutex").counts()
    }

    /// Stop the governor; in-flight acquires fail and fetches wind down.
    pub fn close(&self) {
        self.inner.tokens.close();
    }

    fn emit_cooldown(&self, host: &str, transition: Transition) {
        emit_cooldown(&self.inner, host, transition);
    }
}

async fn await_shared(mut rx: watch::Receiver<Option<FetchOutcome>>) -> FetchOutcome {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(WatchError::Network("fetch task dropped".to_string()));
        }
    }
}

async fn perform(inner: &Arc<Inner>, normalized_url: &str) -> FetchOutcome {
    let url = Url::parse(normalized_url)
        .map_err(|e| WatchError::Network(format!("unparseable normalized URL: {e}")))?;
    let host = host_key(normalized_url)
        .ok_or_else(|| WatchError::Network("URL has no host".to_string()))?;

    inner
        .breakers
        .lock()
        .expect("breaker mutex")
        .permit(&host, Utc::now())?;

    if inner.options.respect_robots && !robots_allows(inner, &host, url.path()).await {
        return Err(WatchError::PolicyBlocked);
    }

    inner
        .tokens
        .acquire()
        .await
        .map_err(|e| WatchError::Network(e.to_string()))?;

    let delay = pre_request_delay(&inner.options);
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }

    let signature = SIGNATURES
        .choose(&mut rand::rng())
        .unwrap_or(&SIGNATURES[0]);
    let headers = signature.headers(&host);

    let outcome = match tokio::time::timeout(
        inner.options.fetch_timeout,
        do_request(inner, url, headers),
    )
    .await
    {
        Ok(outcome) => outcome,
        // The elapsed timeout drops the request future, cancelling the
        // underlying connection.
        Err(_) => Err(WatchError::FetchTimeout(
            inner.options.fetch_timeout.as_secs(),
        )),
    };

    if let Err(err) = &outcome {
        if err.counts_as_breaker_failure() {
            let transition = inner
                .breakers
                .lock()
                .expect("breaker mutex")
                .record_failure(&host, Utc::now());
            emit_cooldown(inner, &host, transition);
        }
    }
    // Success is recorded only after the caller confirms the body is real
    // content (confirm_content) rather than a block page.
    outcome
}

fn pre_request_delay(options: &RequestOptions) -> Duration {
    if options.max_pre_delay <= options.min_pre_delay {
        return options.min_pre_delay;
    }
    let span = options.max_pre_delay - options.min_pre_delay;
    let offset = rand::rng().random_range(0..=span.as_millis() as u64);
    options.min_pre_delay + Duration::from_millis(offset)
}

async fn do_request(inner: &Arc<Inner>, url: Url, headers: HeaderMap) -> FetchOutcome {
    let response = inner
        .client
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(WatchError::HttpStatus(status));
    }
    let body = response.text().await.map_err(map_reqwest_error)?;
    Ok(FetchSuccess {
        status,
        body: Arc::new(body),
        fetched_at: Utc::now(),
    })
}

fn map_reqwest_error(err: reqwest::Error) -> WatchError {
    if err.is_timeout() {
        WatchError::FetchTimeout(FETCH_TIMEOUT.as_secs())
    } else {
        WatchError::Network(err.to_string())
    }
}

fn emit_cooldown(inner: &Arc<Inner>, host: &str, transition: Transition) {
    if matches!(transition, Transition::Opened | Transition::Reopened) {
        let _ = inner.cooldown_tx.send(CooldownEvent {
            host: host.to_string(),
            retry_after_seconds: COOLDOWN_SECONDS as u64,
        });
    }
}

/// Whether robots rules (cached up to 24 h) allow fetching `path` on `host`.
/// Fetch errors and missing robots fail open.
async fn robots_allows(inner: &Arc<Inner>, host: &str, path: &str) -> bool {
    let now = Utc::now();
    {
        let robots = inner.robots.lock().expect("robots mutex");
        if let Some(entry) = robots.get(host) {
            if now - entry.fetched_at < chrono::Duration::hours(ROBOTS_TTL_HOURS) {
                return is_allowed(&entry.disallow, path);
            }
        }
    }

    let disallow = fetch_robots(inner, host).await.unwrap_or_default();
    let allowed = is_allowed(&disallow, path);
    inner.robots.lock().expect("robots mutex").insert(
        host.to_string(),
        RobotsEntry {
            disallow,
            fetched_at: now,
        },
    );
    allowed
}

async fn fetch_robots(inner: &Arc<Inner>, host: &str) -> Option<Vec<String>> {
    let url = format!("{host}/robots.txt");
    let response = tokio::time::timeout(inner.options.fetch_timeout, inner.client.get(&url).send())
        .await
        .ok()?
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body = response.text().await.ok()?;
    Some(parse_robots(&body, SIGNATURES[0].user_agent))
}

/// Collect `Disallow` prefixes from the groups that apply to our
/// user-agent family (`*`, or a token our UA string contains).
fn parse_robots(body: &str, user_agent: &str) -> Vec<String> {
    let ua_lower = user_agent.to_lowercase();
    let mut rules = Vec::new();
    let mut group_applies = false;
    let mut reading_group_header = false;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match field.trim().to_lowercase().as_str() {
            "user-agent" => {
                let token = value.to_lowercase();
                let applies = token == "*" || ua_lower.contains(&token);
                if reading_group_header {
                    group_applies |= applies;
                } else {
                    group_applies = applies;
                }
                reading_group_header = true;
            }
            "disallow" => {
                reading_group_header = false;
                if group_applies && !value.is_empty() {
                    rules.push(value.to_string());
                }
            }
            _ => {
                reading_group_header = false;
            }
        }
    }
    rules
}

fn is_allowed(disallow: &[String], path: &str) -> bool {
    !disallow.iter().any(|prefix| path.starts_with(prefix.as_str()))
}
