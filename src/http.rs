//! Rate-limited HTTP client.
//!
//! All outbound traffic goes through [`RateLimitedClient`], which
//!
//! - paces requests through one shared [`RateLimiter`] so the aggregate rate
//!   stays under the configured ceiling no matter how many workers are active,
//! - widens the pacing interval multiplicatively on 429/5xx and on slow
//!   responses, and narrows it again as healthy responses come back,
//! - retries transient failures with exponential backoff and jitter, and
//!   surfaces everything else (404, other 4xx, malformed bodies) immediately.
//!
//! The wire itself sits behind the [`Transport`] trait; production uses
//! [`ReqwestTransport`].

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// User agent sent with every request
const USER_AGENT: &str = concat!("reviewharvest/", env!("CARGO_PKG_VERSION"));

/// Upper bound for the adaptive pacing interval
const MAX_PACING_INTERVAL: Duration = Duration::from_secs(30);

/// Longest response excerpt carried into error messages
const ERROR_EXCERPT_CHARS: usize = 200;

/// Where in the crawl a request was issued. Logged with every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub year: i32,
    pub invitation: String,
    pub offset: usize,
}

impl RequestContext {
    pub fn new(year: i32, invitation: impl Into<String>) -> Self {
        Self {
            year,
            invitation: invitation.into(),
            offset: 0,
        }
    }

    pub fn at_offset(&self, offset: usize) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "year={} invitation={} offset={}",
            self.year, self.invitation, self.offset
        )
    }
}

/// A fully built outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

/// Raw response as seen by the transport.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }
}

/// Moves one request over the wire. Implementations must not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpReply>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpReply> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.map_err(classify_send_error)?;

        Ok(HttpReply {
            status,
            body,
            retry_after,
        })
    }
}

fn classify_send_error(e: reqwest::Error) -> HarvestError {
    if e.is_timeout() || e.is_connect() || e.is_body() {
        HarvestError::TransientNetwork(e.to_string())
    } else {
        HarvestError::Network(e)
    }
}

/// Shared pacing state. Every request, from every worker, reserves a slot here.
pub struct RateLimiter {
    base_interval: Duration,
    max_interval: Duration,
    slow_response: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    next_slot: Instant,
    interval: Duration,
    latency_ewma: Option<Duration>,
}

impl RateLimiter {
    /// Create a limiter that admits at most `requests_per_second` requests.
    pub fn new(requests_per_second: f64, slow_response: Duration) -> Self {
        let base_interval = Duration::from_secs_f64(1.0 / requests_per_second.max(f64::EPSILON));
        Self {
            base_interval,
            max_interval: MAX_PACING_INTERVAL.max(base_interval),
            slow_response,
            state: Mutex::new(LimiterState {
                next_slot: Instant::now(),
                interval: base_interval,
                latency_ewma: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for the next free slot. Slots are handed out strictly one interval apart.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.lock();
            let now = Instant::now();
            let slot = state.next_slot.max(now);
            state.next_slot = slot + state.interval;
            slot - now
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Feed back a successful response and how long it took.
    pub fn record_success(&self, latency: Duration) {
        let mut state = self.lock();
        state.latency_ewma = Some(match state.latency_ewma {
            Some(prev) => prev.mul_f64(0.8) + latency.mul_f64(0.2),
            None => latency,
        });

        if latency >= self.slow_response {
            state.interval = state.interval.mul_f64(1.5).min(self.max_interval);
            debug!(
                latency_ms = latency.as_millis() as u64,
                interval_ms = state.interval.as_millis() as u64,
                "Slow response, widening pacing interval"
            );
        } else {
            state.interval = state.interval.mul_f64(0.9).max(self.base_interval);
        }
    }

    /// Feed back a 429/5xx. Doubles the interval and honours `Retry-After`.
    pub fn record_throttle(&self, retry_after: Option<Duration>) {
        let mut state = self.lock();
        state.interval = state.interval.saturating_mul(2).min(self.max_interval);
        if let Some(wait) = retry_after {
            let resume_at = Instant::now() + wait;
            if resume_at > state.next_slot {
                state.next_slot = resume_at;
            }
        }
        debug!(
            interval_ms = state.interval.as_millis() as u64,
            "Throttled, widening pacing interval"
        );
    }

    /// Current spacing between request slots
    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    /// Smoothed response latency, if any response has been seen
    pub fn latency(&self) -> Option<Duration> {
        self.lock().latency_ewma
    }
}

/// Bounded exponential backoff with equal jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`. Rate limits back off four times harder.
    pub fn delay_for(&self, attempt: u32, err: &HarvestError) -> Duration {
        let multiplier = if matches!(err, HarvestError::RateLimited(_)) {
            4
        } else {
            1
        };
        let ceiling = self
            .base_delay
            .saturating_mul(multiplier)
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);

        let half = ceiling / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        let delay = half + Duration::from_millis(jitter_ms);

        match err {
            HarvestError::RateLimited(secs) => delay.max(Duration::from_secs(*secs)),
            _ => delay,
        }
    }
}

/// JSON client that every API call goes through.
pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl RateLimitedClient {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            retry,
        }
    }

    /// Build the production client (reqwest transport, one limiter) from config.
    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        let limiter = RateLimiter::new(config.requests_per_second, config.slow_response);
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.base_backoff,
            max_delay: config.max_backoff,
        };
        Ok(Self::new(Arc::new(transport), Arc::new(limiter), retry))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// GET `url` with `query` appended and parse the JSON body.
    pub async fn get(
        &self,
        url: &Url,
        query: &[(&str, String)],
        bearer: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let mut url = url.clone();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let request = HttpRequest {
            method: Method::GET,
            url,
            bearer: bearer.map(str::to_string),
            body: None,
        };
        self.send(request, ctx).await
    }

    /// POST a JSON body and parse the JSON response.
    pub async fn post(
        &self,
        url: &Url,
        body: Value,
        bearer: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let request = HttpRequest {
            method: Method::POST,
            url: url.clone(),
            bearer: bearer.map(str::to_string),
            body: Some(body),
        };
        self.send(request, ctx).await
    }

    async fn send(&self, request: HttpRequest, ctx: &RequestContext) -> Result<Value> {
        let mut attempt = 0u32;

        loop {
            self.limiter.acquire().await;
            let started = Instant::now();
            let outcome = match self.transport.execute(&request).await {
                Ok(reply) => classify_reply(reply),
                Err(e) => Err(e),
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(value) => {
                    self.limiter.record_success(elapsed);
                    debug!(
                        year = ctx.year,
                        invitation = %ctx.invitation,
                        offset = ctx.offset,
                        url = %request.url,
                        attempt = attempt + 1,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Request succeeded"
                    );
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    let retry_after = match &err {
                        HarvestError::RateLimited(secs) if *secs > 0 => {
                            Some(Duration::from_secs(*secs))
                        }
                        _ => None,
                    };
                    self.limiter.record_throttle(retry_after);

                    if attempt >= self.retry.max_retries {
                        warn!(
                            year = ctx.year,
                            invitation = %ctx.invitation,
                            offset = ctx.offset,
                            url = %request.url,
                            attempts = attempt + 1,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(err);
                    }

                    let delay = self.retry.delay_for(attempt, &err);
                    warn!(
                        year = ctx.year,
                        invitation = %ctx.invitation,
                        offset = ctx.offset,
                        attempt = attempt + 1,
                        wait_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(
                        year = ctx.year,
                        invitation = %ctx.invitation,
                        offset = ctx.offset,
                        url = %request.url,
                        error = %err,
                        "Request failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Map an HTTP reply onto the error taxonomy.
fn classify_reply(reply: HttpReply) -> Result<Value> {
    match reply.status {
        200..=299 => serde_json::from_str(&reply.body)
            .map_err(|e| HarvestError::Parse(format!("Malformed JSON body: {}", e))),
        429 => Err(HarvestError::RateLimited(
            reply.retry_after.map(|d| d.as_secs()).unwrap_or(0),
        )),
        404 => Err(HarvestError::NotFound(excerpt(&reply.body))),
        500..=599 => Err(HarvestError::TransientNetwork(format!(
            "HTTP {}: {}",
            reply.status,
            excerpt(&reply.body)
        ))),
        code if is_not_found_body(&reply.body) => {
            debug!(status = code, "API reported NotFoundError");
            Err(HarvestError::NotFound(excerpt(&reply.body)))
        }
        code => Err(HarvestError::Api {
            code,
            message: excerpt(&reply.body),
        }),
    }
}

/// OpenReview reports unknown invitations as a 4xx with `{"name": "NotFoundError"}`.
fn is_not_found_body(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("name").and_then(Value::as_str).map(|n| n == "NotFoundError"))
        .unwrap_or(false)
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_EXCERPT_CHARS).collect()
}
