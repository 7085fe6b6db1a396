//! HTTP pipeline handlers
//!
//! - `LoggingHandler`: request/response tracing
//! - `MetricsHandler`: request, failure and latency counters
//! - `CircuitBreakerHandler`: fails fast while the target's breaker is open
//! - `RetryHandler`: re-runs the rest of the chain on transient failures
//! - `ApiKeyHandler`: injects an API key header
//! - `SendHttpRequestHandler`: terminal handler performing the reqwest call

use async_trait::async_trait;
use dashmap::DashMap;
use grid_core::metrics::CounterRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::breaker::{
    CircuitBreaker, CircuitBreakerPolicy, CircuitBreakerSettings, DefaultTripReasonAuthority,
    RequestOutcome, TripReasonAuthority,
};
use crate::error::{ClientError, Result};
use crate::http::{HttpRequest, HttpResponse};
use crate::pipeline::{ExecutionContext, Next, PipelineHandler};

type HttpContext = ExecutionContext<HttpRequest, HttpResponse>;
type HttpNext<'a> = Next<'a, HttpRequest, HttpResponse>;

// =============================================================================
// Logging
// =============================================================================

/// Logs each request and its outcome
pub struct LoggingHandler;

#[async_trait]
impl PipelineHandler<HttpRequest, HttpResponse> for LoggingHandler {
    async fn invoke(&self, context: &mut HttpContext, next: HttpNext<'_>) -> Result<()> {
        let started = Instant::now();
        let method = context.input.method.clone();
        let url = context.input.url.clone();

        debug!("{} {}", method, url);

        let result = next.run(context).await;
        match (&result, &context.output) {
            (Ok(()), Some(response)) => debug!(
                "{} {} -> {} in {:?}",
                method,
                url,
                response.status,
                started.elapsed()
            ),
            (Ok(()), None) => debug!("{} {} -> no response in {:?}", method, url, started.elapsed()),
            (Err(e), _) => warn!("{} {} failed after {:?}: {}", method, url, started.elapsed(), e),
        }

        result
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Records `{prefix}.Requests`, `{prefix}.Failures` and `{prefix}.LatencyMs`
pub struct MetricsHandler {
    registry: Arc<dyn CounterRegistry>,
    prefix: String,
}

impl MetricsHandler {
    pub fn new(registry: Arc<dyn CounterRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl PipelineHandler<HttpRequest, HttpResponse> for MetricsHandler {
    async fn invoke(&self, context: &mut HttpContext, next: HttpNext<'_>) -> Result<()> {
        let started = Instant::now();
        self.registry
            .increment(&format!("{}.Requests", self.prefix));

        let result = next.run(context).await;

        let failed = match (&result, &context.output) {
            (Err(_), _) => true,
            (Ok(()), Some(response)) => response.status >= 500,
            (Ok(()), None) => false,
        };
        if failed {
            self.registry
                .increment(&format!("{}.Failures", self.prefix));
        }
        self.registry.record_value(
            &format!("{}.LatencyMs", self.prefix),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        result
    }
}

// =============================================================================
// Circuit Breaking
// =============================================================================

/// Key used for the single policy of a whole-client provider
pub const WHOLE_CLIENT_KEY: &str = "__WholeClient";

/// Granularity of circuit breaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerScope {
    /// One breaker for every request of the client
    WholeClient,
    /// One breaker per URL path
    PerEndpoint,
}

/// Hands out circuit breaker policies for a client, created on first use
pub struct CircuitBreakerProvider {
    client_name: String,
    scope: BreakerScope,
    settings: CircuitBreakerSettings,
    authority: Arc<dyn TripReasonAuthority>,
    policies: DashMap<String, Arc<CircuitBreakerPolicy>>,
}

impl CircuitBreakerProvider {
    pub fn new(
        client_name: impl Into<String>,
        scope: BreakerScope,
        settings: CircuitBreakerSettings,
    ) -> Self {
        Self::with_authority(
            client_name,
            scope,
            settings,
            Arc::new(DefaultTripReasonAuthority),
        )
    }

    pub fn with_authority(
        client_name: impl Into<String>,
        scope: BreakerScope,
        settings: CircuitBreakerSettings,
        authority: Arc<dyn TripReasonAuthority>,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            scope,
            settings,
            authority,
            policies: DashMap::new(),
        }
    }

    fn key_for(&self, url: &str) -> String {
        match self.scope {
            BreakerScope::WholeClient => WHOLE_CLIENT_KEY.to_string(),
            BreakerScope::PerEndpoint => reqwest::Url::parse(url)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| url.to_string()),
        }
    }

    /// Policy guarding requests to `url`
    pub fn policy_for(&self, url: &str) -> Arc<CircuitBreakerPolicy> {
        let key = self.key_for(url);
        self.policies
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreakerPolicy::from_breaker(
                    CircuitBreaker::new(format!("{}{}", self.client_name, key), self.settings),
                    self.authority.clone(),
                ))
            })
            .clone()
    }

    /// Every policy created so far
    pub fn policies(&self) -> Vec<Arc<CircuitBreakerPolicy>> {
        self.policies.iter().map(|e| e.value().clone()).collect()
    }
}

/// Rejects requests while the target's breaker is open
pub struct CircuitBreakerHandler {
    provider: Arc<CircuitBreakerProvider>,
}

impl CircuitBreakerHandler {
    pub fn new(provider: Arc<CircuitBreakerProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl PipelineHandler<HttpRequest, HttpResponse> for CircuitBreakerHandler {
    async fn invoke(&self, context: &mut HttpContext, next: HttpNext<'_>) -> Result<()> {
        let policy = self.provider.policy_for(&context.input.url);
        let guard = policy.admit()?;

        let result = next.run(context).await;
        guard.disarm();
        match (&result, &context.output) {
            (Err(e), _) => policy.notify_request_finished(RequestOutcome::Failed(e)),
            (Ok(()), Some(response)) => {
                policy.notify_request_finished(RequestOutcome::Status(response.status))
            }
            (Ok(()), None) => policy.notify_request_finished(RequestOutcome::Success),
        }

        result
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Re-runs the rest of the chain on transient failures with exponential backoff
pub struct RetryHandler {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryHandler {
    /// Creates a new retry handler
    ///
    /// # Arguments
    /// * `max_attempts` - Total attempts including the first one
    /// * `initial_delay` - Delay before the first retry; doubled each time
    /// * `max_delay` - Upper bound on the delay
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(5))
    }
}

#[async_trait]
impl PipelineHandler<HttpRequest, HttpResponse> for RetryHandler {
    async fn invoke(&self, context: &mut HttpContext, next: HttpNext<'_>) -> Result<()> {
        let mut attempt = 0;
        let mut delay = self.initial_delay;

        loop {
            attempt += 1;
            context.output = None;

            let result = next.run(context).await;

            let retryable = match (&result, &context.output) {
                (Err(e), _) => e.is_transient(),
                (Ok(()), Some(response)) => matches!(response.status, 502..=504),
                (Ok(()), None) => false,
            };

            if !retryable || attempt >= self.max_attempts {
                return result;
            }

            warn!(
                "{} {} failed (attempt {}/{}), retrying in {:?}",
                context.input.method, context.input.url, attempt, self.max_attempts, delay
            );

            tokio::select! {
                _ = context.cancellation.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            delay = (delay * 2).min(self.max_delay);
        }
    }
}

// =============================================================================
// API Key
// =============================================================================

/// Adds an API key header to every request
pub struct ApiKeyHandler {
    header: String,
    key: String,
}

impl ApiKeyHandler {
    pub fn new(header: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl PipelineHandler<HttpRequest, HttpResponse> for ApiKeyHandler {
    async fn invoke(&self, context: &mut HttpContext, next: HttpNext<'_>) -> Result<()> {
        let already_set = context
            .input
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(&self.header));

        if !already_set {
            context
                .input
                .headers
                .push((self.header.clone(), self.key.clone()));
        }

        next.run(context).await
    }
}

// =============================================================================
// Send
// =============================================================================

/// Performs the HTTP call; never calls `next`
pub struct SendHttpRequestHandler {
    client: reqwest::Client,
}

impl SendHttpRequestHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PipelineHandler<HttpRequest, HttpResponse> for SendHttpRequestHandler {
    async fn invoke(&self, context: &mut HttpContext, _next: HttpNext<'_>) -> Result<()> {
        let request = &context.input;

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let timeout = request.timeout.unwrap_or_default();
        let send = async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let body = response.text().await?;

            Ok::<_, reqwest::Error>(HttpResponse {
                status,
                headers,
                body,
            })
        };

        let response = tokio::select! {
            _ = context.cancellation.cancelled() => return Err(ClientError::Cancelled),
            response = send => response,
        };

        let response = response.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(timeout)
            } else {
                ClientError::RequestFailed(e)
            }
        })?;

        context.output = Some(response);
        Ok(())
    }
}
