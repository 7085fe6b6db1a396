//! HTTP client built on an execution plan
//!
//! `HttpClient` sends `HttpRequest`s through an `ExecutionPlan` whose last
//! handler performs the actual `reqwest` call. `HttpClientBuilder` assembles
//! the usual chain:
//!
//! ```text
//! Logging -> Metrics -> CircuitBreaker -> Retry -> ApiKey -> Send
//! ```

use grid_core::metrics::CounterRegistry;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::pipeline::ExecutionPlan;
use crate::pipeline::handlers::{
    ApiKeyHandler, CircuitBreakerHandler, CircuitBreakerProvider, LoggingHandler, MetricsHandler,
    RetryHandler, SendHttpRequestHandler,
};

/// Outbound HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response as returned by the send handler
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP client that runs every request through an execution plan
#[derive(Clone)]
pub struct HttpClient {
    plan: Arc<ExecutionPlan<HttpRequest, HttpResponse>>,
}

impl HttpClient {
    /// Create a client from a fully assembled plan
    pub fn from_plan(plan: ExecutionPlan<HttpRequest, HttpResponse>) -> Self {
        Self {
            plan: Arc::new(plan),
        }
    }

    /// Start assembling a client
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    pub fn plan(&self) -> &ExecutionPlan<HttpRequest, HttpResponse> {
        &self.plan
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.plan
            .execute_async(request, CancellationToken::new())
            .await
    }

    pub async fn send_with_cancellation(
        &self,
        request: HttpRequest,
        cancellation: CancellationToken,
    ) -> Result<HttpResponse> {
        self.plan.execute_async(request, cancellation).await
    }

    /// Blocking send; must not be called from inside an async context
    pub fn send_blocking(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.plan.execute(request)
    }
}

/// Assembles an `HttpClient`
#[derive(Default)]
pub struct HttpClientBuilder {
    client: Option<reqwest::Client>,
    logging: bool,
    metrics: Option<MetricsHandler>,
    circuit_breaker: Option<Arc<CircuitBreakerProvider>>,
    retry: Option<RetryHandler>,
    api_key: Option<ApiKeyHandler>,
}

impl HttpClientBuilder {
    /// Use a preconfigured reqwest client for the send handler
    pub fn reqwest_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    pub fn with_metrics(
        mut self,
        registry: Arc<dyn CounterRegistry>,
        prefix: impl Into<String>,
    ) -> Self {
        self.metrics = Some(MetricsHandler::new(registry, prefix));
        self
    }

    pub fn with_circuit_breaker(mut self, provider: Arc<CircuitBreakerProvider>) -> Self {
        self.circuit_breaker = Some(provider);
        self
    }

    pub fn with_retry(mut self, retry: RetryHandler) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_api_key(mut self, header: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_key = Some(ApiKeyHandler::new(header, key));
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let mut plan = ExecutionPlan::new();

        if self.logging {
            plan.append_handler(LoggingHandler)?;
        }
        if let Some(metrics) = self.metrics {
            plan.append_handler(metrics)?;
        }
        if let Some(provider) = self.circuit_breaker {
            plan.append_handler(CircuitBreakerHandler::new(provider))?;
        }
        if let Some(retry) = self.retry {
            plan.append_handler(retry)?;
        }
        if let Some(api_key) = self.api_key {
            plan.append_handler(api_key)?;
        }
        plan.append_handler(SendHttpRequestHandler::new(
            self.client.unwrap_or_default(),
        ))?;

        Ok(HttpClient::from_plan(plan))
    }
}
