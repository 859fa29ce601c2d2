//! Per-service HTTP dispatch.
//!
//! Each service gets its own pooled client with idle-timeout eviction;
//! requests carry the same absolute-deadline semantics as the data path and
//! surface the same retry-reason vocabulary.

use super::rows::RowLexer;
use crate::config::ClusterOptions;
use crate::error::{
    CommonError, ErrorContext, OperationError, StreamingJsonError,
};
use crate::retry::{BestEffortRetryStrategy, RetryDecision, RetryReason, RetryState, orchestrate};
use crate::types::ServiceType;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

/// One HTTP request against a service endpoint.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub service: ServiceType,
    pub method: HttpMethod,
    /// `scheme://host:port`, chosen from the topology by the caller
    pub base: String,
    pub path: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<&'static str>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Per-service connection pools. Clients are built lazily and reused; the
/// pool itself is a short-critical-section mutex.
pub struct HttpDispatcher {
    clients: Mutex<HashMap<ServiceType, reqwest::Client>>,
    idle_timeout: Duration,
    max_connections: usize,
    accept_invalid_certs: bool,
    strategy: BestEffortRetryStrategy,
}

impl HttpDispatcher {
    pub fn new(options: &ClusterOptions) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            idle_timeout: options.idle_http_connection_timeout,
            max_connections: options.max_http_connections,
            accept_invalid_certs: options.tls.accept_all_certificates,
            strategy: BestEffortRetryStrategy::controlled(),
        }
    }

    fn client_for(&self, service: ServiceType) -> Result<reqwest::Client, OperationError> {
        let mut clients = self.clients.lock().expect("http pool lock");
        if let Some(client) = clients.get(&service) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(self.idle_timeout)
            .use_rustls_tls();
        if self.max_connections > 0 {
            builder = builder.pool_max_idle_per_host(self.max_connections);
        }
        if self.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|_| OperationError::new(CommonError::ServiceNotAvailable))?;
        clients.insert(service, client.clone());
        Ok(client)
    }

    fn build(
        &self,
        client: &reqwest::Client,
        request: &HttpRequest,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", request.base, request.path);
        let mut builder = match request.method {
            HttpMethod::Get => client.get(&url),
            HttpMethod::Post => client.post(&url),
            HttpMethod::Delete => client.delete(&url),
        };
        if let (Some(user), Some(pass)) = (&request.username, &request.password) {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }

    /// Execute with the shared retry taxonomy and an absolute deadline.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, OperationError> {
        let deadline = Instant::now() + request.timeout;
        let client = self.client_for(request.service)?;
        let mut state = RetryState::new();

        loop {
            let outcome = timeout_at(deadline, self.build(&client, &request).send()).await;
            let reason = match outcome {
                Err(_) => {
                    return Err(timeout_error(&request, &state));
                }
                Ok(Err(e)) => {
                    debug!(service = ?request.service, error = %e, "http send failed");
                    RetryReason::ServiceNotAvailable
                }
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    match retry_reason_for(request.service, status) {
                        Some(reason) => reason,
                        None => {
                            let body = match timeout_at(deadline, response.bytes()).await {
                                Err(_) => return Err(timeout_error(&request, &state)),
                                Ok(Err(_)) => {
                                    return Err(OperationError::new(
                                        CommonError::ServiceNotAvailable,
                                    ));
                                }
                                Ok(Ok(bytes)) => bytes.to_vec(),
                            };
                            return Ok(HttpResponse { status, body });
                        }
                    }
                }
            };

            match orchestrate(&self.strategy, &state, request.idempotent, reason, deadline) {
                RetryDecision::RetryAfter(delay) => {
                    state.record(reason);
                    sleep(delay).await;
                }
                RetryDecision::DeadlineExceeded | RetryDecision::GiveUp => {
                    state.record(reason);
                    return Err(timeout_error(&request, &state));
                }
            }
        }
    }

    /// Execute and lex the row stream. Rows are delivered through `on_row`
    /// as they complete; the return value is the trailing metadata.
    pub async fn execute_rows(
        &self,
        request: HttpRequest,
        pointer: &str,
        mut on_row: impl FnMut(Vec<u8>),
    ) -> Result<Vec<u8>, OperationError> {
        let deadline = Instant::now() + request.timeout;
        let client = self.client_for(request.service)?;

        let response = timeout_at(deadline, self.build(&client, &request).send())
            .await
            .map_err(|_| timeout_error(&request, &RetryState::new()))?
            .map_err(|_| OperationError::new(CommonError::ServiceNotAvailable))?;
        if let Some(reason) = retry_reason_for(request.service, response.status().as_u16()) {
            // row streams are not replayed; surface the mapped failure
            let ctx = ErrorContext { retry_reasons: vec![reason], ..Default::default() };
            return Err(OperationError::with_ctx(CommonError::ServiceNotAvailable, ctx));
        }

        let mut lexer = RowLexer::new(pointer);
        let mut stream = response.bytes_stream();
        loop {
            match timeout_at(deadline, stream.next()).await {
                Err(_) => return Err(timeout_error(&request, &RetryState::new())),
                Ok(None) => break,
                Ok(Some(Err(_))) => {
                    return Err(OperationError::new(CommonError::ServiceNotAvailable));
                }
                Ok(Some(Ok(chunk))) => {
                    for row in lexer.feed(&chunk).map_err(row_error)? {
                        on_row(row);
                    }
                }
            }
        }
        lexer.finish().map_err(row_error)?;
        Ok(lexer.meta().to_vec())
    }

    /// Best-effort reachability probe used by the ping collector.
    pub async fn ping(
        &self,
        service: ServiceType,
        base: &str,
        timeout: Duration,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Duration, OperationError> {
        let request = HttpRequest {
            service,
            method: HttpMethod::Get,
            base: base.to_string(),
            path: ping_path(service).to_string(),
            body: None,
            content_type: None,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            timeout,
            idempotent: true,
        };
        let started = Instant::now();
        let response = self.execute(request).await?;
        if response.status >= 500 {
            warn!(service = ?service, status = response.status, "ping rejected");
            return Err(OperationError::new(CommonError::ServiceNotAvailable));
        }
        Ok(started.elapsed())
    }
}

fn row_error(e: StreamingJsonError) -> OperationError {
    OperationError::new(e)
}

fn timeout_error(request: &HttpRequest, state: &RetryState) -> OperationError {
    let kind = if request.idempotent {
        CommonError::UnambiguousTimeout
    } else {
        CommonError::AmbiguousTimeout
    };
    OperationError::with_ctx(
        kind,
        ErrorContext {
            retry_attempts: state.attempts(),
            retry_reasons: state.reasons().to_vec(),
            last_dispatched_to: Some(request.base.clone()),
            ..Default::default()
        },
    )
}

/// Shared retry vocabulary for HTTP status codes
fn retry_reason_for(service: ServiceType, status: u16) -> Option<RetryReason> {
    match (service, status) {
        (ServiceType::Search, 429) => Some(RetryReason::SearchTooManyRequests),
        (ServiceType::Analytics, 503) => Some(RetryReason::AnalyticsTemporaryFailure),
        (ServiceType::View, 500) => Some(RetryReason::ViewsTemporaryFailure),
        (_, 502 | 503) => Some(RetryReason::ServiceNotAvailable),
        _ => None,
    }
}

/// Health endpoint per service
fn ping_path(service: ServiceType) -> &'static str {
    match service {
        ServiceType::Query => "/admin/ping",
        ServiceType::Search => "/api/ping",
        ServiceType::Analytics => "/admin/ping",
        ServiceType::View => "/",
        ServiceType::Management => "/pools",
        ServiceType::Eventing => "/api/v1/config",
        ServiceType::KeyValue => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_shared_retry_reasons() {
        assert_eq!(
            retry_reason_for(ServiceType::Search, 429),
            Some(RetryReason::SearchTooManyRequests)
        );
        assert_eq!(
            retry_reason_for(ServiceType::Query, 503),
            Some(RetryReason::ServiceNotAvailable)
        );
        assert_eq!(
            retry_reason_for(ServiceType::Analytics, 503),
            Some(RetryReason::AnalyticsTemporaryFailure)
        );
        assert_eq!(retry_reason_for(ServiceType::Query, 200), None);
        assert_eq!(retry_reason_for(ServiceType::Query, 404), None);
    }
}
