use async_trait::async_trait;
use http::header;
use http::Method;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::Instrument;

use super::Provider;
use crate::protocol::{HeaderAccess, ProtocolError, RequestContext, ResponseContext};

/// Wraps request processing. A filter either answers on its own or hands
/// the (possibly modified) request to the rest of the chain.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn filter(&self, request: RequestContext, chain: FilterChain<'_>) -> ResponseContext;
}

/// The filters still to run, ending in [`Provider::dispatch`].
pub struct FilterChain<'a> {
    filters: &'a [Arc<dyn RequestFilter>],
    provider: &'a Provider,
}

impl<'a> FilterChain<'a> {
    pub(crate) fn new(filters: &'a [Arc<dyn RequestFilter>], provider: &'a Provider) -> Self {
        Self { filters, provider }
    }

    pub async fn proceed(self, request: RequestContext) -> ResponseContext {
        match self.filters.split_first() {
            Some((first, rest)) => {
                let next = FilterChain {
                    filters: rest,
                    provider: self.provider,
                };
                first.filter(request, next).await
            }
            None => self.provider.dispatch(&request).await,
        }
    }

    /// Error response honouring the provider's debug flag.
    pub fn reject(&self, err: &ProtocolError) -> ResponseContext {
        self.provider.error_response(err)
    }
}

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

// ============================================================================
// Method override
// ============================================================================

/// Lets clients that can only send POST tunnel PUT, DELETE or PATCH through
/// `X-HTTP-Method-Override`.
pub struct MethodOverrideFilter {
    allowed: Vec<Method>,
}

impl MethodOverrideFilter {
    pub fn new() -> Self {
        Self {
            allowed: vec![Method::PUT, Method::DELETE, Method::PATCH],
        }
    }
}

impl Default for MethodOverrideFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestFilter for MethodOverrideFilter {
    async fn filter(&self, mut request: RequestContext, chain: FilterChain<'_>) -> ResponseContext {
        if request.method() == Method::POST {
            let requested = request
                .header("x-http-method-override")
                .or_else(|| request.header("x-method-override"))
                .map(|m| m.trim().to_ascii_uppercase());
            if let Some(name) = requested {
                match Method::from_bytes(name.as_bytes()) {
                    Ok(method) if self.allowed.contains(&method) => {
                        tracing::debug!(method = %method, "Method overridden");
                        request.set_method(method);
                    }
                    _ => tracing::debug!(method = %name, "Ignoring method override"),
                }
            }
        }
        chain.proceed(request).await
    }
}

// ============================================================================
// Bearer token authentication
// ============================================================================

/// Requires `Authorization: Bearer <token>` on unsafe methods. A missing
/// token is 401, a wrong one 403.
pub struct AuthFilter {
    token: SecretString,
}

impl AuthFilter {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }

    /// Compares digests so the comparison time does not depend on how much
    /// of the token matched.
    fn verify(&self, presented: &str) -> bool {
        let expected = Sha256::digest(self.token.expose_secret().as_bytes());
        let actual = Sha256::digest(presented.as_bytes());
        expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[async_trait]
impl RequestFilter for AuthFilter {
    async fn filter(&self, request: RequestContext, chain: FilterChain<'_>) -> ResponseContext {
        if is_safe(request.method()) {
            return chain.proceed(request).await;
        }
        let presented = request.header("authorization").and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });
        let verdict = match presented {
            None => Err(ProtocolError::Unauthorized("bearer token required".to_string())),
            Some(token) if !self.verify(token) => {
                Err(ProtocolError::Forbidden("invalid bearer token".to_string()))
            }
            Some(_) => Ok(()),
        };
        match verdict {
            Ok(()) => chain.proceed(request).await,
            Err(err @ ProtocolError::Unauthorized(_)) => {
                tracing::debug!(method = %request.method(), path = %request.path(), "Missing credentials");
                chain
                    .reject(&err)
                    .with_header(header::WWW_AUTHENTICATE, "Bearer realm=\"abdera\"")
            }
            Err(err) => {
                tracing::warn!(method = %request.method(), path = %request.path(), "Invalid bearer token");
                chain.reject(&err)
            }
        }
    }
}

// ============================================================================
// Concurrency limit
// ============================================================================

/// Answers 503 once `limit` requests are already in flight.
pub struct ConcurrencyLimitFilter {
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimitFilter {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl RequestFilter for ConcurrencyLimitFilter {
    async fn filter(&self, request: RequestContext, chain: FilterChain<'_>) -> ResponseContext {
        let Ok(_permit) = self.permits.try_acquire() else {
            tracing::warn!(path = %request.path(), "Concurrency limit reached");
            return chain
                .reject(&ProtocolError::ServiceUnavailable("server is busy".to_string()))
                .with_header(header::RETRY_AFTER, "1");
        };
        chain.proceed(request).await
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// One span per request, closed with the status and elapsed time.
pub struct TracingFilter;

#[async_trait]
impl RequestFilter for TracingFilter {
    async fn filter(&self, request: RequestContext, chain: FilterChain<'_>) -> ResponseContext {
        let span = tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.path()
        );
        async move {
            let start = Instant::now();
            let response = chain.proceed(request).await;
            tracing::info!(
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Request completed"
            );
            response
        }
        .instrument(span)
        .await
    }
}
