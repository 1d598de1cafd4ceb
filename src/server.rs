//! HTTP/1.1 front end: turns hyper requests into [`RequestContext`]s, hands
//! them to the [`Provider`] and writes the [`ResponseContext`] back.
use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{Entity, ErrorBody, RequestContext, ResponseContext, StatusText};
use crate::provider::Provider;

/// How long shutdown waits for open connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    provider: Arc<Provider>,
    max_body_bytes: usize,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(provider: Arc<Provider>, max_body_bytes: usize) -> Self {
        Self {
            provider,
            max_body_bytes,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Binds `addr` and serves until Ctrl-C.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        self.serve(listener, shutdown).await
    }

    /// Serves connections from `listener` until `shutdown` resolves, then
    /// gives open connections a short grace period.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr().context("Listener has no local address")?;
        tracing::info!(addr = %local, "AtomPub server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let provider = Arc::clone(&self.provider);
                        let active = Arc::clone(&self.active);
                        let limit = self.max_body_bytes;
                        tokio::spawn(serve_connection(stream, peer, provider, active, limit));
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        let started = tokio::time::Instant::now();
        while self.active.load(Ordering::Relaxed) > 0 && started.elapsed() < DRAIN_TIMEOUT {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        match self.active.load(Ordering::Relaxed) {
            0 => tracing::info!("Server stopped"),
            open => tracing::warn!(connections = open, "Server stopped with connections still open"),
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    provider: Arc<Provider>,
    active: Arc<AtomicUsize>,
    max_body_bytes: usize,
) {
    let _open = OpenConnection::new(active);
    let service = service_fn(move |req| {
        let provider = Arc::clone(&provider);
        async move { Ok::<_, Infallible>(handle(req, &provider, max_body_bytes).await) }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        if err.is_incomplete_message() || err.is_canceled() {
            tracing::debug!(peer = %peer, error = %err, "Client went away");
        } else {
            tracing::warn!(peer = %peer, error = %err, "Error serving connection");
        }
    }
}

/// Counts one open connection for the shutdown drain until dropped.
struct OpenConnection(Arc<AtomicUsize>);

impl OpenConnection {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One request through the provider.
pub async fn handle(req: Request<Incoming>, provider: &Provider, max_body_bytes: usize) -> Response<Full<Bytes>> {
    let debug = provider.settings().debug;
    let (parts, body) = req.into_parts();

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > max_body_bytes) {
        return to_hyper(payload_too_large(max_body_bytes), debug);
    }

    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return to_hyper(payload_too_large(max_body_bytes), debug);
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read request body");
            let response = ResponseContext::error(
                &crate::protocol::ProtocolError::bad_request("could not read request body"),
                debug,
            );
            return to_hyper(response, debug);
        }
    };

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let base_uri = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{host}"));

    let mut request = RequestContext::new(parts.method, target)
        .with_headers(parts.headers)
        .with_body(body);
    if let Some(base) = base_uri {
        request = request.with_base_uri(base);
    }

    to_hyper(provider.process(request).await, debug)
}

fn payload_too_large(limit: usize) -> ResponseContext {
    let status = StatusCode::PAYLOAD_TOO_LARGE;
    ResponseContext::new(status).with_entity(Entity::Error(ErrorBody {
        code: status.as_u16(),
        message: format!("Request body exceeds {limit} bytes"),
        detail: None,
    }))
}

fn to_hyper(response: ResponseContext, debug: bool) -> Response<Full<Bytes>> {
    let (mut parts, body) = response.into_http(debug).into_parts();
    if let Some(StatusText(text)) = parts.extensions.remove::<StatusText>() {
        match ReasonPhrase::try_from(text.into_bytes()) {
            Ok(reason) => {
                parts.extensions.insert(reason);
            }
            Err(_) => tracing::debug!("Dropping invalid reason phrase"),
        }
    }
    parts
        .headers
        .entry(header::SERVER)
        .or_insert(HeaderValue::from_static(concat!("abdera/", env!("CARGO_PKG_VERSION"))));
    Response::from_parts(parts, Full::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_connection_counts_until_dropped() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = OpenConnection::new(Arc::clone(&active));
        let second = OpenConnection::new(Arc::clone(&active));
        assert_eq!(active.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(active.load(Ordering::Relaxed), 1);
        drop(second);
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_open_connection_released_when_task_unwinds() {
        let active = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&active);
        let result = std::panic::catch_unwind(move || {
            let _open = OpenConnection::new(counter);
            panic!("connection task failed");
        });

        assert!(result.is_err());
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }
}
