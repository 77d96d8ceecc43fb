//! Pooled HTTP client for talking to the backend
//!
//! One keep-alive pool serves both proxied requests and readiness probes.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Connect, send, or response head failed
    #[error("upstream request failed")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read upstream response body")]
    Body(#[source] hyper::Error),

    #[error("invalid upstream request: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// True when the exchange with the backend itself failed, as opposed to
    /// a request we could not build
    pub fn is_network(&self) -> bool {
        !matches!(self, PoolError::RequestBuild(_))
    }
}

/// Counters for traffic through the pool
#[derive(Debug, Default)]
pub struct PoolStats {
    requests: AtomicU64,
    probes: AtomicU64,
}

impl PoolStats {
    fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    /// Proxied requests sent upstream
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Readiness probes sent upstream
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections kept per host
    pub max_idle_per_host: usize,
    /// How long an idle connection is kept
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Upstream response with the body already read
pub type BufferedResponse = Response<Bytes>;

pub struct ConnectionPool {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream connection pool ready"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request and read the whole response body.
    ///
    /// The client fills in `Host` from the URI and `Content-Length` from the
    /// body when they are absent.
    pub async fn send_buffered(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<BufferedResponse, PoolError> {
        self.stats.record_request();

        let (parts, body) = self.client.request(req).await?.into_parts();
        let body = body.collect().await.map_err(PoolError::Body)?.to_bytes();

        Ok(Response::from_parts(parts, body))
    }

    /// Issue a bare GET and report the status. Any status counts as an
    /// answer; only transport failures are errors.
    pub async fn probe(&self, uri: Uri) -> Result<StatusCode, PoolError> {
        let req = Request::get(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_probe();
        Ok(self.client.request(req).await?.status())
    }
}
