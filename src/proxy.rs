use crate::error::{html_error_response, ProxyErrorCode};
use crate::headers::{request_headers, response_headers};
use crate::pool::{ConnectionPool, PoolError};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::TRANSFER_ENCODING;
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where and how requests are forwarded. Read-only after startup.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Base URL of the backend, e.g. `http://127.0.0.1:9001`
    pub base_url: String,
    /// Upper bound on one upstream exchange
    pub request_timeout: Duration,
}

impl Upstream {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    /// Target URL for an inbound request URI.
    ///
    /// The raw path and query are reused byte for byte, so nothing is
    /// decoded or re-encoded on the way through. An empty path maps to `/`.
    pub fn target_url(&self, inbound: &Uri) -> String {
        let path_and_query = inbound
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }
}

/// The external HTTP endpoint
pub struct ProxyServer {
    bind_addr: SocketAddr,
    upstream: Arc<Upstream>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        upstream: Upstream,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            upstream: Arc::new(upstream),
            shutdown_rx,
            pool,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signaled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            upstream = %self.upstream.base_url,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let upstream = Arc::clone(&self.upstream);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, upstream, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    upstream: Arc<Upstream>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let upstream = Arc::clone(&upstream);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, addr, &upstream, &pool).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Forward one request to the backend and relay its answer.
///
/// Exactly one upstream attempt is made. Network failures and timeouts
/// become a 503 page; the error never escapes to the connection.
pub async fn handle_request<B>(
    req: Request<B>,
    client_addr: SocketAddr,
    upstream: &Upstream,
    pool: &ConnectionPool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let url = upstream.target_url(req.uri());
    let method = req.method().clone();

    debug!(method = %method, %url, client = %client_addr, "Incoming request");

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(method = %method, %url, error = %e, "Failed to read request body");
            return Ok(html_error_response(
                ProxyErrorCode::BadRequestBody,
                format!("Failed to read request body: {}", e),
            ));
        }
    };

    let mut builder = Request::builder().method(parts.method).uri(&url);
    if let Some(headers) = builder.headers_mut() {
        *headers = request_headers(&parts.headers);
        // The body is buffered and re-framed with Content-Length
        headers.remove(TRANSFER_ENCODING);
    }
    let upstream_req = match builder.body(Full::new(body)) {
        Ok(req) => req,
        Err(e) => {
            error!(%url, error = %e, "Failed to build upstream request");
            return Ok(html_error_response(
                ProxyErrorCode::InternalError,
                format!("Failed to build upstream request: {}", e),
            ));
        }
    };

    let timeout = upstream.request_timeout;
    match tokio::time::timeout(timeout, pool.send_buffered(upstream_req)).await {
        Ok(Ok(response)) => {
            let (parts, body) = response.into_parts();
            debug!(method = %method, %url, status = parts.status.as_u16(), "Upstream responded");

            let mut relayed = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
            *relayed.status_mut() = parts.status;
            *relayed.headers_mut() = response_headers(&parts.headers);
            Ok(relayed)
        }
        Ok(Err(e)) if e.is_network() => {
            error!(method = %method, %url, error = %describe(&e), "Error proxying request");
            Ok(html_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                format!("The backend server is not responding. Error: {}", describe(&e)),
            ))
        }
        Ok(Err(e)) => {
            error!(method = %method, %url, error = %e, "Failed to forward request");
            Ok(html_error_response(
                ProxyErrorCode::InternalError,
                format!("Failed to forward request: {}", e),
            ))
        }
        Err(_) => {
            warn!(
                method = %method,
                %url,
                timeout_secs = timeout.as_secs(),
                "Upstream request timed out"
            );
            Ok(html_error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!(
                    "The backend server did not respond within {} seconds.",
                    timeout.as_secs()
                ),
            ))
        }
    }
}

/// Error text including the innermost cause, which carries the useful
/// detail (e.g. "Connection refused") for client errors
fn describe(err: &PoolError) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text = format!("{}: {}", text, cause);
        source = cause.source();
    }
    text
}
