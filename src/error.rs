//! Error kinds for supervision and per-request proxying

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::process::ExitStatus;
use thiserror::Error;

/// Why the backend could not be brought up. Never fatal to the gateway:
/// startup continues in a degraded state when one of these is returned.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The configured command could not be resolved
    #[error("invalid backend command: {0}")]
    Command(String),

    /// The OS refused to start the process
    #[error("failed to spawn backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited before it was ready
    #[error("backend exited with {status}{}", stderr_suffix(.stderr))]
    EarlyExit { status: ExitStatus, stderr: String },

    /// The backend never answered within the readiness window
    #[error("backend did not respond within {timeout_secs} seconds")]
    ReadyTimeout { timeout_secs: u64 },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// A best-effort cleanup step that failed. These are logged and swallowed,
/// never propagated to the caller.
#[derive(Debug, Error)]
pub enum CleanupFailure {
    #[error("failed to scan for stale processes: {0}")]
    Scan(#[source] std::io::Error),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {program}: {source}")]
    Exec {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Error codes for per-request proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Backend refused the connection or the connection broke
    UpstreamUnavailable,
    /// Backend did not complete the exchange within the request timeout
    UpstreamTimeout,
    /// The inbound request body could not be read
    BadRequestBody,
    /// The upstream request could not be built
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BadRequestBody => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::BadRequestBody => "BAD_REQUEST_BODY",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnavailable | ProxyErrorCode::UpstreamTimeout => {
                "Service Unavailable"
            }
            ProxyErrorCode::BadRequestBody => "Bad Request",
            ProxyErrorCode::InternalError => "Internal Server Error",
        }
    }
}

/// Render the minimal HTML page describing a proxy failure
pub fn error_page(code: ProxyErrorCode, message: &str) -> String {
    format!(
        "<h1>{}</h1><p>{}</p>",
        code.title(),
        escape_html(message)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Create an HTML error response with X-Proxy-Error header
pub fn html_error_response(
    code: ProxyErrorCode,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = error_page(code, message.as_ref());

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
