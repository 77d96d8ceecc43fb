//! Header filtering between the external client and the backend
//!
//! Both directions are pure functions over `HeaderMap` so they can be
//! checked without any networking.

use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};

/// Inbound headers never forwarded upstream. The client sets its own
/// loopback `Host` and recomputes `Content-Length` from the forwarded body.
pub const REQUEST_EXCLUDED: [HeaderName; 2] = [HOST, CONTENT_LENGTH];

/// Upstream headers never relayed to the client. Message framing belongs to
/// the outer server.
pub const RESPONSE_EXCLUDED: [HeaderName; 2] = [TRANSFER_ENCODING, CONNECTION];

/// Headers to send to the backend for an inbound request
pub fn request_headers(inbound: &HeaderMap) -> HeaderMap {
    copy_excluding(inbound, &REQUEST_EXCLUDED)
}

/// Headers to return to the client for an upstream response
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    copy_excluding(upstream, &RESPONSE_EXCLUDED)
}

fn copy_excluding(source: &HeaderMap, excluded: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(source.keys_len());
    // append keeps every value of multi-valued headers such as Set-Cookie
    for (name, value) in source.iter() {
        if !excluded.contains(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
