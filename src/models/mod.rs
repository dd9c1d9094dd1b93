//! Wire-level message heads shared by the session loop and the proxy engine.

use hyper::header::{HeaderMap, CONNECTION};
use hyper::{Method, StatusCode};

/// Parsed head of an inbound HTTP/1.x request
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request-target exactly as it appeared on the request line
    pub target: String,
    /// Minor HTTP version (`1` for HTTP/1.1, `0` for HTTP/1.0)
    pub minor_version: u8,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Whether the client asked for the connection to end after this exchange.
    pub fn wants_close(&self) -> bool {
        self.minor_version == 0 || has_connection_token(&self.headers, "close")
    }
}

/// Parsed head of an HTTP/1.x response received from an origin
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase as sent by the origin (may be empty)
    pub reason: String,
    pub minor_version: u8,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the origin will close its side after this response.
    pub fn wants_close(&self) -> bool {
        if self.minor_version == 0 {
            return !has_connection_token(&self.headers, "keep-alive");
        }
        has_connection_token(&self.headers, "close")
    }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Response body that runs until the origin closes the connection
    CloseDelimited,
}

impl BodyKind {
    /// Whether the connection is still usable once a body of this kind has been read.
    pub fn is_self_delimited(&self) -> bool {
        !matches!(self, BodyKind::CloseDelimited)
    }
}

/// Checks the comma-separated `Connection` header values for `token`.
pub fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}
