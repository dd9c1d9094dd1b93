//! Forward mode: relaying absolute-form requests to origin servers

use crate::error::{Error, Result};
use crate::models::{BodyKind, ResponseHead};
use crate::proxy::codec::{
    encode_request_head, parse_response_head, read_head, response_body_kind, transfer_body, TransferError,
};
use crate::proxy::exchange::{Connection, Exchange};
use crate::proxy::upstream::{Scheme, Upstream, UpstreamConnection, UpstreamKey};
use crate::utils::{append_via, strip_hop_by_hop, unbracket};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING};
use hyper::{Method, StatusCode, Uri};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

/// Name this proxy adds to `Via`
pub const PSEUDONYM: &str = "httproxy";

/// Where an absolute-form request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub key: UpstreamKey,
    /// Authority for the outbound `Host` header, without userinfo
    pub authority: String,
    pub path_and_query: String,
}

impl ForwardTarget {
    /// Parse an absolute-form request-target (`http://` or `https://`).
    pub fn parse(target: &str) -> std::result::Result<Self, String> {
        let uri: Uri = target
            .parse()
            .map_err(|_| format!("invalid request-target: {}", target))?;

        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(s) => return Err(format!("unsupported scheme: {}", s)),
            None => return Err(format!("non-proxy request for {}", target)),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| format!("request-target lacks an authority: {}", target))?;

        let host_port = authority.as_str().rsplit('@').next().unwrap_or_default();
        let host = authority.host();
        if unbracket(host).is_empty() {
            return Err(format!("request-target lacks a host: {}", target));
        }
        let port = match host_port.strip_prefix(host).unwrap_or_default() {
            "" | ":" => scheme.default_port(),
            explicit => explicit[1..]
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| format!("invalid port in request-target: {}", target))?,
        };

        let path_and_query = match uri.path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if pq.starts_with('/') => pq.to_string(),
            Some(pq) if !pq.is_empty() => format!("/{}", pq),
            _ => "/".to_string(),
        };

        Ok(Self {
            key: UpstreamKey {
                scheme,
                host: unbracket(host).to_string(),
                port,
            },
            authority: host_port.to_string(),
            path_and_query,
        })
    }
}

enum Failure {
    /// The client went away or broke its side of the exchange.
    Client(Error),
    /// The origin failed; `stale` means it failed before sending a single response byte.
    Upstream { error: Error, stale: bool },
    /// The request body framing was invalid.
    BadRequest(String),
}

/// Relay one request to its origin and stream the response back.
pub async fn forward(upstream: &Upstream, exchange: &mut Exchange<'_>, target: ForwardTarget) -> Result<()> {
    let request_head = outbound_request_head(exchange, &target);
    let method = exchange.method().clone();
    let retry_allowed = exchange.body_kind() == BodyKind::Empty && method.is_idempotent();

    let mut attempt = upstream.connect(&target.key).await;
    loop {
        let UpstreamConnection { mut conn, reused } = match attempt {
            Ok(connection) => connection,
            Err(e) => return bad_gateway(exchange, &target, e).await,
        };

        match send_request(exchange, &mut conn, &request_head).await {
            Ok(head) => return relay_response(upstream, exchange, target, &method, conn, head).await,
            Err(Failure::Upstream { error, stale: true }) if reused && retry_allowed => {
                debug!("Pooled connection to {} went stale ({}), redialing", target.key, error);
                attempt = upstream
                    .open(&target.key)
                    .await
                    .map(|conn| UpstreamConnection { conn, reused: false });
            }
            Err(Failure::Upstream { error, .. }) => return bad_gateway(exchange, &target, error).await,
            Err(Failure::Client(error)) => {
                debug!("Client {} went away during upstream exchange: {}", exchange.remote_addr(), error);
                return Err(Error::ClientGone);
            }
            Err(Failure::BadRequest(message)) => {
                exchange.close_after_response();
                return exchange.respond_text(StatusCode::BAD_REQUEST, &message).await;
            }
        }
    }
}

fn outbound_request_head(exchange: &Exchange<'_>, target: &ForwardTarget) -> Vec<u8> {
    let mut headers = exchange.headers().clone();
    let codings = transfer_codings(&headers);

    strip_hop_by_hop(&mut headers);
    headers.remove(EXPECT);
    headers.remove(HOST);
    if let Ok(host) = HeaderValue::from_str(&target.authority) {
        headers.insert(HOST, host);
    }
    append_via(&mut headers, exchange.minor_version(), PSEUDONYM);
    restore_framing(&mut headers, exchange.body_kind(), codings);

    encode_request_head(exchange.method(), &target.path_and_query, &headers)
}

/// Write the request, stream its body, and wait for the final response head.
async fn send_request(
    exchange: &mut Exchange<'_>,
    conn: &mut Connection,
    request_head: &[u8],
) -> std::result::Result<ResponseHead, Failure> {
    if let Err(e) = write_and_flush(conn, request_head).await {
        return Err(Failure::Upstream { error: e.into(), stale: true });
    }

    match exchange.copy_body_to(conn).await {
        Ok(_) => {}
        Err(TransferError::Source(e)) => return Err(Failure::Client(e.into())),
        Err(TransferError::Sink(e)) => return Err(Failure::Upstream { error: e.into(), stale: false }),
        Err(TransferError::Framing(message)) => return Err(Failure::BadRequest(message)),
    }

    let mut first = true;
    loop {
        let raw = tokio::select! {
            raw = read_head(conn) => raw,
            _ = exchange.client_gone() => return Err(Failure::Client(Error::ClientGone)),
        };
        let raw = match raw {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(Failure::Upstream {
                    error: Error::UpstreamConnection("origin closed before responding".to_string()),
                    stale: first,
                })
            }
            Err(error @ Error::Io(_)) => return Err(Failure::Upstream { error, stale: first }),
            Err(error) => return Err(Failure::Upstream { error, stale: false }),
        };
        first = false;

        let mut head = parse_response_head(&raw).map_err(|error| Failure::Upstream { error, stale: false })?;
        if !head.status.is_informational() {
            return Ok(head);
        }
        match head.status {
            StatusCode::CONTINUE => continue,
            StatusCode::SWITCHING_PROTOCOLS => {
                return Err(Failure::Upstream {
                    error: Error::Protocol("origin switched protocols".to_string()),
                    stale: false,
                })
            }
            status => {
                strip_hop_by_hop(&mut head.headers);
                exchange
                    .write_interim(status, &head.reason, &head.headers)
                    .await
                    .map_err(Failure::Client)?;
            }
        }
    }
}

async fn relay_response(
    upstream: &Upstream,
    exchange: &mut Exchange<'_>,
    target: ForwardTarget,
    method: &Method,
    mut conn: Connection,
    head: ResponseHead,
) -> Result<()> {
    let kind = match response_body_kind(method, &head) {
        Ok(kind) => kind,
        Err(e) => return bad_gateway(exchange, &target, e).await,
    };
    let reusable = kind.is_self_delimited() && !head.wants_close();
    if !reusable {
        exchange.close_after_response();
    }

    let mut headers = head.headers;
    let codings = transfer_codings(&headers);
    strip_hop_by_hop(&mut headers);
    restore_framing(&mut headers, kind, codings);

    if let Err(e) = exchange.write_response_head(head.status, &head.reason, &headers).await {
        debug!("Client {} went away before the response head: {}", exchange.remote_addr(), e);
        return Err(Error::ClientGone);
    }

    match relay_body(&mut conn, exchange, kind).await {
        Ok(bytes) => debug!("Relayed {} body byte(s) from {}", bytes, target.key),
        Err(TransferError::Sink(e)) => {
            debug!("Client {} went away mid-response: {}", exchange.remote_addr(), e);
            return Err(Error::ClientGone);
        }
        Err(e) => {
            warn!("Upstream {} aborted mid-response: {}", target.key, e);
            return Err(Error::UpstreamAborted(e.to_string()));
        }
    }

    if reusable {
        upstream.release(target.key, conn);
    }
    Ok(())
}

/// Stream the response body to the client, cancelling if the client hangs up meanwhile.
///
/// Bytes the client sends while the body streams cannot be handed back to the
/// session, so their arrival closes the connection after this response.
async fn relay_body(
    origin: &mut Connection,
    exchange: &mut Exchange<'_>,
    kind: BodyKind,
) -> std::result::Result<u64, TransferError> {
    let mut pipelined = false;
    let result = {
        let (mut client_rx, mut client_tx) = tokio::io::split(exchange.conn());
        tokio::select! {
            biased;
            result = transfer_body(origin, &mut client_tx, kind) => result,
            () = watch_hangup(&mut client_rx, &mut pipelined) => Err(TransferError::Sink(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client closed the connection",
            ))),
        }
    };
    if pipelined {
        exchange.close_after_response();
    }
    result
}

/// Resolves when the client reaches EOF or fails; stays pending once it sends data.
async fn watch_hangup<R: AsyncRead + Unpin>(client: &mut R, pipelined: &mut bool) {
    let mut byte = [0u8; 1];
    if let Ok(n) = client.read(&mut byte).await {
        if n > 0 {
            *pipelined = true;
            std::future::pending::<()>().await;
        }
    }
}

async fn bad_gateway(exchange: &mut Exchange<'_>, target: &ForwardTarget, error: Error) -> Result<()> {
    error!("Upstream {} failed: {}", target.key, error);
    exchange.respond_text(StatusCode::BAD_GATEWAY, "bad gateway").await
}

async fn write_and_flush(conn: &mut Connection, bytes: &[u8]) -> std::io::Result<()> {
    conn.write_all(bytes).await?;
    conn.flush().await
}

fn transfer_codings(headers: &HeaderMap) -> Vec<HeaderValue> {
    headers.get_all(TRANSFER_ENCODING).iter().cloned().collect()
}

/// Put back the framing headers hop-by-hop stripping removed.
fn restore_framing(headers: &mut HeaderMap, kind: BodyKind, codings: Vec<HeaderValue>) {
    match kind {
        BodyKind::Length(len) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        BodyKind::Chunked | BodyKind::CloseDelimited if !codings.is_empty() => {
            headers.remove(CONTENT_LENGTH);
            for coding in codings {
                headers.append(TRANSFER_ENCODING, coding);
            }
        }
        _ => {}
    }
}
