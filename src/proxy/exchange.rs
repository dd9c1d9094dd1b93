//! One request/response exchange on a client session
//!
//! An [`Exchange`] is the request record handed down the handler pipeline:
//! the parsed head, a reader for the request body, and the client's
//! response channel. Handlers either respond through it, relay an upstream
//! response through it, or hijack the raw connection for a tunnel.

use crate::error::{Error, Result};
use crate::models::{BodyKind, RequestHead};
use crate::proxy::codec::{encode_response_head, transfer_body, TransferError};
use bytes::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, EXPECT, X_CONTENT_TYPE_OPTIONS,
};
use hyper::{Method, StatusCode};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// A byte stream a session can run over (plain TCP or TLS-over-TCP)
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized {}

/// Buffered, type-erased connection used for both client and origin hops
pub type Connection = BufReader<Box<dyn Io>>;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Wrap a raw stream for use as a [`Connection`].
pub fn buffered(io: Box<dyn Io>) -> Connection {
    BufReader::with_capacity(READ_BUFFER_SIZE, io)
}

/// What the session needs to know once a handler has returned
#[derive(Debug, Clone, Copy)]
pub(crate) struct Outcome {
    pub responded: bool,
    pub close: bool,
    pub hijacked: bool,
    pub unread_body: Option<BodyKind>,
    pub awaiting_continue: bool,
}

pub struct Exchange<'a> {
    conn: &'a mut Connection,
    remote_addr: SocketAddr,
    head: RequestHead,
    body_kind: BodyKind,
    body_read: bool,
    expect_continue: bool,
    responded: bool,
    close: bool,
    hijacked: bool,
}

impl<'a> Exchange<'a> {
    pub fn new(
        conn: &'a mut Connection,
        remote_addr: SocketAddr,
        head: RequestHead,
        body_kind: BodyKind,
    ) -> Self {
        let expect_continue = body_kind != BodyKind::Empty
            && head.minor_version >= 1
            && head
                .headers
                .get(EXPECT)
                .and_then(|value| value.to_str().ok())
                .map_or(false, |value| value.trim().eq_ignore_ascii_case("100-continue"));
        let close = head.wants_close();

        Self {
            conn,
            remote_addr,
            head,
            body_kind,
            body_read: body_kind == BodyKind::Empty,
            expect_continue,
            responded: false,
            close,
            hijacked: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Request-target as it appeared on the request line
    pub fn target(&self) -> &str {
        &self.head.target
    }

    pub fn minor_version(&self) -> u8 {
        self.head.minor_version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn body_kind(&self) -> BodyKind {
        self.body_kind
    }

    /// Close the client connection once this exchange completes.
    pub fn close_after_response(&mut self) {
        self.close = true;
    }

    pub fn will_close(&self) -> bool {
        self.close
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    /// Send a complete response with a `Content-Length` body.
    pub async fn respond(&mut self, status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Result<()> {
        self.begin_response()?;

        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        if self.close {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let mut buf = encode_response_head(status, status.canonical_reason().unwrap_or(""), &headers);
        if self.head.method != Method::HEAD {
            buf.extend_from_slice(&body);
        }
        self.conn.write_all(&buf).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Send a short plain-text diagnostic.
    pub async fn respond_text(&mut self, status: StatusCode, message: &str) -> Result<()> {
        let (headers, body) = text_response(message);
        self.respond(status, headers, body).await
    }

    /// Write the head of a relayed response; the body follows through [`Exchange::conn`].
    pub async fn write_response_head(&mut self, status: StatusCode, reason: &str, headers: &HeaderMap) -> Result<()> {
        self.begin_response()?;
        self.conn
            .write_all(&encode_response_head(status, reason, headers))
            .await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Relay an informational (1xx) response ahead of the final one.
    pub async fn write_interim(&mut self, status: StatusCode, reason: &str, headers: &HeaderMap) -> Result<()> {
        if self.responded || self.hijacked {
            return Err(Error::Protocol("final response already started".to_string()));
        }
        self.conn
            .write_all(&encode_response_head(status, reason, headers))
            .await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Stream the request body into `writer`, answering `Expect: 100-continue` first.
    ///
    /// A body can only be read once; later calls copy nothing.
    pub async fn copy_body_to<W>(&mut self, writer: &mut W) -> std::result::Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.body_read {
            return Ok(0);
        }
        self.body_read = true;

        if self.expect_continue {
            self.expect_continue = false;
            self.conn
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .map_err(TransferError::Source)?;
            self.conn.flush().await.map_err(TransferError::Source)?;
        }

        let result = transfer_body(&mut *self.conn, writer, self.body_kind).await;
        if result.is_err() {
            self.close = true;
        }
        result
    }

    /// Resolves once the client hangs up; stays pending while it is connected.
    pub async fn client_gone(&mut self) {
        let has_data = matches!(self.conn.fill_buf().await, Ok(buf) if !buf.is_empty());
        if has_data {
            std::future::pending::<()>().await;
        }
    }

    /// Raw client connection, for streaming a relayed response body.
    pub(crate) fn conn(&mut self) -> &mut Connection {
        &mut *self.conn
    }

    /// Take over the client connection; the session ends when the handler returns.
    pub fn hijack(&mut self) -> &mut Connection {
        self.hijacked = true;
        &mut *self.conn
    }

    fn begin_response(&mut self) -> Result<()> {
        if self.responded || self.hijacked {
            return Err(Error::Protocol("response already started".to_string()));
        }
        self.responded = true;
        Ok(())
    }

    pub(crate) fn finish(self) -> Outcome {
        Outcome {
            responded: self.responded,
            close: self.close,
            hijacked: self.hijacked,
            unread_body: (!self.body_read).then_some(self.body_kind),
            awaiting_continue: self.expect_continue,
        }
    }
}

fn text_response(message: &str) -> (HeaderMap, Bytes) {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    (headers, Bytes::from(format!("{}\n", message)))
}

/// Write a plain-text error response that ends the connection.
pub(crate) async fn write_error_response(conn: &mut Connection, status: StatusCode, message: &str) -> Result<()> {
    let (mut headers, body) = text_response(message);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    let mut buf = encode_response_head(status, status.canonical_reason().unwrap_or(""), &headers);
    buf.extend_from_slice(&body);
    conn.write_all(&buf).await?;
    conn.flush().await?;
    Ok(())
}
