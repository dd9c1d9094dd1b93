//! HTTP/1.1 message framing
//!
//! Heads are parsed with `httparse` into typed `hyper` headers; bodies are
//! relayed as they arrive without ever being buffered whole. Chunked bodies
//! keep their chunk boundaries and extensions, and trailers are forwarded
//! minus hop-by-hop fields.

use crate::error::{Error, Result};
use crate::models::{BodyKind, RequestHead, ResponseHead};
use crate::utils::is_hop_by_hop_header;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Method, StatusCode};
use std::io;
use thiserror::Error as ThisError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted request or response head, in bytes
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;

/// Failure while relaying a body from a source stream to a sink stream
#[derive(ThisError, Debug)]
pub enum TransferError {
    #[error("reading body failed: {0}")]
    Source(io::Error),

    #[error("writing body failed: {0}")]
    Sink(io::Error),

    #[error("malformed body framing: {0}")]
    Framing(String),
}

/// Read a message head up to and including its terminating blank line.
///
/// Returns `Ok(None)` when the peer closes before sending a single byte.
/// Blank lines preceding the start line are skipped.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let start = head.len();
        let limit = MAX_HEAD_SIZE - start;
        let read = (&mut *reader)
            .take(limit as u64)
            .read_until(b'\n', &mut head)
            .await?;

        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(Error::Protocol("connection closed inside message head".to_string()));
        }
        if head.last() != Some(&b'\n') {
            if head.len() >= MAX_HEAD_SIZE {
                return Err(Error::Protocol("message head too large".to_string()));
            }
            return Err(Error::Protocol("connection closed inside message head".to_string()));
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }

        if head.len() >= MAX_HEAD_SIZE {
            return Err(Error::Protocol("message head too large".to_string()));
        }
    }
}

/// Parse a complete request head.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    match request.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::Protocol("incomplete request head".to_string()))
        }
        Err(e) => return Err(Error::Protocol(format!("malformed request head: {}", e))),
    }

    let method = Method::from_bytes(request.method.unwrap_or_default().as_bytes())
        .map_err(|e| Error::Protocol(format!("invalid method: {}", e)))?;
    let target = request.path.unwrap_or_default().to_string();
    if target.is_empty() {
        return Err(Error::Protocol("empty request-target".to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        minor_version: request.version.unwrap_or(1),
        headers: collect_headers(request.headers)?,
    })
}

/// Parse a complete response head.
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    match response.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::Protocol("incomplete response head".to_string()))
        }
        Err(e) => return Err(Error::Protocol(format!("malformed response head: {}", e))),
    }

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| Error::Protocol("invalid status code".to_string()))?;

    Ok(ResponseHead {
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        minor_version: response.version.unwrap_or(1),
        headers: collect_headers(response.headers)?,
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::Protocol(format!("invalid header name: {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::Protocol(format!("invalid value for header {}", header.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Serialize an HTTP/1.1 request head.
pub fn encode_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    write_headers(&mut buf, headers);
    buf
}

/// Serialize an HTTP/1.1 response head, keeping the given reason phrase.
pub fn encode_response_head(status: StatusCode, reason: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
    write_headers(&mut buf, headers);
    buf
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Determine how an inbound request body is framed.
pub fn request_body_kind(headers: &HeaderMap) -> Result<BodyKind> {
    if headers.contains_key(TRANSFER_ENCODING) {
        if is_chunked(headers) {
            return Ok(BodyKind::Chunked);
        }
        return Err(Error::Protocol("unsupported transfer-encoding".to_string()));
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyKind::Empty),
        Some(len) => Ok(BodyKind::Length(len)),
    }
}

/// Determine how an origin response body is framed.
pub fn response_body_kind(request_method: &Method, head: &ResponseHead) -> Result<BodyKind> {
    let status = head.status;
    if request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyKind::Empty);
    }
    if head.headers.contains_key(TRANSFER_ENCODING) {
        if is_chunked(&head.headers) {
            return Ok(BodyKind::Chunked);
        }
        return Ok(BodyKind::CloseDelimited);
    }
    match content_length(&head.headers)? {
        Some(0) => Ok(BodyKind::Empty),
        Some(len) => Ok(BodyKind::Length(len)),
        None => Ok(BodyKind::CloseDelimited),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .last()
        .map_or(false, |coding| coding.eq_ignore_ascii_case("chunked"))
}

/// Parse `Content-Length`; repeated values must agree.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| Error::Protocol("invalid content-length".to_string()))?;
        for part in text.split(',') {
            let parsed = part
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("invalid content-length: {}", text)))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(Error::Protocol("conflicting content-length values".to_string()))
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Relay one body from `reader` to `writer`, preserving its framing.
pub async fn transfer_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    kind: BodyKind,
) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match kind {
        BodyKind::Empty => 0,
        BodyKind::Length(len) => copy_exact(reader, writer, len).await?,
        BodyKind::Chunked => copy_chunked(reader, writer).await?,
        BodyKind::CloseDelimited => copy_to_eof(reader, writer).await?,
    };
    writer.flush().await.map_err(TransferError::Sink)?;
    Ok(copied)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let available = reader.fill_buf().await.map_err(TransferError::Source)?;
        if available.is_empty() {
            return Err(TransferError::Source(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended with {} byte(s) outstanding", remaining),
            )));
        }
        let take = available
            .len()
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        writer
            .write_all(&available[..take])
            .await
            .map_err(TransferError::Sink)?;
        reader.consume(take);
        remaining -= take as u64;
    }
    Ok(len)
}

async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let available = reader.fill_buf().await.map_err(TransferError::Source)?;
        if available.is_empty() {
            return Ok(total);
        }
        let take = available.len();
        writer
            .write_all(available)
            .await
            .map_err(TransferError::Sink)?;
        reader.consume(take);
        total += take as u64;
    }
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> std::result::Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::with_capacity(64);

    loop {
        read_chunk_line(reader, &mut line).await?;
        let size = parse_chunk_size(&line)?;
        writer.write_all(&line).await.map_err(TransferError::Sink)?;
        if size == 0 {
            break;
        }

        copy_exact(reader, writer, size).await?;
        total += size;

        read_chunk_line(reader, &mut line).await?;
        if !is_blank_line(&line) {
            return Err(TransferError::Framing("missing CRLF after chunk data".to_string()));
        }
        writer.write_all(b"\r\n").await.map_err(TransferError::Sink)?;
    }

    // Trailer section
    loop {
        read_chunk_line(reader, &mut line).await?;
        if is_blank_line(&line) {
            writer.write_all(b"\r\n").await.map_err(TransferError::Sink)?;
            return Ok(total);
        }
        let name = line
            .iter()
            .position(|b| *b == b':')
            .map(|colon| String::from_utf8_lossy(&line[..colon]).into_owned())
            .ok_or_else(|| TransferError::Framing("malformed trailer field".to_string()))?;
        if is_hop_by_hop_header(&name) {
            continue;
        }
        writer.write_all(&line).await.map_err(TransferError::Sink)?;
    }
}

async fn read_chunk_line<R>(reader: &mut R, line: &mut Vec<u8>) -> std::result::Result<(), TransferError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader)
        .take(MAX_CHUNK_LINE as u64)
        .read_until(b'\n', line)
        .await
        .map_err(TransferError::Source)?;
    if read == 0 {
        return Err(TransferError::Source(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "chunked body ended early",
        )));
    }
    if line.last() != Some(&b'\n') {
        return Err(TransferError::Framing("chunk line too long or truncated".to_string()));
    }
    Ok(())
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn parse_chunk_size(line: &[u8]) -> std::result::Result<u64, TransferError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| TransferError::Framing("chunk size is not ASCII".to_string()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| TransferError::Framing(format!("invalid chunk size: {:?}", digits)))
}
