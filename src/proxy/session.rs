//! Per-connection HTTP/1.1 loop
//!
//! Reads request heads one at a time, hands each exchange to the handler
//! pipeline, and decides after every response whether the connection can
//! carry another request.

use crate::config::SessionSettings;
use crate::error::{Error, Result};
use crate::models::BodyKind;
use crate::proxy::codec::{parse_request_head, read_head, request_body_kind, transfer_body};
use crate::proxy::exchange::{buffered, write_error_response, Connection, Exchange, Io};
use crate::proxy::handler::Handler;
use hyper::{Method, StatusCode};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;

/// Unread request bodies up to this size are discarded to keep the connection alive
const MAX_DRAIN_BYTES: u64 = 256 * 1024;

/// Serve requests on one accepted client connection until it closes.
pub async fn serve_connection(
    io: Box<dyn Io>,
    remote_addr: SocketAddr,
    handler: &dyn Handler,
    settings: &SessionSettings,
) -> Result<()> {
    let mut conn = buffered(io);

    loop {
        let raw = match timeout(settings.header_read_timeout, read_head(&mut conn)).await {
            Err(_) => {
                debug!("{} sent no complete request in time, closing", remote_addr);
                return Ok(());
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(raw))) => raw,
            Ok(Err(Error::Io(e))) => return Err(Error::Io(e)),
            Ok(Err(e)) => return reject(&mut conn, remote_addr, e).await,
        };

        let head = match parse_request_head(&raw) {
            Ok(head) => head,
            Err(e) => return reject(&mut conn, remote_addr, e).await,
        };
        let body_kind = if head.method == Method::CONNECT {
            BodyKind::Empty
        } else {
            match request_body_kind(&head.headers) {
                Ok(kind) => kind,
                Err(e) => return reject(&mut conn, remote_addr, e).await,
            }
        };

        let mut exchange = Exchange::new(&mut conn, remote_addr, head, body_kind);
        let result = handler.handle(&mut exchange).await;
        let outcome = exchange.finish();
        result?;

        if outcome.hijacked {
            return Ok(());
        }
        if !outcome.responded {
            write_error_response(&mut conn, StatusCode::INTERNAL_SERVER_ERROR, "no response produced").await?;
            return Ok(());
        }
        if outcome.close {
            let _ = conn.shutdown().await;
            return Ok(());
        }
        if let Some(kind) = outcome.unread_body {
            if outcome.awaiting_continue || !drain(&mut conn, kind, settings).await {
                debug!("{} left an unread request body, closing", remote_addr);
                let _ = conn.shutdown().await;
                return Ok(());
            }
        }
    }
}

async fn reject(conn: &mut Connection, remote_addr: SocketAddr, error: Error) -> Result<()> {
    debug!("Rejecting request from {}: {}", remote_addr, error);
    write_error_response(conn, StatusCode::BAD_REQUEST, "malformed request").await?;
    let _ = conn.shutdown().await;
    Ok(())
}

/// Discard an unread request body; `false` means the connection must close.
async fn drain(conn: &mut Connection, kind: BodyKind, settings: &SessionSettings) -> bool {
    match kind {
        BodyKind::Length(len) if len > MAX_DRAIN_BYTES => return false,
        BodyKind::CloseDelimited => return false,
        _ => {}
    }
    let mut sink = tokio::io::sink();
    let discard = transfer_body(conn, &mut sink, kind);
    matches!(timeout(settings.header_read_timeout, discard).await, Ok(Ok(_)))
}
