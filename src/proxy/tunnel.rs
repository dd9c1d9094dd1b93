//! CONNECT tunnels

use crate::error::Result;
use crate::proxy::exchange::Exchange;
use crate::proxy::upstream::Upstream;
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::StatusCode;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tracing::{debug, error};

/// Status line sent once the origin connection is up
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Dial `host:port`, then splice the client and origin byte streams until both sides finish.
///
/// Each direction half-closes the other when it reaches EOF, so the tunnel
/// ends once both directions are done or either one fails.
pub async fn tunnel(upstream: &Upstream, exchange: &mut Exchange<'_>, host: &str, port: u16) -> Result<()> {
    let mut origin = match upstream.dial_tcp(host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("CONNECT {}:{} failed: {}", host, port, e);
            exchange.close_after_response();
            return exchange
                .respond(StatusCode::BAD_GATEWAY, HeaderMap::new(), Bytes::new())
                .await;
        }
    };

    let client = exchange.hijack();
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    match copy_bidirectional(client, &mut origin).await {
        Ok((sent, received)) => {
            debug!("Tunnel to {}:{} closed: {} byte(s) up, {} byte(s) down", host, port, sent, received);
        }
        Err(e) => debug!("Tunnel to {}:{} ended with error: {}", host, port, e),
    }
    Ok(())
}
