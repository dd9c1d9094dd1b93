//! Listener: binds one socket and serves the handler pipeline on every accepted connection

use crate::config::{ListenerDescriptor, SessionSettings, Transport};
use crate::error::{Error, Result};
use crate::proxy::exchange::Io;
use crate::proxy::handler::Handler;
use crate::proxy::session::serve_connection;
use crate::tls::{server_config, ServerCredential};
use crate::{log_error, log_info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Pause after a failed accept (e.g. descriptor exhaustion) before retrying
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyServer {
    descriptor: ListenerDescriptor,
    handler: Arc<dyn Handler>,
    session: SessionSettings,
}

impl ProxyServer {
    pub fn new(descriptor: ListenerDescriptor, handler: Arc<dyn Handler>, session: SessionSettings) -> Self {
        Self {
            descriptor,
            handler,
            session,
        }
    }

    /// Load TLS credentials (for TLS listeners) and bind the socket.
    pub async fn bind(self) -> Result<BoundListener> {
        let acceptor = match &self.descriptor.transport {
            Transport::Plain => None,
            Transport::Tls { cert, key } => {
                let credential = ServerCredential::load(cert, key)?;
                Some(TlsAcceptor::from(server_config(&credential)?))
            }
        };

        let address = self.descriptor.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| Error::Listener(format!("failed to bind {}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;
        log_info!("{} listen at {}", self.descriptor.transport.name(), local_addr);

        Ok(BoundListener {
            listener,
            local_addr,
            transport: self.descriptor.transport.name(),
            acceptor,
            handler: self.handler,
            session: self.session,
        })
    }

    /// Bind and serve until the listener fails.
    pub async fn start(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

/// A bound socket ready to accept connections
pub struct BoundListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    transport: &'static str,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
    session: SessionSettings,
}

impl BoundListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, one task per client session.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log_error!("{} listener on {} failed to accept: {}", self.transport, self.local_addr, e);
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", remote_addr, e);
            }

            let acceptor = self.acceptor.clone();
            let handler = Arc::clone(&self.handler);
            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, remote_addr, acceptor, handler, session).await {
                    match e {
                        Error::ClientGone | Error::Io(_) => debug!("Connection from {} ended: {}", remote_addr, e),
                        e => warn!("Connection from {} failed: {}", remote_addr, e),
                    }
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
    session: SessionSettings,
) -> Result<()> {
    let io: Box<dyn Io> = match acceptor {
        None => Box::new(stream),
        Some(acceptor) => {
            let tls_stream = timeout(session.header_read_timeout, acceptor.accept(stream))
                .await?
                .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", remote_addr, e)))?;
            debug!("TLS handshake completed for {}", remote_addr);
            Box::new(tls_stream)
        }
    };

    serve_connection(io, remote_addr, handler.as_ref(), &session).await
}
