//! Outbound connections to origin servers

use crate::config::UpstreamSettings;
use crate::error::{Error, Result};
use crate::proxy::exchange::{buffered, Connection};
use crate::proxy::pool::ConnectionPool;
use crate::tls::client_config;
use rustls::{ClientConfig, ServerName};
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Identity of an origin for connection reuse
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamKey {
    pub scheme: Scheme,
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
}

impl fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

/// A connection checked out for one upstream exchange
pub struct UpstreamConnection {
    pub conn: Connection,
    /// Whether the connection came from the idle pool
    pub reused: bool,
}

/// Dials origins and recycles keep-alive connections
pub struct Upstream {
    settings: UpstreamSettings,
    pool: Arc<ConnectionPool>,
    tls: TlsConnector,
}

impl Upstream {
    /// Upstream using the system trust store for `https` origins.
    pub fn new(settings: UpstreamSettings) -> Self {
        Self::with_tls_config(settings, client_config())
    }

    pub fn with_tls_config(settings: UpstreamSettings, tls_config: Arc<ClientConfig>) -> Self {
        let pool = Arc::new(ConnectionPool::new(settings.max_idle_per_host, settings.idle_timeout));
        ConnectionPool::spawn_reaper(&pool);
        Self {
            settings,
            pool,
            tls: TlsConnector::from(tls_config),
        }
    }

    /// Open a TCP connection within the dial timeout.
    pub async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = timeout(self.settings.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                Error::UpstreamConnection(format!(
                    "connecting to {}:{} timed out after {:?}",
                    host, port, self.settings.connect_timeout
                ))
            })?
            .map_err(|e| Error::UpstreamConnection(format!("connecting to {}:{} failed: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Reuse an idle connection to `key` or open a new one.
    pub async fn connect(&self, key: &UpstreamKey) -> Result<UpstreamConnection> {
        if let Some(conn) = self.pool.checkout(key) {
            return Ok(UpstreamConnection { conn, reused: true });
        }
        let conn = self.open(key).await?;
        Ok(UpstreamConnection { conn, reused: false })
    }

    /// Always open a new connection, bypassing the pool.
    pub async fn open(&self, key: &UpstreamKey) -> Result<Connection> {
        let stream = self.dial_tcp(&key.host, key.port).await?;
        match key.scheme {
            Scheme::Http => Ok(buffered(Box::new(stream))),
            Scheme::Https => {
                let server_name = ServerName::try_from(key.host.as_str())
                    .map_err(|_| Error::UpstreamConnection(format!("invalid TLS server name: {}", key.host)))?;
                let handshake = self.tls.connect(server_name, stream);
                let tls_stream = timeout(self.settings.connect_timeout, handshake)
                    .await
                    .map_err(|_| Error::UpstreamConnection(format!("TLS handshake with {} timed out", key)))?
                    .map_err(|e| Error::UpstreamConnection(format!("TLS handshake with {} failed: {}", key, e)))?;
                debug!("TLS established with {}", key);
                Ok(buffered(Box::new(tls_stream)))
            }
        }
    }

    /// Hand a connection back after a fully framed response.
    pub fn release(&self, key: UpstreamKey, conn: Connection) {
        self.pool.checkin(key, conn);
    }

    pub fn idle_connections(&self, key: &UpstreamKey) -> usize {
        self.pool.idle_count(key)
    }
}
