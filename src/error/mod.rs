//! Error handling module for the proxy server

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the proxy server
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The peer sent bytes that are not valid HTTP/1.x.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    /// The origin failed after part of its response was relayed.
    #[error("Upstream aborted mid-response: {0}")]
    UpstreamAborted(String),

    #[error("Client disconnected")]
    ClientGone,

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("All {0} listener(s) failed")]
    AllListenersFailed(usize),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),
}

/// Result type for the proxy server
pub type Result<T> = std::result::Result<T, Error>;
