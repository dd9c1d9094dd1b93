//! httproxy - a forward HTTP/HTTPS proxy
//!
//! Relays absolute-form HTTP requests and tunnels CONNECT requests to origin
//! servers, optionally behind Basic proxy authentication, on a plaintext
//! listener and an optional TLS listener.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use config::{Credentials, ListenerDescriptor, ProxyConfig, StartupPlan, Transport};
pub use error::{Error, Result};
pub use logging::{init_logger, log_debug, log_error, log_info, log_warning};
pub use proxy::{BasicAuth, Handler, ProxyEngine, ProxyServer, RequestLogger};
