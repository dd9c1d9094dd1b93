//! TLS support: listener credentials and rustls configurations

pub mod config;
pub mod credential;

pub use config::*;
pub use credential::*;
