//! Proxy server module
//!
//! Request flow: a listener ([`server`]) accepts a connection, the session
//! loop ([`session`]) parses each request into an [`Exchange`], and the
//! handler chain ([`logger`], [`auth`], [`engine`]) serves it by forwarding
//! ([`forward`]) or tunneling ([`tunnel`]).

pub mod auth;
pub mod codec;
pub mod engine;
pub mod exchange;
pub mod forward;
pub mod handler;
pub mod logger;
pub mod pool;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod tunnel;
pub mod upstream;

pub use auth::{BasicAuth, Verifier, DEFAULT_REALM};
pub use engine::{classify, ProxyEngine, RequestMode};
pub use exchange::{Connection, Exchange, Io};
pub use handler::Handler;
pub use logger::RequestLogger;
pub use server::{BoundListener, ProxyServer};
pub use supervisor::{build_handler, run};
pub use upstream::{Scheme, Upstream, UpstreamKey};
