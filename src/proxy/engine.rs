//! The proxy engine: classifies each request and dispatches it to forward or tunnel mode

use crate::error::Result;
use crate::proxy::exchange::Exchange;
use crate::proxy::forward::{forward, ForwardTarget};
use crate::proxy::handler::Handler;
use crate::proxy::tunnel::tunnel;
use crate::proxy::upstream::Upstream;
use crate::utils::parse_connect_target;
use async_trait::async_trait;
use hyper::{Method, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// How the engine will serve a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMode {
    Tunnel { host: String, port: u16 },
    Forward(ForwardTarget),
    /// Answer 400 with the given reason
    Reject(String),
}

pub fn classify(method: &Method, target: &str) -> RequestMode {
    if method == Method::CONNECT {
        return match parse_connect_target(target) {
            Ok((host, port)) => RequestMode::Tunnel { host, port },
            Err(reason) => RequestMode::Reject(reason),
        };
    }
    match ForwardTarget::parse(target) {
        Ok(forward_target) => RequestMode::Forward(forward_target),
        Err(reason) => RequestMode::Reject(reason),
    }
}

/// Innermost pipeline stage
pub struct ProxyEngine {
    upstream: Arc<Upstream>,
}

impl ProxyEngine {
    pub fn new(upstream: Arc<Upstream>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl Handler for ProxyEngine {
    async fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        match classify(exchange.method(), exchange.target()) {
            RequestMode::Tunnel { host, port } => tunnel(&self.upstream, exchange, &host, port).await,
            RequestMode::Forward(target) => forward(&self.upstream, exchange, target).await,
            RequestMode::Reject(reason) => {
                debug!("Rejecting {} {}: {}", exchange.method(), exchange.target(), reason);
                exchange.close_after_response();
                exchange.respond_text(StatusCode::BAD_REQUEST, &reason).await
            }
        }
    }
}
