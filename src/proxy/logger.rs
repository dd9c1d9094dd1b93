//! Per-request access logging

use crate::error::Result;
use crate::proxy::exchange::Exchange;
use crate::proxy::handler::Handler;
use async_trait::async_trait;
use tracing::info;

/// Emits `<remote> <method> <target>` for every request before delegating.
pub struct RequestLogger<H> {
    inner: H,
}

impl<H: Handler> RequestLogger<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Handler> Handler for RequestLogger<H> {
    async fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        info!("{} {} {}", exchange.remote_addr(), exchange.method(), exchange.target());
        self.inner.handle(exchange).await
    }
}
