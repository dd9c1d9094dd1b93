//! Request-processing stage of the proxy pipeline

use crate::error::Result;
use crate::proxy::exchange::Exchange;
use async_trait::async_trait;
use std::sync::Arc;

/// A stage in the handler chain.
///
/// Stages compose by wrapping: the request logger wraps the auth gate, which
/// wraps the proxy engine. Returning `Err` tells the session the connection
/// is no longer usable and must be dropped without a response.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()>;
}

#[async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        (**self).handle(exchange).await
    }
}
