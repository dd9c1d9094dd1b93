//! Listener supervisor: runs every configured listener until all of them return

use crate::config::StartupPlan;
use crate::error::{Error, Result};
use crate::proxy::auth::BasicAuth;
use crate::proxy::engine::ProxyEngine;
use crate::proxy::handler::Handler;
use crate::proxy::logger::RequestLogger;
use crate::proxy::server::ProxyServer;
use crate::proxy::upstream::Upstream;
use crate::{log_error, log_info, log_warning};
use futures::future::join_all;
use std::sync::Arc;

/// Compose the handler chain: request logger, then the auth gate when configured, then the engine.
pub fn build_handler(plan: &StartupPlan) -> Arc<dyn Handler> {
    let engine = ProxyEngine::new(Arc::new(Upstream::new(plan.upstream.clone())));
    match &plan.auth {
        Some(credentials) => {
            log_info!("Proxy authentication enabled for user {}", credentials.username);
            Arc::new(RequestLogger::new(BasicAuth::new(engine, credentials.clone())))
        }
        None => Arc::new(RequestLogger::new(engine)),
    }
}

/// Start one task per listener and wait for all of them.
///
/// Listeners are independent: one failing to bind or serve is logged and
/// leaves the others running. Fails only when every listener failed.
pub async fn run(plan: StartupPlan) -> Result<()> {
    let handler = build_handler(&plan);

    let tasks = plan.listeners.iter().cloned().map(|descriptor| {
        let name = format!("{} listener on {}", descriptor.transport.name(), descriptor.address());
        let server = ProxyServer::new(descriptor, Arc::clone(&handler), plan.session.clone());
        let task = tokio::spawn(server.start());
        async move { (name, task.await) }
    });

    let results = join_all(tasks).await;
    let total = results.len();
    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(Ok(())) => {
                log_info!("{} stopped", name);
            }
            Ok(Err(e)) => {
                failed += 1;
                log_error!("{} failed: {}", name, e);
            }
            Err(e) => {
                failed += 1;
                log_error!("{} aborted: {}", name, e);
            }
        }
    }

    if failed == total {
        return Err(Error::AllListenersFailed(total));
    }
    if failed > 0 {
        log_warning!("{} of {} listener(s) failed", failed, total);
    }
    Ok(())
}
