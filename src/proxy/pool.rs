//! Idle upstream connection pool

use crate::proxy::exchange::Connection;
use crate::proxy::upstream::UpstreamKey;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tracing::debug;

struct IdleConnection {
    conn: Connection,
    idle_since: Instant,
}

type IdleMap = HashMap<UpstreamKey, Vec<IdleConnection>>;

/// Keeps idle keep-alive connections per origin.
///
/// A connection is owned exclusively by one exchange while in use and only
/// comes back here after a fully framed response.
pub struct ConnectionPool {
    idle: Mutex<IdleMap>,
    max_idle_per_host: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_host,
            idle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IdleMap> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the most recently used live connection for `key`, if any.
    pub fn checkout(&self, key: &UpstreamKey) -> Option<Connection> {
        loop {
            let candidate = {
                let mut idle = self.lock();
                sweep(&mut idle, self.idle_timeout);
                let entries = idle.get_mut(key)?;
                let candidate = entries.pop();
                if entries.is_empty() {
                    idle.remove(key);
                }
                candidate?
            };

            if candidate.idle_since.elapsed() >= self.idle_timeout {
                debug!("Dropping expired idle connection to {}", key);
                continue;
            }
            let mut conn = candidate.conn;
            if is_quiet(&mut conn) {
                debug!("Reusing idle connection to {}", key);
                return Some(conn);
            }
            debug!("Dropping stale idle connection to {}", key);
        }
    }

    /// Return a connection after a complete exchange.
    pub fn checkin(&self, key: UpstreamKey, conn: Connection) {
        if self.max_idle_per_host == 0 {
            return;
        }
        let mut idle = self.lock();
        sweep(&mut idle, self.idle_timeout);
        let entries = idle.entry(key).or_default();
        if entries.len() >= self.max_idle_per_host {
            entries.remove(0);
        }
        entries.push(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Close every expired connection, across all origins.
    pub fn prune_expired(&self) -> usize {
        sweep(&mut self.lock(), self.idle_timeout)
    }

    /// Run [`prune_expired`](Self::prune_expired) every idle timeout until the pool is dropped.
    pub fn spawn_reaper(pool: &Arc<Self>) {
        if pool.max_idle_per_host == 0 || pool.idle_timeout.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let period = pool.idle_timeout;
        let pool = Arc::downgrade(pool);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        let dropped = pool.prune_expired();
                        if dropped > 0 {
                            debug!("Closed {} expired idle connection(s)", dropped);
                        }
                    }
                    None => break,
                }
            }
        });
    }

    pub fn idle_count(&self, key: &UpstreamKey) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    pub fn total_idle(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

/// Drop expired connections and the origins left without any.
fn sweep(idle: &mut IdleMap, idle_timeout: Duration) -> usize {
    let mut dropped = 0;
    idle.retain(|_, entries| {
        let before = entries.len();
        entries.retain(|entry| entry.idle_since.elapsed() < idle_timeout);
        dropped += before - entries.len();
        !entries.is_empty()
    });
    dropped
}

/// An idle connection is usable only if reading from it would block:
/// EOF, errors and unsolicited bytes all disqualify it.
fn is_quiet(conn: &mut Connection) -> bool {
    conn.fill_buf().now_or_never().is_none()
}
