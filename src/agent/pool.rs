//! Idle connection pool keyed by target.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::tunnel::{Connection, Target};

/// Idle connections kept per target when no cap is given.
pub const DEFAULT_MAX_IDLE_PER_TARGET: usize = 4;

/// Holds idle connections for reuse.
///
/// Connections are returned LIFO so the most recently used socket, the one
/// least likely to have been closed by the far end, goes out first.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<Target, Vec<Connection>>>,
    max_idle_per_target: usize,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_PER_TARGET)
    }
}

impl ConnectionPool {
    pub fn new(max_idle_per_target: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_target,
        }
    }

    pub fn max_idle_per_target(&self) -> usize {
        self.max_idle_per_target
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, HashMap<Target, Vec<Connection>>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take an idle connection for `target`, if one is pooled.
    pub fn checkout(&self, target: &Target) -> Option<Connection> {
        let mut idle = self.idle();
        let conns = idle.get_mut(target)?;
        let conn = conns.pop();
        if conns.is_empty() {
            idle.remove(target);
        }
        if conn.is_some() {
            debug!("Reusing pooled connection to {}", target);
        }
        conn
    }

    /// Return a connection to the pool.
    ///
    /// Hands the connection back if the target is already at its idle cap.
    pub fn checkin(&self, conn: Connection) -> Option<Connection> {
        if self.max_idle_per_target == 0 {
            return Some(conn);
        }
        let mut idle = self.idle();
        let conns = idle.entry(conn.target().clone()).or_default();
        if conns.len() >= self.max_idle_per_target {
            return Some(conn);
        }
        conns.push(conn);
        None
    }

    /// Idle connections for `target`.
    pub fn idle_count(&self, target: &Target) -> usize {
        self.idle().get(target).map_or(0, Vec::len)
    }

    pub fn total_idle(&self) -> usize {
        self.idle().values().map(Vec::len).sum()
    }

    /// Shut down and drop every idle connection.
    ///
    /// All connections are shut down even if some fail; the first error is
    /// returned.
    pub async fn close_all(&self) -> std::io::Result<usize> {
        let drained: Vec<Connection> = self.idle().drain().flat_map(|(_, c)| c).collect();
        let count = drained.len();

        let mut first_err = None;
        for mut conn in drained {
            match conn.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                Err(e) => {
                    debug!("Error closing connection to {}: {}", conn.target(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }
}
