// mariadbtool/src/backup/session_guard.rs
//! Lifts the server's statement timeout for the length of a dump.
//!
//! `max_statement_time` is server-global, so overlapping backups against one server share
//! a lease: the first holder records the original value and sets it to unlimited, later
//! holders only join, and the last one out restores the original.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::utils::server::ServerSession;

const UNLIMITED: f64 = 0.0;

struct Lease {
    holders: usize,
    original: f64,
}

/// Lease registry keyed by server identity. Construct one per process and share it.
#[derive(Default)]
pub struct SessionLeases {
    entries: Mutex<HashMap<String, Lease>>,
}

impl SessionLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionLeases::default())
    }

    async fn join(&self, server: &dyn ServerSession, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if let Some(lease) = entries.get_mut(key) {
            lease.holders += 1;
            debug!(server = key, holders = lease.holders, "Joined existing statement-time lease");
            return true;
        }

        let original = match server.max_statement_time().await {
            Ok(value) => value,
            Err(e) => {
                warn!(server = key, "Cannot read max_statement_time, continuing without lifting it: {:#}", e);
                return false;
            }
        };
        if let Err(e) = server.set_max_statement_time(UNLIMITED).await {
            warn!(server = key, "Cannot lift max_statement_time, continuing without it: {:#}", e);
            return false;
        }

        info!(server = key, original, "max_statement_time lifted for backup");
        entries.insert(key.to_string(), Lease { holders: 1, original });
        true
    }

    async fn leave(&self, server: &dyn ServerSession, key: &str) {
        let mut entries = self.entries.lock().await;
        let Some(lease) = entries.get_mut(key) else {
            return;
        };
        lease.holders -= 1;
        if lease.holders > 0 {
            debug!(server = key, holders = lease.holders, "Left statement-time lease");
            return;
        }
        let original = lease.original;
        entries.remove(key);

        match server.set_max_statement_time(original).await {
            Ok(()) => info!(server = key, original, "max_statement_time restored"),
            Err(e) => warn!(server = key, original, "Failed to restore max_statement_time: {:#}", e),
        }
    }
}

pub struct SessionGuard {
    server: Arc<dyn ServerSession>,
    leases: Arc<SessionLeases>,
    key: String,
    active: bool,
}

impl SessionGuard {
    /// Never fails: if the setting can't be read or changed the guard is inert.
    pub async fn acquire(server: Arc<dyn ServerSession>, leases: Arc<SessionLeases>) -> Self {
        let key = server.identity();
        let active = leases.join(server.as_ref(), &key).await;
        SessionGuard {
            server,
            leases,
            key,
            active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub async fn release(mut self) {
        if self.active {
            self.active = false;
            self.leases.leave(self.server.as_ref(), &self.key).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let server = self.server.clone();
        let leases = self.leases.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(server = %key, "Session guard dropped without release; restoring in background");
                handle.spawn(async move {
                    leases.leave(server.as_ref(), &key).await;
                });
            }
            Err(_) => warn!(server = %key, "Session guard dropped outside a runtime; max_statement_time not restored"),
        }
    }
}
