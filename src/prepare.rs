//! Automatic prepared-statement management.
//!
//! Statements are executed unnamed until the same query (keyed by its text
//! and parameter types) has run `threshold` times; from then on it is
//! prepared under a generated server-side name and reused. At most
//! `max_size` entries are tracked; evicted names are deallocated lazily
//! through a maintenance queue the connection drains between operations,
//! since cache rotation can happen while a result is still being consumed.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::transport::Oid;

/// Cache key: the statement text plus the declared parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub query: String,
    pub types: Vec<Oid>,
}

impl StatementKey {
    pub fn new(query: impl Into<String>, types: impl Into<Vec<Oid>>) -> Self {
        Self {
            query: query.into(),
            types: types.into(),
        }
    }
}

/// How the next execution of a statement should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Execute unnamed.
    No,
    /// Already prepared under this name; bind and execute it.
    Yes(String),
    /// Seen often enough: prepare under this name, then execute it.
    Should(String),
}

/// Deferred cleanup for statements evicted from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Maintenance {
    /// Deallocate one server-side statement.
    Deallocate(String),
    /// Deallocate every server-side statement.
    DeallocateAll,
}

/// Tracks statement usage and decides when to switch to prepared execution.
pub struct PrepareManager {
    /// Executions after which a statement is prepared; `None` disables.
    threshold: Option<usize>,
    max_size: NonZeroUsize,
    counts: LruCache<StatementKey, usize>,
    names: LruCache<StatementKey, String>,
    maintenance: Vec<Maintenance>,
    next_index: usize,
}

impl PrepareManager {
    pub fn new(threshold: Option<usize>, max_size: NonZeroUsize) -> Self {
        Self {
            threshold,
            max_size,
            // Rotation is handled by hand so eviction can queue cleanup.
            counts: LruCache::unbounded(),
            names: LruCache::unbounded(),
            maintenance: Vec::new(),
            next_index: 0,
        }
    }

    pub fn threshold(&self) -> Option<usize> {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: Option<usize>) {
        self.threshold = threshold;
    }

    /// Decide how to send a statement. Does not record the execution;
    /// call [`Self::seen`] once the statement actually ran.
    pub fn get(&mut self, key: &StatementKey) -> Decision {
        let Some(threshold) = self.threshold else {
            return Decision::No;
        };
        if let Some(name) = self.names.peek(key) {
            return Decision::Yes(name.clone());
        }
        let count = self.counts.peek(key).copied().unwrap_or(0);
        if count + 1 >= threshold.max(1) {
            let name = format!("_pg_stmt_{}", self.next_index);
            self.next_index += 1;
            Decision::Should(name)
        } else {
            Decision::No
        }
    }

    /// Decision for a statement the caller insists on preparing,
    /// regardless of the execution count.
    pub fn force(&mut self, key: &StatementKey) -> Decision {
        if let Some(name) = self.names.peek(key) {
            return Decision::Yes(name.clone());
        }
        let name = format!("_pg_stmt_{}", self.next_index);
        self.next_index += 1;
        Decision::Should(name)
    }

    /// Record one successful execution sent according to `decision`.
    ///
    /// A prepare may fail server-side; only register the name once the
    /// execution came back without error.
    pub fn seen(&mut self, key: StatementKey, decision: &Decision) {
        match decision {
            Decision::No => {
                if self.threshold.is_none() {
                    return;
                }
                let count = self.counts.peek(&key).copied().unwrap_or(0);
                self.counts.put(key, count + 1);
                self.rotate_counts();
            }
            Decision::Should(name) => {
                debug!(statement = %name, "statement promoted to prepared");
                self.counts.pop(&key);
                self.names.put(key, name.clone());
                self.rotate_names();
            }
            Decision::Yes(_) => {
                self.names.get(&key);
            }
        }
    }

    fn rotate_counts(&mut self) {
        while self.counts.len() > self.max_size.get()
            && let Some((key, _)) = self.counts.pop_lru()
        {
            debug!(query = %key.query, "statement usage record evicted");
        }
    }

    fn rotate_names(&mut self) {
        while self.names.len() > self.max_size.get()
            && let Some((_, name)) = self.names.pop_lru()
        {
            debug!(statement = %name, "prepared statement evicted");
            self.maintenance.push(Maintenance::Deallocate(name));
        }
    }

    /// Forget every prepared statement and queue their deallocation.
    pub fn clear(&mut self) {
        self.counts.clear();
        if !self.names.is_empty() {
            self.names.clear();
            self.maintenance.clear();
            self.maintenance.push(Maintenance::DeallocateAll);
        }
    }

    /// Drop all bookkeeping without queuing cleanup; for a fresh session
    /// where the server no longer knows our names.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.names.clear();
        self.maintenance.clear();
    }

    /// Take the pending cleanup commands.
    pub fn take_maintenance(&mut self) -> Vec<Maintenance> {
        std::mem::take(&mut self.maintenance)
    }
}
