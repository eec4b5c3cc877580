//! In-memory rule cache.
//!
//! The lock guards plain data only and is never held across an `.await`:
//! readers copy under it, writers mutate under it after their database
//! round trip has committed.
//!
//! Full reloads are serialised through `reload_gate`. While a reload's round
//! trip is in flight, local mutations are journaled and re-applied on top of
//! the loaded rows before the swap, so a reload that read the database before
//! a local write committed cannot roll that write back.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::backend::RuleBackend;
use crate::error::BackendError;
use crate::types::{Rule, Snapshot};

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Uuid, Rule>,
    /// Local mutations applied since the in-flight reload started.
    journal: Vec<(Uuid, Option<Rule>)>,
    reload_in_flight: bool,
}

#[derive(Debug, Default)]
pub struct RuleCache {
    inner: RwLock<Inner>,
    reload_gate: tokio::sync::Mutex<()>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Independent copy of every entry.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.read();
        let rules: HashMap<String, Rule> = inner
            .entries
            .iter()
            .map(|(id, rule)| (id.to_string(), rule.clone()))
            .collect();
        Snapshot::from(rules)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Insert (`Some`) or remove (`None`) one entry atomically.
    pub fn apply(&self, id: Uuid, change: Option<Rule>) {
        let mut inner = self.write();
        if inner.reload_in_flight {
            inner.journal.push((id, change.clone()));
        }
        apply_entry(&mut inner.entries, id, change);
    }

    /// Load every row from `backend` and swap it in. Returns the entry count.
    ///
    /// On error the cache is left as it was.
    pub async fn reload_from(&self, backend: &dyn RuleBackend) -> Result<usize, BackendError> {
        let _gate = self.reload_gate.lock().await;
        let ticket = ReloadTicket::begin(self);
        let rows = backend.load_all().await?;
        Ok(ticket.finish(rows))
    }
}

fn apply_entry(entries: &mut HashMap<Uuid, Rule>, id: Uuid, change: Option<Rule>) {
    match change {
        Some(rule) => {
            entries.insert(id, rule);
        }
        None => {
            entries.remove(&id);
        }
    }
}

/// Marks a reload as in flight; dropping it unfinished (error or
/// cancellation) stops journaling without touching the entries.
struct ReloadTicket<'a> {
    cache: &'a RuleCache,
}

impl<'a> ReloadTicket<'a> {
    fn begin(cache: &'a RuleCache) -> Self {
        let mut inner = cache.write();
        inner.reload_in_flight = true;
        inner.journal.clear();
        Self { cache }
    }

    fn finish(self, rows: Vec<(Uuid, Rule)>) -> usize {
        let mut inner = self.cache.write();
        let mut entries: HashMap<Uuid, Rule> = rows.into_iter().collect();
        for (id, change) in std::mem::take(&mut inner.journal) {
            apply_entry(&mut entries, id, change);
        }
        inner.entries = entries;
        // The guard is released before `self` drops and clears the flag.
        inner.entries.len()
    }
}

impl Drop for ReloadTicket<'_> {
    fn drop(&mut self) {
        let mut inner = self.cache.write();
        inner.reload_in_flight = false;
        inner.journal.clear();
    }
}
