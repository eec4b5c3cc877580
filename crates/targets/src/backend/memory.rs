//! Process-local backend with the same contract as the Postgres one.
//!
//! Used by the test suites and by `TARGETS_BACKEND=memory` for ephemeral
//! single-process runs. Change notices fan out over a broadcast channel;
//! a receiver that lagged behind treats the gap as one coalesced change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{ChangeNotice, ChangeSubscription, RuleBackend};
use crate::error::BackendError;
use crate::types::{Rule, RuleKind};

const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
enum Signal {
    Changed(&'static str),
    /// Drop every subscriber connection that exists right now.
    Sever,
}

#[derive(Debug)]
pub struct MemoryBackend {
    rows: Mutex<HashMap<Uuid, Rule>>,
    signals: broadcast::Sender<Signal>,
    available: AtomicBool,
    closed: AtomicBool,
    subscribes: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            rows: Mutex::new(HashMap::new()),
            signals,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            subscribes: AtomicUsize::new(0),
        }
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<Uuid, Rule>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Unavailable("backend closed".to_string()));
        }
        if !self.available.load(Ordering::Acquire) {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn notify(&self, op: &'static str) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.signals.send(Signal::Changed(op));
    }

    /// Insert a row as another process would: bypassing any store, but
    /// still announcing the change.
    pub fn insert_external(&self, kind: RuleKind, hosts: Vec<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.rows().insert(id, Rule::new(kind, hosts));
        self.notify("INSERT");
        id
    }

    /// Delete a row as another process would.
    pub fn delete_external(&self, id: Uuid) -> bool {
        let existed = self.rows().remove(&id).is_some();
        self.notify("DELETE");
        existed
    }

    /// Simulate the database going away (`false`) or coming back (`true`).
    /// Going away also drops every open subscriber connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        if !available {
            self.sever_subscribers();
        }
    }

    /// Drop every currently open subscriber connection.
    pub fn sever_subscribers(&self) {
        let _ = self.signals.send(Signal::Sever);
    }

    /// Number of successful `subscribe` calls so far.
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::Acquire)
    }

    pub fn row_count(&self) -> usize {
        self.rows().len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.rows().contains_key(&id)
    }
}

#[async_trait]
impl RuleBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, kind: RuleKind, hosts: &[String]) -> Result<Uuid, BackendError> {
        self.check_available()?;
        let id = Uuid::new_v4();
        self.rows().insert(id, Rule::new(kind, hosts.to_vec()));
        self.notify("INSERT");
        Ok(id)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, BackendError> {
        self.check_available()?;
        let existed = self.rows().remove(&id).is_some();
        self.notify("DELETE");
        Ok(existed)
    }

    async fn load_all(&self) -> Result<Vec<(Uuid, Rule)>, BackendError> {
        self.check_available()?;
        Ok(self
            .rows()
            .iter()
            .map(|(id, rule)| (*id, rule.clone()))
            .collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeSubscription>, BackendError> {
        self.check_available()?;
        self.subscribes.fetch_add(1, Ordering::AcqRel);
        debug!(channel, "memory subscriber attached");
        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            signals: self.signals.subscribe(),
            severed: false,
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sever_subscribers();
    }
}

struct MemorySubscription {
    channel: String,
    signals: broadcast::Receiver<Signal>,
    /// A sever consumed by `next_buffered`, reported on the next `recv`.
    severed: bool,
}

impl MemorySubscription {
    fn notice(&self, payload: String) -> ChangeNotice {
        ChangeNotice {
            channel: self.channel.clone(),
            payload,
        }
    }
}

#[async_trait]
impl ChangeSubscription for MemorySubscription {
    async fn recv(&mut self) -> Result<ChangeNotice, BackendError> {
        if self.severed {
            return Err(BackendError::Unavailable(
                "subscriber connection severed".to_string(),
            ));
        }
        match self.signals.recv().await {
            Ok(Signal::Changed(op)) => Ok(self.notice(op.to_string())),
            Ok(Signal::Sever) => {
                self.severed = true;
                Err(BackendError::Unavailable(
                    "subscriber connection severed".to_string(),
                ))
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Ok(self.notice(format!("lagged:{missed}")))
            }
            Err(broadcast::error::RecvError::Closed) => Err(BackendError::Unavailable(
                "backend dropped".to_string(),
            )),
        }
    }

    fn next_buffered(&mut self) -> Option<ChangeNotice> {
        if self.severed {
            return None;
        }
        match self.signals.try_recv() {
            Ok(Signal::Changed(op)) => Some(self.notice(op.to_string())),
            Ok(Signal::Sever) => {
                self.severed = true;
                None
            }
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(self.notice(format!("lagged:{missed}")))
            }
            Err(_) => None,
        }
    }

    async fn close(self: Box<Self>) {}
}
