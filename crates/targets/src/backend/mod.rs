//! Backing-store seam for target rules.
//!
//! A [`RuleBackend`] is the durable source of truth: it persists rules,
//! reads them all back, and opens dedicated subscriber connections that
//! yield a [`ChangeNotice`] whenever any writer (in this process or another)
//! changes the rule set.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BackendError;
use crate::types::{Rule, RuleKind};

/// "Something changed" signal received on the notification channel.
///
/// The payload is informational only; receivers always do a full reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub channel: String,
    pub payload: String,
}

/// Durable store for target rules.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    /// Human-readable backend name (used in logging).
    fn name(&self) -> &str;

    /// Persist a new rule in a single transaction and return its generated id.
    async fn insert(&self, kind: RuleKind, hosts: &[String]) -> Result<Uuid, BackendError>;

    /// Delete a rule by id. Returns whether a row existed.
    async fn delete(&self, id: Uuid) -> Result<bool, BackendError>;

    /// Read every current rule.
    async fn load_all(&self) -> Result<Vec<(Uuid, Rule)>, BackendError>;

    /// Open a dedicated subscriber connection listening on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeSubscription>, BackendError>;

    /// Release pooled connections. Safe to call more than once.
    async fn close(&self);
}

/// A long-lived subscriber connection to the notification channel.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Wait for the next notice. An `Err` means the connection is gone and
    /// this subscription must be discarded.
    async fn recv(&mut self) -> Result<ChangeNotice, BackendError>;

    /// A notice that has already arrived, without waiting for the network.
    /// Used to fold a burst of notices into one reload.
    fn next_buffered(&mut self) -> Option<ChangeNotice> {
        None
    }

    /// Release the dedicated connection.
    async fn close(self: Box<Self>);
}
