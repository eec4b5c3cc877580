//! Live configuration store for target rules.
//!
//! This crate provides:
//! - An in-memory rule cache handing out independent [`Snapshot`] copies
//! - Write-through add/delete against a durable [`backend::RuleBackend`]
//! - A background change listener that reloads the cache whenever the
//!   backing store announces a change on its notification channel
//! - Open/close lifecycle management via [`TargetStore`]

pub mod backend;
pub mod cache;
pub mod error;
pub mod listener;
pub mod store;
pub mod types;

pub use backend::memory::MemoryBackend;
pub use backend::postgres::PgRuleBackend;
pub use backend::{ChangeNotice, ChangeSubscription, RuleBackend};
pub use error::{BackendError, TargetStoreError};
pub use listener::{ListenerPhase, ListenerStatus};
pub use store::{StoreOptions, TargetStore};
pub use types::{Rule, RuleKind, Snapshot};
