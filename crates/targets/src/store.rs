//! `TargetStore`: cache + write-through mutations + change listener, with an
//! explicit open/close lifecycle.
//!
//! The store is an ordinary value shared by `Arc`; every collaborator that
//! needs the rules gets a handle to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cartograph_core::config::{BackendKind, TargetsConfig};
use cartograph_core::Config;

use crate::backend::memory::MemoryBackend;
use crate::backend::postgres::PgRuleBackend;
use crate::backend::RuleBackend;
use crate::cache::RuleCache;
use crate::error::TargetStoreError;
use crate::listener::{Backoff, ChangeListener, ListenerPhase, ListenerStatus, SharedStatus};
use crate::types::{Rule, RuleKind, Snapshot};

/// Listener and shutdown tuning for [`TargetStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Notification channel to `LISTEN` on.
    pub channel: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// How long `close` waits for the listener before aborting it.
    pub close_grace: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            channel: "targets_changed".to_string(),
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
            close_grace: Duration::from_secs(5),
        }
    }
}

impl From<&TargetsConfig> for StoreOptions {
    fn from(config: &TargetsConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            close_grace: config.close_grace(),
        }
    }
}

/// Live view of the target rules, kept in sync with the backing store.
pub struct TargetStore {
    backend: Arc<dyn RuleBackend>,
    cache: Arc<RuleCache>,
    shutdown: Arc<Notify>,
    listener: Mutex<Option<JoinHandle<()>>>,
    status: SharedStatus,
    closed: AtomicBool,
    close_grace: Duration,
}

impl std::fmt::Debug for TargetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetStore")
            .field("backend", &self.backend.name())
            .field("rules", &self.cache.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl TargetStore {
    /// Build the backend selected by `config` and open a store on it.
    pub async fn connect(config: &Config) -> Result<Self, TargetStoreError> {
        config.validate()?;
        let backend: Arc<dyn RuleBackend> = match config.targets.backend_kind()? {
            BackendKind::Postgres => Arc::new(
                PgRuleBackend::connect(&config.postgres, config.targets.run_migrations)
                    .await
                    .map_err(TargetStoreError::Connection)?,
            ),
            BackendKind::Memory => {
                warn!("using the in-memory target backend; rules will not survive a restart");
                Arc::new(MemoryBackend::new())
            }
        };
        Self::open(backend, StoreOptions::from(&config.targets)).await
    }

    /// Subscribe, load every rule, then start the change listener.
    ///
    /// The subscription is opened before the initial load so that a change
    /// committed in between still produces a notice. When this returns,
    /// [`get_all`](Self::get_all) already reflects the backing store.
    pub async fn open(
        backend: Arc<dyn RuleBackend>,
        options: StoreOptions,
    ) -> Result<Self, TargetStoreError> {
        let subscription = match backend.subscribe(&options.channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                backend.close().await;
                return Err(TargetStoreError::Connection(e));
            }
        };

        let cache = Arc::new(RuleCache::new());
        let count = match cache.reload_from(backend.as_ref()).await {
            Ok(count) => count,
            Err(e) => {
                subscription.close().await;
                backend.close().await;
                return Err(TargetStoreError::Connection(e));
            }
        };

        let status = SharedStatus::default();
        status.record_reload();
        status.set_phase(ListenerPhase::Listening);

        let shutdown = Arc::new(Notify::new());
        let listener = ChangeListener {
            backend: Arc::clone(&backend),
            cache: Arc::clone(&cache),
            channel: options.channel.clone(),
            backoff: Backoff::new(options.backoff_initial, options.backoff_max),
            shutdown: Arc::clone(&shutdown),
            status: status.clone(),
        };
        let handle = tokio::spawn(listener.run(Some(subscription)));

        info!(
            backend = backend.name(),
            channel = %options.channel,
            rules = count,
            "target store opened"
        );

        Ok(Self {
            backend,
            cache,
            shutdown,
            listener: Mutex::new(Some(handle)),
            status,
            closed: AtomicBool::new(false),
            close_grace: options.close_grace,
        })
    }

    /// Independent copy of every rule. Never waits on I/O.
    ///
    /// Still answers after `close`, with the last known rules.
    pub fn get_all(&self) -> Snapshot {
        self.cache.snapshot()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Persist a new rule and make it visible to this process immediately.
    pub async fn add(
        &self,
        kind: RuleKind,
        hosts: Vec<String>,
    ) -> Result<String, TargetStoreError> {
        self.ensure_open()?;
        validate_hosts(&hosts)?;

        let id = self
            .backend
            .insert(kind, &hosts)
            .await
            .map_err(TargetStoreError::Persistence)?;
        info!(%id, %kind, hosts = hosts.len(), "target rule added");
        self.cache.apply(id, Some(Rule::new(kind, hosts)));
        Ok(id.to_string())
    }

    /// Delete a rule by id.
    ///
    /// Unknown and malformed ids are not errors: no row can match them.
    pub async fn delete(&self, id: &str) -> Result<(), TargetStoreError> {
        self.ensure_open()?;

        let Ok(uuid) = Uuid::parse_str(id) else {
            debug!(id, "ignoring delete of malformed target id");
            return Ok(());
        };
        let existed = self
            .backend
            .delete(uuid)
            .await
            .map_err(TargetStoreError::Persistence)?;
        self.cache.apply(uuid, None);

        if existed {
            info!(id = %uuid, "target rule deleted");
        } else {
            debug!(id = %uuid, "delete of unknown target id");
        }
        Ok(())
    }

    /// Replace the cache with a fresh read of the backing store.
    pub async fn reload(&self) -> Result<usize, TargetStoreError> {
        self.ensure_open()?;
        let count = self
            .cache
            .reload_from(self.backend.as_ref())
            .await
            .map_err(TargetStoreError::Persistence)?;
        self.status.record_reload();
        info!(rules = count, "target rules reloaded on request");
        Ok(count)
    }

    pub fn listener_status(&self) -> ListenerStatus {
        self.status.get()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the change listener and release every connection.
    ///
    /// Waits for the listener up to the configured grace period, then
    /// aborts it. Calling `close` again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("target store already closed");
            return;
        }

        self.shutdown.notify_one();
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.close_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "change listener task failed"),
                Err(_) => {
                    warn!(
                        grace = ?self.close_grace,
                        "change listener did not stop in time; aborting"
                    );
                    handle.abort();
                    self.status.set_phase(ListenerPhase::Stopped);
                }
            }
        }

        self.backend.close().await;
        info!(backend = self.backend.name(), "target store closed");
    }

    fn ensure_open(&self) -> Result<(), TargetStoreError> {
        if self.is_closed() {
            return Err(TargetStoreError::Closed);
        }
        Ok(())
    }
}

impl Drop for TargetStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown.notify_one();
        }
    }
}

/// Hosts must be non-empty and contain no blank entries. They are otherwise
/// stored exactly as given.
fn validate_hosts(hosts: &[String]) -> Result<(), TargetStoreError> {
    if hosts.is_empty() {
        return Err(TargetStoreError::Validation(
            "hosts must contain at least one entry".to_string(),
        ));
    }
    if let Some(pos) = hosts.iter().position(|h| h.trim().is_empty()) {
        return Err(TargetStoreError::Validation(format!(
            "hosts[{pos}] is blank"
        )));
    }
    Ok(())
}
