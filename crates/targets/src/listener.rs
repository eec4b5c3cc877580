//! Background change listener.
//!
//! One task per store holds a dedicated subscriber connection and runs a
//! small state machine:
//!
//! ```text
//! Connecting ──ok──▶ Listening ──connection lost──▶ Reconnecting ──▶ Connecting
//!     │ └─err─┐          │                                │
//!     │  (backoff)       │                                │
//!     └───────┴──────────┴──────── shutdown ──────────────┴──▶ Stopped
//! ```
//!
//! Every notice triggers a full reload of the cache; notices carry no
//! reliable description of what changed, so dropped, duplicated or
//! coalesced notices all heal on the next reload. Notices already queued
//! behind the one being handled are folded into the same reload. A failed
//! reload is retried on the backoff schedule until one succeeds. Every wait
//! (subscribe, receive, reload, backoff sleep) is raced against the shutdown
//! signal.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backend::{ChangeNotice, ChangeSubscription, RuleBackend};
use crate::cache::RuleCache;
use crate::error::BackendError;

/// Where the listener currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerPhase {
    Connecting,
    Listening,
    Reconnecting,
    Stopped,
}

/// Observable listener state, for health endpoints and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStatus {
    pub phase: ListenerPhase,
    /// Successful full reloads, including the initial load on open.
    pub reloads: u64,
    /// Times the subscriber connection was lost and re-established.
    pub reconnects: u64,
    pub last_reload_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ListenerStatus {
    fn default() -> Self {
        Self {
            phase: ListenerPhase::Connecting,
            reloads: 0,
            reconnects: 0,
            last_reload_at: None,
            last_error: None,
        }
    }
}

/// Status shared between the listener task and the store.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedStatus(Arc<RwLock<ListenerStatus>>);

impl SharedStatus {
    pub(crate) fn get(&self) -> ListenerStatus {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut ListenerStatus)) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub(crate) fn set_phase(&self, phase: ListenerPhase) {
        self.update(|s| s.phase = phase);
    }

    pub(crate) fn record_reload(&self) {
        self.update(|s| {
            s.reloads += 1;
            s.last_reload_at = Some(Utc::now());
        });
    }

    pub(crate) fn record_error(&self, error: impl ToString) {
        let error = error.to_string();
        self.update(|s| s.last_error = Some(error));
    }

    fn record_reconnect(&self) {
        self.update(|s| s.reconnects += 1);
    }
}

/// Exponential backoff, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum State {
    Connecting,
    /// Subscribed; `retry` holds the delay before re-attempting a failed reload.
    Listening {
        subscription: Box<dyn ChangeSubscription>,
        retry: Option<Duration>,
    },
    Reconnecting,
    Stopped,
}

enum Reload {
    Done,
    Failed,
    Interrupted,
}

enum Wake {
    Shutdown,
    Notice(Result<ChangeNotice, BackendError>),
    Retry,
}

pub(crate) struct ChangeListener {
    pub(crate) backend: Arc<dyn RuleBackend>,
    pub(crate) cache: Arc<RuleCache>,
    pub(crate) channel: String,
    pub(crate) backoff: Backoff,
    pub(crate) shutdown: Arc<Notify>,
    pub(crate) status: SharedStatus,
}

impl ChangeListener {
    /// Drive the state machine until shutdown is signalled.
    ///
    /// `initial` is a subscription opened (and already reloaded from) by
    /// the caller; without one the listener starts in `Connecting`.
    pub(crate) async fn run(mut self, initial: Option<Box<dyn ChangeSubscription>>) {
        let mut state = match initial {
            Some(subscription) => State::Listening {
                subscription,
                retry: None,
            },
            None => State::Connecting,
        };

        loop {
            state = match state {
                State::Connecting => self.connect().await,
                State::Listening {
                    subscription,
                    retry,
                } => self.listen(subscription, retry).await,
                State::Reconnecting => self.reconnect().await,
                State::Stopped => break,
            };
        }

        self.status.set_phase(ListenerPhase::Stopped);
        info!(channel = %self.channel, "change listener stopped");
    }

    async fn connect(&mut self) -> State {
        self.status.set_phase(ListenerPhase::Connecting);
        let subscribed = tokio::select! {
            _ = self.shutdown.notified() => return State::Stopped,
            result = self.backend.subscribe(&self.channel) => result,
        };

        match subscribed {
            Ok(subscription) => {
                info!(
                    channel = %self.channel,
                    backend = self.backend.name(),
                    "subscribed to change notifications"
                );
                self.backoff.reset();
                // Catch up on anything that changed while disconnected.
                let retry = match self.reload("resubscribed").await {
                    Reload::Done => None,
                    Reload::Failed => Some(self.backoff.next_delay()),
                    Reload::Interrupted => {
                        subscription.close().await;
                        return State::Stopped;
                    }
                };
                State::Listening {
                    subscription,
                    retry,
                }
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                warn!(
                    channel = %self.channel,
                    error = %e,
                    retry_in = ?delay,
                    "failed to subscribe to change notifications"
                );
                self.status.record_error(&e);
                if self.sleep(delay).await {
                    State::Connecting
                } else {
                    State::Stopped
                }
            }
        }
    }

    /// Wait for notices and reload on each one. While `retry` is set the
    /// cache is known to be stale and a reload is re-attempted after that
    /// delay even if no further notice arrives.
    async fn listen(
        &mut self,
        mut subscription: Box<dyn ChangeSubscription>,
        mut retry: Option<Duration>,
    ) -> State {
        self.status.set_phase(ListenerPhase::Listening);
        loop {
            let wake = tokio::select! {
                _ = self.shutdown.notified() => Wake::Shutdown,
                result = subscription.recv() => Wake::Notice(result),
                _ = retry_timer(retry) => Wake::Retry,
            };

            let reason = match wake {
                Wake::Shutdown => {
                    subscription.close().await;
                    return State::Stopped;
                }
                Wake::Notice(Ok(notice)) => {
                    // One reload covers every notice already queued behind this one.
                    let mut coalesced = 0usize;
                    while subscription.next_buffered().is_some() {
                        coalesced += 1;
                    }
                    debug!(
                        channel = %notice.channel,
                        payload = %notice.payload,
                        coalesced,
                        "change notice received"
                    );
                    "notified"
                }
                Wake::Notice(Err(e)) => {
                    warn!(
                        channel = %self.channel,
                        error = %e,
                        "change notification connection lost"
                    );
                    self.status.record_error(&e);
                    subscription.close().await;
                    return State::Reconnecting;
                }
                Wake::Retry => "retry",
            };

            retry = match self.reload(reason).await {
                Reload::Done => {
                    self.backoff.reset();
                    None
                }
                Reload::Failed => {
                    let delay = self.backoff.next_delay();
                    debug!(retry_in = ?delay, "reload will be retried");
                    Some(delay)
                }
                Reload::Interrupted => {
                    subscription.close().await;
                    return State::Stopped;
                }
            };
        }
    }

    async fn reconnect(&mut self) -> State {
        self.status.set_phase(ListenerPhase::Reconnecting);
        self.status.record_reconnect();
        let delay = self.backoff.next_delay();
        debug!(channel = %self.channel, delay = ?delay, "waiting before reconnecting");
        if self.sleep(delay).await {
            State::Connecting
        } else {
            State::Stopped
        }
    }

    /// Full reload of the cache, raced against shutdown.
    ///
    /// A failure is logged and recorded; the cache keeps its previous
    /// contents and the caller schedules a retry.
    async fn reload(&self, reason: &'static str) -> Reload {
        let reloaded = tokio::select! {
            _ = self.shutdown.notified() => return Reload::Interrupted,
            result = self.cache.reload_from(self.backend.as_ref()) => result,
        };

        match reloaded {
            Ok(count) => {
                self.status.record_reload();
                info!(reason, rules = count, "target rules reloaded");
                Reload::Done
            }
            Err(e) => {
                warn!(reason, error = %e, "target rule reload failed");
                self.status.record_error(&e);
                Reload::Failed
            }
        }
    }

    /// Sleep for `delay`. Returns `false` if shutdown interrupted it.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.notified() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Fires after `delay`, or never when no retry is pending.
async fn retry_timer(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::types::{Rule, RuleKind};

    const CHANNEL: &str = "targets_changed";

    /// Memory backend whose next `failures` full loads fail.
    #[derive(Default)]
    struct FlakyLoads {
        inner: MemoryBackend,
        failures: AtomicUsize,
    }

    impl FlakyLoads {
        fn fail_next_loads(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RuleBackend for FlakyLoads {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn insert(&self, kind: RuleKind, hosts: &[String]) -> Result<Uuid, BackendError> {
            self.inner.insert(kind, hosts).await
        }

        async fn delete(&self, id: Uuid) -> Result<bool, BackendError> {
            self.inner.delete(id).await
        }

        async fn load_all(&self) -> Result<Vec<(Uuid, Rule)>, BackendError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BackendError::Unavailable("transient".to_string()));
            }
            self.inner.load_all().await
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> Result<Box<dyn ChangeSubscription>, BackendError> {
            self.inner.subscribe(channel).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    fn listener(
        backend: Arc<dyn RuleBackend>,
        initial: Duration,
        max: Duration,
    ) -> (ChangeListener, Arc<RuleCache>, Arc<Notify>, SharedStatus) {
        let cache = Arc::new(RuleCache::new());
        let shutdown = Arc::new(Notify::new());
        let status = SharedStatus::default();
        let listener = ChangeListener {
            backend,
            cache: Arc::clone(&cache),
            channel: CHANNEL.to_string(),
            backoff: Backoff::new(initial, max),
            shutdown: Arc::clone(&shutdown),
            status: status.clone(),
        };
        (listener, cache, shutdown, status)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_max_never_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connects_reloads_and_follows_notices() {
        let backend = Arc::new(MemoryBackend::new());
        let existing = backend.insert_external(RuleKind::Accept, vec!["a.example.com".into()]);
        let (listener, cache, shutdown, status) = listener(
            Arc::<MemoryBackend>::clone(&backend),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let task = tokio::spawn(listener.run(None));

        // The reload on subscribe picks up rows that predate the listener.
        wait_until(|| cache.snapshot().contains(&existing.to_string())).await;
        assert_eq!(status.get().phase, ListenerPhase::Listening);

        let added = backend.insert_external(RuleKind::Ignore, vec!["b.example.com".into()]);
        wait_until(|| cache.snapshot().contains(&added.to_string())).await;
        assert!(status.get().reloads >= 2);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(status.get().phase, ListenerPhase::Stopped);
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss_and_catches_up() {
        let backend = Arc::new(MemoryBackend::new());
        let (listener, cache, shutdown, status) = listener(
            Arc::<MemoryBackend>::clone(&backend),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let task = tokio::spawn(listener.run(None));
        wait_until(|| backend.subscribe_count() == 1).await;

        // Lose the connection, then change a row while nobody listens.
        backend.set_available(false);
        wait_until(|| status.get().phase != ListenerPhase::Listening).await;
        let missed = backend.insert_external(RuleKind::Accept, vec!["missed.example.com".into()]);
        backend.set_available(true);

        wait_until(|| {
            status.get().reconnects >= 1
                && backend.subscribe_count() >= 2
                && cache.snapshot().contains(&missed.to_string())
        })
        .await;
        assert!(status.get().last_error.is_some());

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff_sleep() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let (listener, _cache, shutdown, status) = listener(
            Arc::<MemoryBackend>::clone(&backend),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        let task = tokio::spawn(listener.run(None));
        wait_until(|| status.get().last_error.is_some()).await;

        // The listener is now parked in a 60s backoff.
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener did not stop promptly")
            .unwrap();
        assert_eq!(status.get().phase, ListenerPhase::Stopped);
        assert_eq!(backend.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn failed_reload_after_notice_is_retried() {
        let backend = Arc::new(FlakyLoads::default());
        let (listener, cache, shutdown, status) = listener(
            backend.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let task = tokio::spawn(listener.run(None));
        wait_until(|| status.get().reloads == 1).await;

        backend.fail_next_loads(1);
        let id = backend
            .inner
            .insert_external(RuleKind::Accept, vec!["ext.example.com".into()]);

        // No second notice arrives; the retry alone has to pick the row up.
        wait_until(|| cache.snapshot().contains(&id.to_string()) && status.get().reloads == 2)
            .await;
        let current = status.get();
        assert_eq!(current.phase, ListenerPhase::Listening);
        assert_eq!(current.reloads, 2);
        assert!(current.last_error.unwrap().contains("transient"));

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_catch_up_reload_is_retried() {
        let backend = Arc::new(FlakyLoads::default());
        let existing = backend
            .inner
            .insert_external(RuleKind::Ignore, vec!["old.example.com".into()]);
        backend.fail_next_loads(2);
        let (listener, cache, shutdown, status) = listener(
            backend.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let task = tokio::spawn(listener.run(None));

        wait_until(|| {
            cache.snapshot().contains(&existing.to_string()) && status.get().reloads == 1
        })
        .await;
        // Retried in place: the subscription was never dropped.
        assert_eq!(backend.inner.subscribe_count(), 1);
        assert_eq!(status.get().reconnects, 0);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_reload_retry() {
        let backend = Arc::new(FlakyLoads::default());
        backend.fail_next_loads(usize::MAX);
        let (listener, _cache, shutdown, status) = listener(
            backend.clone(),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        let task = tokio::spawn(listener.run(None));
        wait_until(|| status.get().last_error.is_some()).await;

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener did not stop promptly")
            .unwrap();
        assert_eq!(status.get().phase, ListenerPhase::Stopped);
    }

    #[tokio::test]
    async fn queued_notices_share_one_reload() {
        let backend = Arc::new(MemoryBackend::new());
        let subscription = backend.subscribe(CHANNEL).await.unwrap();
        let ids: Vec<_> = (0..5)
            .map(|i| backend.insert_external(RuleKind::Accept, vec![format!("h{i}.example.com")]))
            .collect();

        let (listener, cache, shutdown, status) = listener(
            backend.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let task = tokio::spawn(listener.run(Some(subscription)));

        wait_until(|| {
            let snap = cache.snapshot();
            ids.iter().all(|id| snap.contains(&id.to_string()))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status.get().reloads, 1);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_start_is_not_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let (listener, _cache, shutdown, status) = listener(
            backend,
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), listener.run(None))
            .await
            .unwrap();
        assert_eq!(status.get().phase, ListenerPhase::Stopped);
    }
}
