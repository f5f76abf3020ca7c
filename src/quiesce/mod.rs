//! Server shutdown quiesce
//!
//! Listening channels are registered by name. When the server stops, every
//! channel is told to stop accepting, then a verifier closes channels as
//! their live connections drain. Whichever comes first, all channels drained
//! or the quiesce timeout, finishes the shutdown: remaining channels are
//! force-closed and the cleanup callback runs exactly once.
//!
//! ```no_run
//! use h2link::config::{EndpointConfig, QuiesceConfig};
//! use h2link::quiesce::{ChannelRegistry, Endpoint, QuiesceCoordinator};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), h2link::quiesce::Error> {
//! let endpoint = Endpoint::bind("h2c", "127.0.0.1:8080".parse().unwrap(), &EndpointConfig::default()).await?;
//! endpoint.serve(|_stream, _peer| async move { /* handle connection */ })?;
//!
//! let registry = Arc::new(ChannelRegistry::new());
//! registry.register(endpoint)?;
//!
//! let config = QuiesceConfig { timeout: Duration::from_secs(30), ..Default::default() };
//! let coordinator = QuiesceCoordinator::new(registry, config);
//! coordinator.server_stopping();
//! println!("shutdown finished: {:?}", coordinator.wait().await);
//! # Ok(())
//! # }
//! ```

pub mod endpoint;

pub use endpoint::Endpoint;

use crate::config::QuiesceConfig;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Quiesce and endpoint errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The endpoint never started
    #[error("bind to {addr} failed after {attempts} attempts: {source}")]
    Bind {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("channel already registered: {0}")]
    DuplicateChannel(String),

    #[error("no such channel: {0}")]
    UnknownChannel(String),

    #[error("endpoint is not listening")]
    NotListening,
}

/// Result type for quiesce operations
pub type Result<T> = std::result::Result<T, Error>;

/// A named listening channel taking part in shutdown
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Stop accepting new connections; existing ones keep running
    fn quiesce_started(&self);

    /// Connections still open on this channel
    fn live_connections(&self) -> usize;

    /// Stop the channel and its connections. Must be idempotent.
    fn close(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channels by name
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<dyn Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    pub fn register(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let name = channel.name().to_string();
        let mut channels = lock(&self.channels);
        if channels.contains_key(&name) {
            return Err(Error::DuplicateChannel(name));
        }
        debug!(channel = %name, "channel registered");
        channels.insert(name, channel);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        lock(&self.channels).get(name).cloned()
    }

    /// Remove a channel and close it
    pub fn stop(&self, name: &str) -> Result<()> {
        let channel = lock(&self.channels)
            .remove(name)
            .ok_or_else(|| Error::UnknownChannel(name.to_string()))?;
        info!(channel = %name, "stopping channel");
        channel.close();
        Ok(())
    }

    /// Copy of the current channels, sorted by name. Safe to iterate while
    /// channels are added or stopped.
    pub fn snapshot(&self) -> Vec<Arc<dyn Channel>> {
        let mut channels: Vec<_> = lock(&self.channels).values().cloned().collect();
        channels.sort_by(|a, b| a.name().cmp(b.name()));
        channels
    }

    /// Remove every channel, returning them
    fn drain(&self) -> Vec<Arc<dyn Channel>> {
        lock(&self.channels).drain().map(|(_, channel)| channel).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.channels).is_empty()
    }
}

#[derive(Default)]
struct GroupInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Option<AbortHandle>>>,
}

/// Live child connections of one channel
#[derive(Clone, Default)]
pub struct ConnectionGroup {
    inner: Arc<GroupInner>,
}

impl ConnectionGroup {
    pub fn new() -> Self {
        ConnectionGroup::default()
    }

    /// Count a new connection; it stays counted until the guard is dropped
    pub fn register(&self) -> ConnectionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.live).insert(id, None);
        ConnectionGuard {
            id,
            group: self.inner.clone(),
        }
    }

    /// Let [`close_all`](Self::close_all) abort the task serving `guard`
    pub fn attach(&self, guard_id: u64, handle: AbortHandle) {
        if let Some(slot) = lock(&self.inner.live).get_mut(&guard_id) {
            *slot = Some(handle);
        }
    }

    /// Abort every attached connection task
    pub fn close_all(&self) {
        let handles: Vec<_> = lock(&self.inner.live)
            .values_mut()
            .filter_map(Option::take)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Membership of one connection in a [`ConnectionGroup`]
pub struct ConnectionGuard {
    id: u64,
    group: Arc<GroupInner>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        lock(&self.group.live).remove(&self.id);
    }
}

/// Shutdown progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceState {
    Active,
    Stopping,
    /// Every channel drained before the timeout
    Drained,
    /// The timeout expired (or was zero) and channels were force-closed
    TimedOut,
}

impl QuiesceState {
    pub fn is_finished(&self) -> bool {
        matches!(self, QuiesceState::Drained | QuiesceState::TimedOut)
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Timers {
    verifier: Option<JoinHandle<()>>,
    finisher: Option<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<ChannelRegistry>,
    config: QuiesceConfig,
    state: watch::Sender<QuiesceState>,
    started: AtomicBool,
    finished: AtomicBool,
    cleanup: Mutex<Option<Cleanup>>,
    timers: Mutex<Timers>,
}

impl Inner {
    /// Close drained channels; true once none are left
    fn verify(&self) -> bool {
        for channel in self.registry.snapshot() {
            let live = channel.live_connections();
            if live == 0 {
                if let Err(e) = self.registry.stop(channel.name()) {
                    debug!(cause = %e, "channel already stopped");
                }
            } else {
                debug!(channel = channel.name(), live, "waiting for connections to drain");
            }
        }
        self.registry.is_empty()
    }

    fn finish(&self, outcome: QuiesceState) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }

        let timers = std::mem::take(&mut *lock(&self.timers));
        for timer in [timers.verifier, timers.finisher].into_iter().flatten() {
            timer.abort();
        }

        let remaining = self.registry.drain();
        if !remaining.is_empty() {
            warn!(channels = remaining.len(), "force-closing channels");
        }
        for channel in remaining {
            channel.close();
        }

        if let Some(cleanup) = lock(&self.cleanup).take() {
            cleanup();
        }

        info!(?outcome, "quiesce finished");
        self.state.send_replace(outcome);
        true
    }
}

/// Drives server shutdown across all registered channels
#[derive(Clone)]
pub struct QuiesceCoordinator {
    inner: Arc<Inner>,
}

impl QuiesceCoordinator {
    pub fn new(registry: Arc<ChannelRegistry>, config: QuiesceConfig) -> Self {
        let (state, _) = watch::channel(QuiesceState::Active);
        QuiesceCoordinator {
            inner: Arc::new(Inner {
                registry,
                config,
                state,
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                cleanup: Mutex::new(None),
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    /// Run `cleanup` once when shutdown finishes
    pub fn on_finish(&self, cleanup: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.cleanup) = Some(Box::new(cleanup));
    }

    pub fn state(&self) -> QuiesceState {
        *self.inner.state.borrow()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.inner.registry
    }

    /// Begin shutdown. Only the first call has any effect. Timers are
    /// spawned on the current tokio runtime.
    pub fn server_stopping(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("server_stopping already called");
            return;
        }
        self.inner.state.send_replace(QuiesceState::Stopping);

        let timeout = self.inner.config.timeout;
        if timeout.is_zero() {
            info!("quiesce timeout is zero, closing all channels");
            self.inner.finish(QuiesceState::TimedOut);
            return;
        }

        let channels = self.inner.registry.snapshot();
        if channels.is_empty() {
            self.inner.finish(QuiesceState::Drained);
            return;
        }

        info!(channels = channels.len(), ?timeout, "quiescing channels");
        for channel in &channels {
            channel.quiesce_started();
        }

        let interval = self.inner.config.verify_interval;
        let verifier_inner = self.inner.clone();
        let verifier = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if verifier_inner.verify() {
                    verifier_inner.finish(QuiesceState::Drained);
                    break;
                }
            }
        });

        let finisher_inner = self.inner.clone();
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            finisher_inner.finish(QuiesceState::TimedOut);
        });

        let mut timers = lock(&self.inner.timers);
        if self.inner.finished.load(Ordering::Acquire) {
            verifier.abort();
            finisher.abort();
        } else {
            timers.verifier = Some(verifier);
            timers.finisher = Some(finisher);
        }
    }

    /// Finish now, force-closing whatever is left. Returns false if shutdown
    /// had already finished.
    pub fn finish_now(&self) -> bool {
        self.inner.finish(QuiesceState::TimedOut)
    }

    /// Resolve once shutdown has finished
    pub async fn wait(&self) -> QuiesceState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(QuiesceState::is_finished).await.map(|state| *state);
        result.unwrap_or_else(|_| self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct TestChannel {
        name: String,
        live: AtomicUsize,
        quiesced: AtomicUsize,
        closes: AtomicUsize,
    }

    impl TestChannel {
        fn new(name: &str, live: usize) -> Arc<Self> {
            Arc::new(TestChannel {
                name: name.to_string(),
                live: AtomicUsize::new(live),
                quiesced: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            })
        }
    }

    impl Channel for TestChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn quiesce_started(&self) {
            self.quiesced.fetch_add(1, Ordering::SeqCst);
        }

        fn live_connections(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator(
        channels: &[Arc<TestChannel>],
        timeout: Duration,
    ) -> (QuiesceCoordinator, Arc<AtomicUsize>) {
        let registry = Arc::new(ChannelRegistry::new());
        for channel in channels {
            registry.register(channel.clone()).unwrap();
        }
        let config = QuiesceConfig {
            timeout,
            verify_interval: Duration::from_millis(10),
        };
        let coordinator = QuiesceCoordinator::new(registry, config);
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        coordinator.on_finish(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (coordinator, cleanups)
    }

    #[test]
    fn test_registry_register_and_stop() {
        let registry = ChannelRegistry::new();
        let a = TestChannel::new("a", 0);
        registry.register(a.clone()).unwrap();
        assert!(matches!(
            registry.register(TestChannel::new("a", 0)),
            Err(Error::DuplicateChannel(_))
        ));
        registry.register(TestChannel::new("b", 0)).unwrap();

        let names: Vec<_> = registry.snapshot().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);

        registry.stop("a").unwrap();
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert!(registry.get("a").is_none());
        assert!(matches!(registry.stop("a"), Err(Error::UnknownChannel(_))));
    }

    #[test]
    fn test_group_guard_removes_on_drop() {
        let group = ConnectionGroup::new();
        let first = group.register();
        let second = group.register();
        assert_ne!(first.id(), second.id());
        assert_eq!(group.len(), 2);
        drop(first);
        assert_eq!(group.len(), 1);
        drop(second);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_zero_timeout_closes_immediately() {
        let channel = TestChannel::new("http", 3);
        let (coordinator, cleanups) = coordinator(&[channel.clone()], Duration::ZERO);

        coordinator.server_stopping();
        assert_eq!(coordinator.state(), QuiesceState::TimedOut);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(channel.quiesced.load(Ordering::SeqCst), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_no_channels_drains_immediately() {
        let (coordinator, cleanups) = coordinator(&[], Duration::from_secs(30));
        coordinator.server_stopping();
        assert_eq!(coordinator.wait().await, QuiesceState::Drained);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_before_timeout() {
        let busy = TestChannel::new("busy", 1);
        let idle = TestChannel::new("idle", 0);
        let (coordinator, cleanups) =
            coordinator(&[busy.clone(), idle.clone()], Duration::from_secs(30));

        coordinator.server_stopping();
        assert_eq!(coordinator.state(), QuiesceState::Stopping);
        assert_eq!(busy.quiesced.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(idle.closes.load(Ordering::SeqCst), 1);
        assert_eq!(busy.closes.load(Ordering::SeqCst), 0);

        busy.live.store(0, Ordering::SeqCst);
        let outcome = tokio::time::timeout(Duration::from_secs(5), coordinator.wait())
            .await
            .unwrap();
        assert_eq!(outcome, QuiesceState::Drained);
        assert_eq!(busy.closes.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_force_closes() {
        let stuck = TestChannel::new("stuck", 2);
        let (coordinator, cleanups) = coordinator(&[stuck.clone()], Duration::from_millis(60));

        coordinator.server_stopping();
        assert_eq!(coordinator.wait().await, QuiesceState::TimedOut);
        assert_eq!(stuck.closes.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(stuck.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_stopping_is_idempotent() {
        let channel = TestChannel::new("http", 1);
        let (coordinator, cleanups) = coordinator(&[channel.clone()], Duration::from_secs(30));

        coordinator.server_stopping();
        coordinator.server_stopping();
        assert_eq!(channel.quiesced.load(Ordering::SeqCst), 1);

        assert!(coordinator.finish_now());
        assert!(!coordinator.finish_now());
        coordinator.server_stopping();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), QuiesceState::TimedOut);
    }
}
