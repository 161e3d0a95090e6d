//! connman: keyed connection manager over reverse dialers.
//!
//! Application code addresses remote peers by logical key (a device id, a
//! runner name), never by dialer. [`ConnectionManager::set`] binds a freshly
//! hijacked control connection to a key; [`ConnectionManager::dial`] opens a
//! logical connection to whatever dialer currently serves that key.
//!
//! When a peer's control connection drops, the key enters a reconnect grace
//! period instead of vanishing: `dial` callers park (bounded) and are woken
//! by the peer's re-registration, so brief disconnects stay invisible to
//! callers. Keys whose peers never come back expire after the grace period.

use revdial::{Conn, DialError, Dialer, DialerRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

/// Default window after a control-connection loss during which `dial`
/// callers wait for the peer to reconnect.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// Cap on callers parked per key during its grace period.
pub const MAX_PENDING_DIALS: usize = 100;
/// Sweep cadence for expired grace entries and abandoned waiters.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Errors produced by [`ConnectionManager::dial`].
#[derive(Debug, Error)]
pub enum Error {
    /// No dialer is bound to this key (never set, removed, or expired).
    #[error("no connection for key: {0}")]
    NoConnection(String),

    /// The key was in its grace period and the peer did not come back.
    #[error("reconnect timed out for key: {0}")]
    ReconnectTimeout(String),

    /// Too many callers already parked on this key's reconnect.
    #[error("too many pending dials for key: {0}")]
    TooManyPendingDials(String),

    /// The underlying dialer failed.
    #[error(transparent)]
    Dial(#[from] DialError),
}

/// Point-in-time occupancy counters, for logs and health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Keys with a live control connection.
    pub active: usize,
    /// Keys inside their reconnect grace period.
    pub reconnecting: usize,
    /// Callers parked across all grace periods.
    pub pending_dials: usize,
    /// Keys with at least one parked caller.
    pub pending_keys: usize,
}

type Waiter = oneshot::Sender<Option<Dialer>>;

#[derive(Default)]
struct State {
    /// Live dialers by logical key.
    dialers: HashMap<String, Dialer>,
    /// When each disconnected key lost its control connection.
    disconnected_at: HashMap<String, Instant>,
    /// Callers parked on a key during its grace period. Each receives the
    /// fresh dialer on reconnect, or `None` when the key goes away.
    pending: HashMap<String, Vec<Waiter>>,
}

struct Inner {
    state: RwLock<State>,
    registry: DialerRegistry,
    base_path: String,
    grace_period: Duration,
}

/// Keyed manager over reverse dialers. Cheap to clone.
///
/// Dialers it creates stay registered in the [`DialerRegistry`] until their
/// control connection dies or the key is removed; dropping the manager alone
/// does not tear live tunnels down.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager with the default grace period.
    pub fn new(registry: DialerRegistry, base_path: impl Into<String>) -> Self {
        Self::with_grace_period(registry, base_path, DEFAULT_GRACE_PERIOD)
    }

    /// Manager with an explicit reconnect grace period.
    pub fn with_grace_period(
        registry: DialerRegistry,
        base_path: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: RwLock::new(State::default()),
            registry,
            base_path: base_path.into(),
            grace_period,
        });
        tokio::spawn(cleanup_loop(Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Bind a hijacked control connection to `key`.
    ///
    /// Replaces any previous dialer for the key (the old one is closed),
    /// ends the key's grace period, and hands the fresh dialer to parked
    /// `dial` callers.
    pub async fn set(&self, key: impl Into<String>, conn: Conn) {
        let key = key.into();
        let dialer = Dialer::new(conn, &self.inner.base_path, &self.inner.registry).await;

        let (old, waiters) = {
            let mut state = self.inner.state.write().await;
            let old = state.dialers.insert(key.clone(), dialer.clone());
            state.disconnected_at.remove(&key);
            let waiters = state.pending.remove(&key).unwrap_or_default();
            (old, waiters)
        };

        if let Some(old) = old {
            debug!(key = %key, old_dialer = %old.id(), "replacing live dialer");
            old.close().await;
        }
        let woken = waiters.len();
        for tx in waiters {
            let _ = tx.send(Some(dialer.clone()));
        }
        if woken > 0 {
            info!(key = %key, count = woken, "woke parked dials after reconnect");
        }
        info!(key = %key, dialer = %dialer.id(), "connection set");

        tokio::spawn(watch_dialer(
            Arc::downgrade(&self.inner),
            key,
            dialer,
        ));
    }

    /// Open a new logical connection to `key`.
    ///
    /// Delegates to the key's dialer when connected. During a grace period
    /// the caller parks until the peer reconnects (and then dials through
    /// the fresh dialer) or the period expires.
    pub async fn dial(&self, key: &str) -> Result<Conn, Error> {
        let (rx, remaining) = {
            let mut state = self.inner.state.write().await;
            if let Some(dialer) = state.dialers.get(key) {
                let dialer = dialer.clone();
                drop(state);
                return Ok(dialer.dial().await?);
            }

            let Some(since) = state.disconnected_at.get(key).copied() else {
                return Err(Error::NoConnection(key.to_string()));
            };
            let elapsed = Instant::now().duration_since(since);
            if elapsed >= self.inner.grace_period {
                state.disconnected_at.remove(key);
                fail_waiters(state.pending.remove(key));
                return Err(Error::ReconnectTimeout(key.to_string()));
            }

            let waiters = state.pending.entry(key.to_string()).or_default();
            waiters.retain(|tx| !tx.is_closed());
            if waiters.len() >= MAX_PENDING_DIALS {
                return Err(Error::TooManyPendingDials(key.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            debug!(key = %key, parked = waiters.len(), "dial parked during grace period");
            (rx, self.inner.grace_period - elapsed)
        };

        match timeout(remaining, rx).await {
            Ok(Ok(Some(dialer))) => Ok(dialer.dial().await?),
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => Err(Error::ReconnectTimeout(key.to_string())),
        }
    }

    /// Forget `key` entirely: close its dialer, unpark waiting callers,
    /// clear grace state.
    pub async fn remove(&self, key: &str) {
        let (dialer, waiters) = {
            let mut state = self.inner.state.write().await;
            let dialer = state.dialers.remove(key);
            state.disconnected_at.remove(key);
            (dialer, state.pending.remove(key))
        };
        fail_waiters(waiters);
        if let Some(dialer) = dialer {
            dialer.close().await;
            info!(key = %key, "connection removed");
        }
    }

    /// Keys with a live control connection, sorted.
    pub async fn list(&self) -> Vec<String> {
        let state = self.inner.state.read().await;
        let mut keys: Vec<String> = state.dialers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys currently inside their reconnect grace period, sorted.
    pub async fn list_reconnecting(&self) -> Vec<String> {
        let state = self.inner.state.read().await;
        let mut keys: Vec<String> = state.disconnected_at.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Current occupancy counters.
    pub async fn stats(&self) -> Stats {
        let state = self.inner.state.read().await;
        Stats {
            active: state.dialers.len(),
            reconnecting: state.disconnected_at.len(),
            pending_dials: state.pending.values().map(Vec::len).sum(),
            pending_keys: state.pending.len(),
        }
    }
}

fn fail_waiters(waiters: Option<Vec<Waiter>>) {
    for tx in waiters.unwrap_or_default() {
        let _ = tx.send(None);
    }
}

/// Waits out one dialer's lifetime; when it dies while still current for
/// `key`, moves the key into its grace period.
async fn watch_dialer(inner: Weak<Inner>, key: String, dialer: Dialer) {
    let mut done = dialer.done();
    let _ = done.wait_for(|closed| *closed).await;

    let Some(inner) = inner.upgrade() else { return };
    let mut state = inner.state.write().await;
    match state.dialers.get(&key) {
        Some(current) if current.id() == dialer.id() => {
            state.dialers.remove(&key);
            state.disconnected_at.insert(key.clone(), Instant::now());
            info!(key = %key, grace = ?inner.grace_period, "connection lost; grace period started");
        }
        _ => {
            debug!(key = %key, dialer = %dialer.id(), "stale dialer watch");
        }
    }
}

/// Periodic sweep: expire grace entries whose peers never returned and prune
/// waiters whose callers went away.
async fn cleanup_loop(inner: Weak<Inner>) {
    let mut ticker = interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };

        let mut expired = Vec::new();
        {
            let mut state = inner.state.write().await;
            let grace = inner.grace_period;
            let now = Instant::now();
            state.disconnected_at.retain(|key, since| {
                if now.duration_since(*since) >= grace {
                    expired.push(key.clone());
                    false
                } else {
                    true
                }
            });
            for key in &expired {
                fail_waiters(state.pending.remove(key));
            }
            state.pending.retain(|_, waiters| {
                waiters.retain(|tx| !tx.is_closed());
                !waiters.is_empty()
            });
        }
        for key in expired {
            warn!(key = %key, "reconnect grace period expired");
        }
    }
}
