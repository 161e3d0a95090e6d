//! Public-side dialer: turns one hijacked inbound connection into an
//! on-demand source of connections back to the NAT'd peer.
//!
//! A [`Dialer`] owns the control connection. [`Dialer::dial`] sends
//! `conn-ready` and parks the caller on a single-slot rendezvous until the
//! pickup handler delivers the matched connection, the peer reports
//! `pickup-failed`, or the dialer tears down. At most one request is in
//! flight per dialer; concurrent callers queue on an internal gate.

use crate::conn::Conn;
use crate::error::DialError;
use crate::proto::{self, ControlMessage};
use crate::registry::DialerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, trace, warn};

/// Tunables for a [`Dialer`].
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Gap between `keep-alive` lines on an otherwise idle control
    /// connection. Must stay under intermediary idle timeouts.
    pub keep_alive_interval: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(18),
        }
    }
}

/// Outcome delivered into the rendezvous slot: a matched connection or the
/// peer-reported pickup failure.
type PickupResult = Result<Conn, String>;

struct Shared {
    id: String,
    conn_path: String,
    /// Write half of the control connection. Keep-alive, `dial`, and
    /// teardown all write through here, one message at a time.
    writer: AsyncMutex<WriteHalf<Conn>>,
    /// Serializes `dial` callers: at most one in-flight request per dialer.
    dial_gate: AsyncMutex<()>,
    /// Single-slot rendezvous between the in-flight `dial` and `match_conn`.
    pending: Mutex<Option<oneshot::Sender<PickupResult>>>,
    closed: AtomicBool,
    done_tx: watch::Sender<bool>,
    registry: DialerRegistry,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, Option<oneshot::Sender<PickupResult>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the rendezvous slot when the in-flight `dial` resolves or its
/// future is dropped. Runs synchronously, so a cancelled caller leaves the
/// dialer immediately reusable.
struct SlotGuard<'a> {
    shared: &'a Shared,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.shared.lock_pending() = None;
    }
}

/// Public-side handle for dialing back through one control connection.
///
/// Cheap to clone; all clones share the same control connection and
/// rendezvous state.
#[derive(Clone)]
pub struct Dialer {
    shared: Arc<Shared>,
}

impl Dialer {
    /// Wrap a hijacked control connection and register it.
    ///
    /// Spawns the control read loop and the keep-alive task. Registration
    /// never fails; id collisions are re-drawn.
    pub async fn new(conn: Conn, base_path: &str, registry: &DialerRegistry) -> Dialer {
        Self::with_config(conn, base_path, registry, DialerConfig::default()).await
    }

    /// [`Dialer::new`] with explicit tunables.
    pub async fn with_config(
        conn: Conn,
        base_path: &str,
        registry: &DialerRegistry,
        config: DialerConfig,
    ) -> Dialer {
        let (read_half, write_half) = tokio::io::split(conn);
        let (done_tx, _) = watch::channel(false);

        let dialer = registry
            .register_with(|id| {
                let conn_path = proto::conn_path(base_path, &id);
                Dialer {
                    shared: Arc::new(Shared {
                        id,
                        conn_path,
                        writer: AsyncMutex::new(write_half),
                        dial_gate: AsyncMutex::new(()),
                        pending: Mutex::new(None),
                        closed: AtomicBool::new(false),
                        done_tx,
                        registry: registry.clone(),
                    }),
                }
            })
            .await;

        let d = dialer.clone();
        tokio::spawn(async move { d.read_loop(read_half).await });

        let d = dialer.clone();
        tokio::spawn(async move { d.keep_alive_loop(config.keep_alive_interval).await });

        dialer
    }

    /// Opaque id this dialer is registered under.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The pickup path advertised in this dialer's `conn-ready` messages.
    pub fn conn_path(&self) -> &str {
        &self.shared.conn_path
    }

    /// Whether the dialer has torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Watch that flips to `true` once the dialer tears down.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.shared.done_tx.subscribe()
    }

    /// Open one logical connection back to the peer.
    ///
    /// Blocks until the pickup connection is matched, the peer reports
    /// `pickup-failed`, or the dialer tears down. Dropping the returned
    /// future (a caller-side timeout, for instance) releases the in-flight
    /// slot immediately; a pickup that lands afterwards is treated as stray
    /// and closed.
    pub async fn dial(&self) -> Result<Conn, DialError> {
        let _gate = self.shared.dial_gate.lock().await;
        if self.is_closed() {
            return Err(DialError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.lock_pending() = Some(tx);
        let _slot = SlotGuard {
            shared: &self.shared,
        };

        // The request line is written from a task of its own so the bytes hit
        // the wire whole even if this future is dropped mid-send.
        let shared = Arc::clone(&self.shared);
        let send = tokio::spawn(async move {
            let msg = ControlMessage::ConnReady {
                conn_path: shared.conn_path.clone(),
            };
            let mut writer = shared.writer.lock().await;
            proto::write_message(&mut *writer, &msg).await
        });
        match send.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if self.is_closed() {
                    return Err(DialError::Closed);
                }
                debug!(dialer = %self.shared.id, error = %e, "conn-ready write failed");
                self.teardown().await;
                return Err(DialError::Io(e.into()));
            }
            Err(e) => {
                warn!(dialer = %self.shared.id, error = %e, "conn-ready send task failed");
                return Err(DialError::Closed);
            }
        }
        trace!(dialer = %self.shared.id, "conn-ready sent");

        let mut done = self.shared.done_tx.subscribe();
        tokio::select! {
            res = rx => match res {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(reason)) => Err(DialError::PickupFailed(reason)),
                Err(_) => Err(DialError::Closed),
            },
            _ = done.wait_for(|closed| *closed) => Err(DialError::Closed),
        }
    }

    /// [`Dialer::dial`] bounded by `deadline`; expiry surfaces as
    /// [`DialError::TimedOut`].
    pub async fn dial_timeout(&self, deadline: Duration) -> Result<Conn, DialError> {
        match timeout(deadline, self.dial()).await {
            Ok(res) => res,
            Err(_) => Err(DialError::TimedOut),
        }
    }

    /// Deliver a picked-up connection.
    ///
    /// Called by the pickup handler once the upgrade response is written.
    /// With no dial in flight the connection is dropped on the spot; a stray
    /// match must never disturb the dialer.
    pub fn match_conn(&self, conn: Conn) {
        match self.shared.lock_pending().take() {
            Some(tx) => {
                if tx.send(Ok(conn)).is_err() {
                    debug!(dialer = %self.shared.id, "matched connection had no waiter");
                }
            }
            None => {
                debug!(dialer = %self.shared.id, "stray pickup connection dropped");
            }
        }
    }

    /// Tear the dialer down: deregister, fail any in-flight dial, close the
    /// control connection. Idempotent.
    pub async fn close(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Fail the in-flight dial before anything else can park.
        drop(self.shared.lock_pending().take());
        self.shared.registry.unregister(&self.shared.id).await;
        self.shared.done_tx.send_replace(true);
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(dialer = %self.shared.id, "dialer closed");
    }

    async fn read_loop(self, read_half: ReadHalf<Conn>) {
        let mut reader = BufReader::new(read_half);
        let mut done = self.shared.done_tx.subscribe();
        loop {
            let msg = tokio::select! {
                _ = done.wait_for(|closed| *closed) => break,
                msg = proto::read_message(&mut reader) => msg,
            };
            match msg {
                Ok(Some(ControlMessage::KeepAlive)) => {
                    trace!(dialer = %self.shared.id, "keep-alive");
                }
                Ok(Some(ControlMessage::PickupFailed { conn_path, err })) => {
                    debug!(dialer = %self.shared.id, path = %conn_path, error = %err, "pickup failed");
                    if let Some(tx) = self.shared.lock_pending().take() {
                        let _ = tx.send(Err(err));
                    }
                }
                Ok(Some(ControlMessage::ConnReady { .. })) => {
                    warn!(dialer = %self.shared.id, "conn-ready from the listening side; protocol violation");
                    break;
                }
                Ok(None) => {
                    debug!(dialer = %self.shared.id, "control connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(dialer = %self.shared.id, error = %e, "control connection failed");
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn keep_alive_loop(self, period: Duration) {
        let mut done = self.shared.done_tx.subscribe();
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = done.wait_for(|closed| *closed) => return,
                _ = ticker.tick() => {}
            }
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = proto::write_message(&mut *writer, &ControlMessage::KeepAlive).await {
                drop(writer);
                debug!(dialer = %self.shared.id, error = %e, "keep-alive write failed");
                self.teardown().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Conn;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    fn pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(4096);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn conn_path_carries_id() {
        let registry = DialerRegistry::new();
        let (a, _b) = pair();
        let dialer = Dialer::new(a, "/revdial", &registry).await;
        assert_eq!(
            dialer.conn_path(),
            format!("/revdial?dialer={}", dialer.id())
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_done() {
        let registry = DialerRegistry::new();
        let (a, _b) = pair();
        let dialer = Dialer::new(a, "/revdial", &registry).await;
        let mut done = dialer.done();
        assert!(!dialer.is_closed());
        assert!(!*done.borrow());

        dialer.close().await;
        dialer.close().await;
        assert!(dialer.is_closed());
        done.wait_for(|closed| *closed).await.unwrap();
        assert!(registry.lookup(dialer.id()).await.is_none());
    }

    #[tokio::test]
    async fn dial_after_close_fails_fast() {
        let registry = DialerRegistry::new();
        let (a, _b) = pair();
        let dialer = Dialer::new(a, "/revdial", &registry).await;
        dialer.close().await;
        assert!(matches!(dialer.dial().await, Err(DialError::Closed)));
    }

    #[tokio::test]
    async fn peer_eof_tears_down() {
        let registry = DialerRegistry::new();
        let (a, b) = pair();
        let dialer = Dialer::new(a, "/revdial", &registry).await;
        drop(b);
        let mut done = dialer.done();
        done.wait_for(|closed| *closed).await.unwrap();
        assert!(dialer.is_closed());
        assert!(registry.lookup(dialer.id()).await.is_none());
    }

    // Writes fail at once, reads never complete.
    struct BrokenConn;

    impl AsyncRead for BrokenConn {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenConn {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _data: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "write side gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_conn_ready_write_tears_down() {
        let registry = DialerRegistry::new();
        let dialer = Dialer::new(Box::new(BrokenConn), "/revdial", &registry).await;

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, DialError::Io(_)));

        // The dialer deregisters right away, not at the next keep-alive tick.
        assert!(dialer.is_closed());
        assert!(registry.lookup(dialer.id()).await.is_none());
        let mut done = dialer.done();
        done.wait_for(|closed| *closed).await.unwrap();
    }
}
