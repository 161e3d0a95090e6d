//! NAT'd-side listener: reacts to `conn-ready` by dialing pickup connections
//! back to the public side and queuing them for [`Listener::accept`].
//!
//! Each pickup runs in its own task under one deadline covering both the
//! outbound dial and the hand-off into the bounded delivery queue, so a slow
//! pickup never stalls the control loop and a stalled consumer turns pickups
//! into reported failures instead of hangs.

use crate::conn::Conn;
use crate::error::ListenerError;
use crate::proto::{self, ControlMessage};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Capability to dial one pickup connection back to the public side.
///
/// Blanket-implemented for async closures taking the pickup path, so callers
/// can pass `move |conn_path| async move { ... }` directly. Deployments wrap
/// whatever transport reaches their pickup endpoint: plain TCP
/// ([`tcp_pickup_dial`](crate::tcp_pickup_dial)), a WebSocket
/// ([`ws_pickup_dial`](crate::ws_pickup_dial)), or a TLS stream of their own.
pub trait PickupDial: Send + Sync + 'static {
    /// Dial and upgrade one pickup connection for `conn_path`.
    fn dial<'a>(
        &'a self,
        conn_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<Conn>> + Send + 'a>>;
}

impl<F, Fut> PickupDial for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<Conn>> + Send + 'static,
{
    fn dial<'a>(
        &'a self,
        conn_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<Conn>> + Send + 'a>> {
        Box::pin((self)(conn_path.to_string()))
    }
}

/// Tunables for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Deadline covering one whole pickup: the dial back plus the hand-off
    /// into the delivery queue.
    pub pickup_timeout: Duration,
    /// Picked-up connections queued ahead of `accept`.
    pub queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            pickup_timeout: Duration::from_secs(20),
            queue_capacity: 8,
        }
    }
}

struct ListenerShared {
    /// Write half of the control connection; pickup tasks report failures
    /// through here.
    writer: Mutex<WriteHalf<Conn>>,
    /// Receive side of the delivery queue, drained by `accept`.
    queue: Mutex<mpsc::Receiver<Conn>>,
    dial_fn: Box<dyn PickupDial>,
    closed_tx: watch::Sender<bool>,
    pickup_timeout: Duration,
}

/// The NAT'd half of the tunnel: owns the outbound control connection and
/// yields picked-up connections from [`accept`](Listener::accept).
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    /// Wrap the established outbound control connection.
    ///
    /// `dial_fn` is invoked once per `conn-ready`, off the control loop.
    pub fn new(conn: Conn, dial_fn: impl PickupDial) -> Listener {
        Self::with_config(conn, dial_fn, ListenerConfig::default())
    }

    /// [`Listener::new`] with explicit tunables.
    pub fn with_config(conn: Conn, dial_fn: impl PickupDial, config: ListenerConfig) -> Listener {
        let (read_half, write_half) = tokio::io::split(conn);
        let (deliver_tx, deliver_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(ListenerShared {
            writer: Mutex::new(write_half),
            queue: Mutex::new(deliver_rx),
            dial_fn: Box::new(dial_fn),
            closed_tx,
            pickup_timeout: config.pickup_timeout,
        });

        tokio::spawn(ListenerShared::run(
            Arc::clone(&shared),
            read_half,
            deliver_tx,
        ));

        Listener { shared }
    }

    /// Next picked-up connection.
    ///
    /// Connections delivered before the control connection went away (or
    /// [`close`](Listener::close) was called) are still handed out; once the
    /// queue drains, returns [`ListenerError::Closed`] forever.
    pub async fn accept(&self) -> Result<Conn, ListenerError> {
        let mut queue = self.shared.queue.lock().await;
        let mut closed = self.shared.closed_tx.subscribe();
        tokio::select! {
            biased;
            conn = queue.recv() => conn.ok_or(ListenerError::Closed),
            _ = closed.wait_for(|c| *c) => {
                // Drain pickups that landed before the close.
                queue.try_recv().map_err(|_| ListenerError::Closed)
            }
        }
    }

    /// Whether the listener has shut down.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Stop accepting and close the control connection. Idempotent.
    pub async fn close(&self) {
        self.shared.teardown().await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Wakes the control loop, which shuts the connection down from its
        // own task.
        self.shared.mark_closed();
    }
}

impl ListenerShared {
    fn mark_closed(&self) -> bool {
        self.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    async fn teardown(&self) {
        if self.mark_closed() {
            debug!("listener closed");
        }
        // Refuses further deliveries while letting `accept` drain what
        // already arrived.
        self.queue.lock().await.close();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn run(
        shared: Arc<ListenerShared>,
        read_half: ReadHalf<Conn>,
        deliver: mpsc::Sender<Conn>,
    ) {
        let mut reader = BufReader::new(read_half);
        let mut closed = shared.closed_tx.subscribe();
        loop {
            let msg = tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                msg = proto::read_message(&mut reader) => msg,
            };
            match msg {
                Ok(Some(ControlMessage::KeepAlive)) => {
                    trace!("keep-alive from control plane");
                }
                Ok(Some(ControlMessage::ConnReady { conn_path })) => {
                    debug!(path = %conn_path, "conn-ready");
                    let shared = Arc::clone(&shared);
                    let deliver = deliver.clone();
                    tokio::spawn(async move {
                        shared.pickup(conn_path, deliver).await;
                    });
                }
                Ok(Some(ControlMessage::PickupFailed { .. })) => {
                    warn!("pickup-failed from the dialing side; protocol violation");
                    break;
                }
                Ok(None) => {
                    debug!("control connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control connection failed");
                    break;
                }
            }
        }
        shared.teardown().await;
    }

    /// One pickup attempt: dial back, then queue the connection for
    /// `accept`. Any failure inside the deadline is reported to the peer as
    /// `pickup-failed`.
    async fn pickup(&self, conn_path: String, deliver: mpsc::Sender<Conn>) {
        let attempt = async {
            let conn = self
                .dial_fn
                .dial(&conn_path)
                .await
                .map_err(|e| e.to_string())?;
            deliver
                .send(conn)
                .await
                .map_err(|_| "listener closed".to_string())
        };
        let reason = match timeout(self.pickup_timeout, attempt).await {
            Ok(Ok(())) => {
                debug!(path = %conn_path, "pickup delivered");
                return;
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!("pickup timed out after {:?}", self.pickup_timeout),
        };

        debug!(path = %conn_path, error = %reason, "pickup failed");
        let msg = ControlMessage::PickupFailed {
            conn_path,
            err: reason,
        };
        let mut writer = self.writer.lock().await;
        if let Err(e) = proto::write_message(&mut *writer, &msg).await {
            drop(writer);
            debug!(error = %e, "could not report pickup failure");
            self.teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    // Control transport whose outbound half is gone: reads pass through,
    // writes fail.
    struct ReadOnlyControl {
        reader: DuplexStream,
    }

    impl AsyncRead for ReadOnlyControl {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.reader).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for ReadOnlyControl {
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
    async fn failed_pickup_report_tears_down() {
        let (mut feed, readable) = tokio::io::duplex(4096);
        proto::write_message(
            &mut feed,
            &ControlMessage::ConnReady {
                conn_path: "/revdial?dialer=abc".to_string(),
            },
        )
        .await
        .unwrap();

        let listener = Listener::new(
            Box::new(ReadOnlyControl { reader: readable }),
            |_conn_path: String| async move {
                Err::<Conn, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "no route"))
            },
        );

        // The pickup fails and the failure report cannot be written, so the
        // listener shuts down instead of lingering on a dead control
        // connection.
        let res = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap();
        assert!(matches!(res, Err(ListenerError::Closed)));
        assert!(listener.is_closed());
        drop(feed);
    }
}
