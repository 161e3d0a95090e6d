//! Pickup handler: terminates `GET <base_path>?dialer=<id>` upgrade requests
//! on the public side and hands the accepted stream to the matching dialer.
//!
//! The client half of the same handshake lives here too: [`pickup_via`]
//! performs the upgrade over any established stream, and [`tcp_pickup_dial`]
//! packages it as a ready-made [`PickupDial`] for plaintext deployments.

use crate::conn::{ByteStream, Conn};
use crate::error::PickupError;
use crate::http;
use crate::listener::PickupDial;
use crate::registry::DialerRegistry;
use crate::ws;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Resolves pickup connections against a [`DialerRegistry`].
///
/// Stateless beyond the registry handle and the mount path; clone freely.
#[derive(Clone)]
pub struct PickupHandler {
    registry: DialerRegistry,
    base_path: String,
}

impl PickupHandler {
    pub fn new(registry: DialerRegistry, base_path: impl Into<String>) -> Self {
        Self {
            registry,
            base_path: base_path.into(),
        }
    }

    /// Drive one incoming pickup connection through the upgrade handshake.
    ///
    /// On success the stream belongs to the matched dialer's caller. Every
    /// error case has already written an HTTP error response back.
    pub async fn handle<S>(&self, mut stream: S) -> Result<(), PickupError>
    where
        S: ByteStream + 'static,
    {
        let head = match http::read_request_head(&mut stream).await {
            Ok(head) => head,
            Err(e) => {
                let _ =
                    http::write_error_response(&mut stream, 400, "Bad Request", "malformed request")
                        .await;
                return Err(PickupError::BadRequest(e.to_string()));
            }
        };
        if head.method != "GET" {
            let _ = http::write_error_response(
                &mut stream,
                405,
                "Method Not Allowed",
                "GET required",
            )
            .await;
            return Err(PickupError::MethodNotAllowed(head.method));
        }
        if head.path() != self.base_path {
            let _ = http::write_error_response(&mut stream, 404, "Not Found", "unknown path").await;
            return Err(PickupError::NotFound(head.path().to_string()));
        }

        match self.resolve(&head.target).await {
            Ok(dialer) => {
                http::write_upgrade_response(&mut stream).await?;
                dialer.match_conn(Box::new(stream));
                debug!(dialer = %dialer.id(), "pickup matched");
                Ok(())
            }
            Err(e @ PickupError::UnknownDialer(_)) => {
                let _ = http::write_error_response(
                    &mut stream,
                    500,
                    "Internal Server Error",
                    "unknown dialer",
                )
                .await;
                Err(e)
            }
            Err(e) => {
                let _ = http::write_error_response(
                    &mut stream,
                    400,
                    "Bad Request",
                    "missing dialer parameter",
                )
                .await;
                Err(e)
            }
        }
    }

    /// WebSocket flavor of [`handle`](Self::handle): completes the WebSocket
    /// handshake, reads the pickup path from its request line, and matches
    /// the wrapped stream. Used where proxies only pass WebSocket traffic.
    pub async fn handle_ws<S>(&self, stream: S) -> Result<(), PickupError>
    where
        S: ByteStream + 'static,
    {
        let (mut ws, target) = ws::ws_accept_with_target(stream).await?;
        if http::target_path(&target) != self.base_path {
            let _ = ws.shutdown().await;
            return Err(PickupError::NotFound(
                http::target_path(&target).to_string(),
            ));
        }
        match self.resolve(&target).await {
            Ok(dialer) => {
                dialer.match_conn(Box::new(ws));
                debug!(dialer = %dialer.id(), "websocket pickup matched");
                Ok(())
            }
            Err(e) => {
                let _ = ws.shutdown().await;
                Err(e)
            }
        }
    }

    /// Accept loop over `listener`, one task per pickup connection.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let handler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(stream).await {
                    debug!(remote = %addr, error = %e, "pickup rejected");
                }
            });
        }
    }

    /// [`serve`](Self::serve) for WebSocket pickups.
    pub async fn serve_ws(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let handler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle_ws(stream).await {
                    debug!(remote = %addr, error = %e, "websocket pickup rejected");
                }
            });
        }
    }

    async fn resolve(&self, target: &str) -> Result<crate::Dialer, PickupError> {
        let id = match http::target_query_param(target, "dialer") {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(PickupError::BadRequest("missing dialer parameter".into()));
            }
        };
        match self.registry.lookup(id).await {
            Some(dialer) => Ok(dialer),
            None => {
                // A late pickup can race dialer teardown.
                warn!(dialer = %id, "pickup for unknown dialer");
                Err(PickupError::UnknownDialer(id.to_string()))
            }
        }
    }
}

// ── Listener-side handshake ──────────────────────────────────────────

/// Complete the pickup handshake over an already-connected stream.
///
/// Sends the upgrade request for `conn_path` and verifies the `101`; the
/// stream is then the picked-up data connection.
pub async fn pickup_via<S>(mut stream: S, host: &str, conn_path: &str) -> io::Result<Conn>
where
    S: ByteStream + 'static,
{
    http::write_upgrade_request(&mut stream, host, conn_path).await?;
    let status = http::read_response_status(&mut stream).await?;
    if status != 101 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("pickup rejected with status {status}"),
        ));
    }
    Ok(Box::new(stream))
}

/// A [`PickupDial`] that connects to `addr` over plain TCP and upgrades
/// there. Deployments with TLS or authenticated pickups supply their own
/// closure instead.
pub fn tcp_pickup_dial(addr: impl Into<String>) -> impl PickupDial {
    let addr = addr.into();
    move |conn_path: String| {
        let addr = addr.clone();
        async move {
            let stream = TcpStream::connect(&addr).await?;
            pickup_via(stream, &addr, &conn_path).await
        }
    }
}
