//! WebSocket byte-stream adapter.
//!
//! Wraps a `tokio_tungstenite::WebSocketStream` so a WebSocket leg can serve
//! anywhere a [`Conn`](crate::Conn) is accepted: binary frames carry the
//! bytes, a Close frame maps to EOF. Useful where proxies between the NAT'd
//! process and the public side only pass WebSocket traffic.

use crate::conn::Conn;
use crate::listener::PickupDial;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Largest accepted binary frame.
const MAX_WS_FRAME: usize = 1_048_576;

/// A WebSocket connection exposed as a plain byte stream.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_offset: usize,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_offset: 0,
        }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

fn ws_io_err(e: WsError) -> io::Error {
    match e {
        WsError::Io(io) => io,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            // Drain leftover bytes from the previous frame first.
            if self.read_offset < self.read_buf.len() {
                let n = (self.read_buf.len() - self.read_offset).min(buf.remaining());
                let start = self.read_offset;
                buf.put_slice(&self.read_buf[start..start + n]);
                self.read_offset += n;
                if self.read_offset == self.read_buf.len() {
                    self.read_buf.clear();
                    self.read_offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    if data.len() > MAX_WS_FRAME {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("ws frame too large: {} bytes", data.len()),
                        )));
                    }
                    self.read_buf = data.to_vec();
                    self.read_offset = 0;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_))) => {
                    // Text, ping, and pong frames carry no tunnel bytes.
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_err(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
            Poll::Pending => return Poll::Pending,
        }
        // Write at most one frame the reading side will accept.
        let n = data.len().min(MAX_WS_FRAME);
        let msg = Message::Binary(data[..n].to_vec().into());
        match Pin::new(&mut self.inner).start_send(msg) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(ws_io_err(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_io_err)
    }
}

/// Accept a WebSocket handshake on `stream` and wrap it as a byte stream.
pub async fn ws_accept<S>(stream: S) -> io::Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio_tungstenite::accept_async(stream)
        .await
        .map(WsStream::new)
        .map_err(ws_io_err)
}

/// Accept a WebSocket handshake and report the request target it carried,
/// for endpoints that route on the upgrade path (pickup, registration).
pub async fn ws_accept_with_target<S>(stream: S) -> io::Result<(WsStream<S>, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut target = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        target = req.uri().to_string();
        Ok(resp)
    })
    .await
    .map_err(ws_io_err)?;
    Ok((WsStream::new(ws), target))
}

/// Open a WebSocket to `url` and wrap it as a byte stream.
pub async fn ws_connect(url: &str) -> io::Result<WsStream<MaybeTlsStream<TcpStream>>> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(ws_io_err)?;
    Ok(WsStream::new(ws))
}

/// A [`PickupDial`] that opens a WebSocket to `base_url` for each pickup,
/// carrying the pickup path in the upgrade request.
pub fn ws_pickup_dial(base_url: impl Into<String>) -> impl PickupDial {
    let base_url = base_url.into();
    move |conn_path: String| {
        let base_url = base_url.clone();
        async move {
            let conn: Conn = Box::new(ws_connect(&format!("{base_url}{conn_path}")).await?);
            Ok(conn)
        }
    }
}
