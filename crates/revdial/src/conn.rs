//! Byte-stream connection type used across the tunneling layer.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream: a TCP socket, an in-memory duplex pipe, a
/// [`WsStream`](crate::WsStream) adapter. Dropping it closes the underlying
/// transport.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

impl fmt::Debug for dyn ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ByteStream")
    }
}

/// Owned, type-erased connection handed across the layer's seams.
pub type Conn = Box<dyn ByteStream>;
