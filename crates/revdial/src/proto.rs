//! Control-connection wire protocol.
//!
//! One JSON object per newline-terminated line:
//!
//! ```text
//! {"command":"keep-alive"}
//! {"command":"conn-ready","connPath":"/revdial?dialer=<id>"}
//! {"command":"pickup-failed","connPath":"/revdial?dialer=<id>","err":"<reason>"}
//! ```
//!
//! The message set is closed. An unknown command or an unparseable line is a
//! [`ProtoError`] and fatal to the connection that produced it.

use crate::error::ProtoError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on one control line. Real messages stay well under 200 bytes.
pub const MAX_LINE_BYTES: usize = 4096;

/// Messages exchanged on the control connection. No payload data ever
/// travels here; data flows over separately picked-up connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Periodic liveness beacon from the dialing side.
    KeepAlive,
    /// The public side wants a new connection; the listener should dial
    /// `conn_path` back.
    ConnReady {
        #[serde(rename = "connPath")]
        conn_path: String,
    },
    /// The listener could not complete the pickup for `conn_path`.
    PickupFailed {
        #[serde(rename = "connPath")]
        conn_path: String,
        err: String,
    },
}

/// Build the pickup path advertised in `conn-ready`: `<base_path>?dialer=<id>`.
pub fn conn_path(base_path: &str, id: &str) -> String {
    format!("{base_path}?dialer={id}")
}

/// Serialize `msg` as one newline-terminated line and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(msg).map_err(|e| ProtoError::Malformed(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next control message. `Ok(None)` means the peer closed the
/// connection cleanly between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ControlMessage>, ProtoError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(ProtoError::Malformed("eof mid-line".into()));
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                line.extend_from_slice(&buf[..idx]);
                reader.consume(idx + 1);
                if line.len() > MAX_LINE_BYTES {
                    return Err(ProtoError::Oversized(line.len()));
                }
                break;
            }
            None => {
                line.extend_from_slice(buf);
                let n = buf.len();
                reader.consume(n);
                if line.len() > MAX_LINE_BYTES {
                    return Err(ProtoError::Oversized(line.len()));
                }
            }
        }
    }

    let text = std::str::from_utf8(&line).map_err(|e| ProtoError::Malformed(e.to_string()))?;
    let msg = serde_json::from_str(text.trim_end_matches('\r'))
        .map_err(|e| ProtoError::Malformed(e.to_string()))?;
    Ok(Some(msg))
}
