//! Minimal HTTP/1.1 head parsing and writing for the pickup handshake.
//!
//! Just enough to serve `GET <base_path>?dialer=<id>` upgrades, to issue them
//! from the listener side, and to let registration endpoints hand a hijacked
//! connection over after a bare `200 OK`. Not a general HTTP implementation;
//! bodies are never read.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on a request or response head. Upgrade heads are tiny.
pub const MAX_HEAD_BYTES: usize = 8192;

/// Parsed request line plus headers. Whatever follows the blank line on the
/// stream belongs to the upgraded protocol.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Path portion of the request target, without the query string.
    pub fn path(&self) -> &str {
        target_path(&self.target)
    }

    /// First value of a query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        target_query_param(&self.target, name)
    }

    /// Header value, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Path portion of a request target.
pub fn target_path(target: &str) -> &str {
    match target.split_once('?') {
        Some((path, _)) => path,
        None => target,
    }
}

/// First value of the query parameter `name` in a request target.
pub fn target_query_param<'a>(target: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = target.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Read up to the blank line ending an HTTP head, one byte at a time so
/// nothing past the head is consumed from the stream.
async fn read_head<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-head",
            ));
        }
        head.push(byte[0]);
        if head.len() > MAX_HEAD_BYTES {
            return Err(invalid("http head too large"));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }
    String::from_utf8(head).map_err(|e| invalid(&e.to_string()))
}

/// Parse one HTTP/1.1 request head off the stream.
pub async fn read_request_head<S>(stream: &mut S) -> io::Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(stream).await?;
    let mut lines = head.lines();
    let request_line = lines.next().ok_or_else(|| invalid("empty request head"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid("missing method"))?;
    let target = parts.next().ok_or_else(|| invalid("missing request target"))?;
    let version = parts.next().ok_or_else(|| invalid("missing http version"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(invalid("unsupported http version"));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| invalid("malformed header"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        headers,
    })
}

/// Read a response head and return its status code.
pub async fn read_response_status<S>(stream: &mut S) -> io::Result<u16>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(stream).await?;
    let status_line = head.lines().next().ok_or_else(|| invalid("empty response head"))?;

    let mut parts = status_line.split_whitespace();
    let version = parts.next().ok_or_else(|| invalid("missing http version"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(invalid("unsupported http version"));
    }
    let code = parts.next().ok_or_else(|| invalid("missing status code"))?;
    code.parse::<u16>().map_err(|_| invalid("malformed status code"))
}

/// Write the upgrade request that opens a pickup (or registration) leg.
pub async fn write_upgrade_request<S>(stream: &mut S, host: &str, target: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let req = format!(
        "GET {target} HTTP/1.1\r\nHost: {host}\r\nUpgrade: revdial\r\nConnection: Upgrade\r\n\r\n"
    );
    stream.write_all(req.as_bytes()).await?;
    stream.flush().await
}

/// Write the `101 Switching Protocols` head that completes a pickup.
pub async fn write_upgrade_response<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: revdial\r\nConnection: Upgrade\r\n\r\n",
        )
        .await?;
    stream.flush().await
}

/// Write the bare `200 OK` a registration endpoint sends before handing the
/// hijacked connection to the tunnel.
pub async fn write_hijack_response<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    stream.flush().await
}

/// Write a plain-text error response.
pub async fn write_error_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{body}\n");
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}
