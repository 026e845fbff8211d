// SPDX-License-Identifier: MIT

//! Minimal HTTP/1.1 client for the container runtime's Unix socket.
//!
//! Two shapes: buffered request/response for the control endpoints
//! (inspect, update, ping) and a streaming GET for the log and event
//! feeds, which the runtime serves with chunked transfer encoding on a
//! connection that stays open while `follow` is set.

use super::{ByteStream, RuntimeError};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// A buffered response from a control endpoint.
#[derive(Debug)]
pub(crate) struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    /// Map HTTP-level failures onto the runtime error taxonomy.
    pub fn ok(self, context: &str) -> Result<Vec<u8>, RuntimeError> {
        match self.status {
            200..=299 => Ok(self.body),
            status => Err(http_error(status, &self.body, context)),
        }
    }
}

/// 404 means the container is gone; anything else is transient.
fn http_error(status: u16, body: &[u8], context: &str) -> RuntimeError {
    let detail = String::from_utf8_lossy(body);
    let detail = detail.trim();
    if status == 404 {
        RuntimeError::Gone(format!("{context}: {detail}"))
    } else {
        RuntimeError::Transient(format!("{context}: HTTP {status}: {detail}"))
    }
}

fn io_err(context: &str, e: std::io::Error) -> RuntimeError {
    RuntimeError::Transient(format!("{context}: {e}"))
}

/// Buffered request against the runtime socket.
pub(crate) async fn request(
    sock: &Path,
    method: &str,
    path: &str,
    json_body: Option<&str>,
) -> Result<Response, RuntimeError> {
    let stream =
        UnixStream::connect(sock).await.map_err(|e| io_err("runtime socket connect", e))?;
    let mut reader = BufReader::new(stream);

    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some(body) = json_body {
        req.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ));
    } else {
        req.push_str("\r\n");
    }
    reader
        .get_mut()
        .write_all(req.as_bytes())
        .await
        .map_err(|e| io_err("runtime request write", e))?;

    let head = read_head(&mut reader).await?;
    let body = match head.content_length {
        Some(len) => {
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.map_err(|e| io_err("runtime body read", e))?;
            buf
        }
        None if head.chunked => read_chunked_to_end(&mut reader).await?,
        None => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.map_err(|e| io_err("runtime body read", e))?;
            buf
        }
    };
    Ok(Response { status: head.status, body })
}

/// Streaming GET. The body is forwarded chunk-by-chunk over the returned
/// channel; an `Err` item reports the failure that ended the stream.
pub(crate) async fn stream(sock: &Path, path: &str) -> Result<ByteStream, RuntimeError> {
    let stream =
        UnixStream::connect(sock).await.map_err(|e| io_err("runtime socket connect", e))?;
    let mut reader = BufReader::new(stream);

    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    reader
        .get_mut()
        .write_all(req.as_bytes())
        .await
        .map_err(|e| io_err("runtime request write", e))?;

    let head = read_head(&mut reader).await?;
    if !(200..=299).contains(&head.status) {
        let body = match head.content_length {
            Some(len) => {
                let mut buf = vec![0u8; len];
                let _ = reader.read_exact(&mut buf).await;
                buf
            }
            None => Vec::new(),
        };
        return Err(http_error(head.status, &body, "runtime stream"));
    }

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let result = if head.chunked {
            forward_chunked(&mut reader, &tx).await
        } else {
            forward_raw(&mut reader, &tx).await
        };
        if let Err(e) = result {
            let _ = tx.send(Err(e)).await;
        }
    });
    Ok(rx)
}

struct Head {
    status: u16,
    content_length: Option<usize>,
    chunked: bool,
}

async fn read_head(reader: &mut BufReader<UnixStream>) -> Result<Head, RuntimeError> {
    let status_line = read_line(reader).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RuntimeError::Transient(format!("bad status line: {status_line:?}")))?;

    let mut content_length = None;
    let mut chunked = false;
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else { continue };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse().ok(),
            "transfer-encoding" => chunked = value.trim().eq_ignore_ascii_case("chunked"),
            _ => {}
        }
    }
    Ok(Head { status, content_length, chunked })
}

async fn read_line(reader: &mut BufReader<UnixStream>) -> Result<String, RuntimeError> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    reader.read_line(&mut line).await.map_err(|e| io_err("runtime header read", e))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_chunk_size(reader: &mut BufReader<UnixStream>) -> Result<usize, RuntimeError> {
    let line = read_line(reader).await?;
    let size_part = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size_part, 16)
        .map_err(|_| RuntimeError::Transient(format!("bad chunk size: {line:?}")))
}

async fn read_chunked_to_end(
    reader: &mut BufReader<UnixStream>,
) -> Result<Vec<u8>, RuntimeError> {
    let mut body = Vec::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            let _ = read_line(reader).await;
            return Ok(body);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| io_err("runtime chunk read", e))?;
        let _ = read_line(reader).await; // trailing CRLF
    }
}

async fn forward_chunked(
    reader: &mut BufReader<UnixStream>,
    tx: &mpsc::Sender<Result<Vec<u8>, RuntimeError>>,
) -> Result<(), RuntimeError> {
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; size];
        reader.read_exact(&mut buf).await.map_err(|e| io_err("runtime chunk read", e))?;
        let _ = read_line(reader).await; // trailing CRLF
        if tx.send(Ok(buf)).await.is_err() {
            return Ok(()); // receiver detached
        }
    }
}

async fn forward_raw(
    reader: &mut BufReader<UnixStream>,
    tx: &mpsc::Sender<Result<Vec<u8>, RuntimeError>>,
) -> Result<(), RuntimeError> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| io_err("runtime stream read", e))?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
            return Ok(());
        }
    }
}
