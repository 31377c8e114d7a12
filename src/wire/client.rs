//! Outbound Message Helpers
//!
//! Connections are opened per message and closed after the write; nothing
//! is pooled. `broadcast` fans a payload out to many peers in parallel and
//! reports how many sends failed.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

/// Dial `addr`, write one JSON payload, close the connection.
pub async fn send_json<T: Serialize>(addr: &str, payload: &T) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to dial {}", addr))?;

    let raw = serde_json::to_vec(payload).context("failed to marshal payload")?;
    stream
        .write_all(&raw)
        .await
        .with_context(|| format!("failed to write payload to {}", addr))?;
    stream.shutdown().await.ok();
    Ok(())
}

/// Dial `addr`, write one JSON payload, then read the reply until EOF.
///
/// Used for the stats request/response exchange; the write half is shut
/// down so the remote side sees EOF on its read.
pub async fn request_json<T: Serialize>(addr: &str, payload: &T) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to dial {}", addr))?;

    let raw = serde_json::to_vec(payload).context("failed to marshal payload")?;
    stream
        .write_all(&raw)
        .await
        .with_context(|| format!("failed to write payload to {}", addr))?;

    // Half-close so the peer's read-to-EOF completes; the read side stays open
    stream.shutdown().await.ok();
    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .await
        .with_context(|| format!("failed to read reply from {}", addr))?;
    Ok(reply)
}

/// Send a payload to every address in parallel.
///
/// Errors are logged per destination; the return value is the number of
/// failed sends. Protocol state never depends on delivery.
pub async fn broadcast<T, I, S>(addrs: I, payload: &T) -> usize
where
    T: Serialize,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sends = addrs.into_iter().map(|addr| async move {
        let addr = addr.as_ref();
        match send_json(addr, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("broadcast send to {} failed: {:#}", addr, e);
                false
            }
        }
    });

    join_all(sends).await.iter().filter(|ok| !**ok).count()
}
