//! Host → worker relay over the session's Unix socket
//!
//! Every relayed request opens a fresh connection; nothing is pooled.

use crate::agent::socket_path;
use crate::distributed::protocol::{request, Message, SessionId};
use crate::error::DistError;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::time::sleep;

/// Delay between connection attempts while a worker is starting
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Connect to a live session
pub async fn connect(socket_dir: &Path, session_id: SessionId) -> Result<UnixStream> {
    let path = socket_path(socket_dir, session_id);
    UnixStream::connect(&path)
        .await
        .map_err(|e| anyhow::Error::new(DistError::SessionNotFound(session_id)).context(e.to_string()))
}

/// Wait until a freshly launched session accepts connections
pub async fn wait_for_session(socket_dir: &Path, session_id: SessionId, timeout: Duration) -> Result<()> {
    let path = socket_path(socket_dir, session_id);
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(&path).await {
            Ok(_) => return Ok(()),
            Err(e) if Instant::now() >= deadline => {
                return Err(e).with_context(|| {
                    format!("Session {} did not start within {}ms", session_id, timeout.as_millis())
                });
            }
            Err(_) => sleep(CONNECT_RETRY_DELAY).await,
        }
    }
}

/// Forward one worker-bound request and return the worker's reply
pub async fn relay(socket_dir: &Path, session_id: SessionId, msg: &Message) -> Result<Message> {
    let forwarded = msg
        .for_worker()
        .ok_or_else(|| DistError::Protocol(format!("{} cannot be relayed to a session", msg.name())))?;

    let mut stream = connect(socket_dir, session_id).await?;
    request(&mut stream, &forwarded)
        .await
        .with_context(|| format!("Relay of {} to session {} failed", msg.name(), session_id))
}
