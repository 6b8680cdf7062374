//! Wire protocol shared by both hops
//!
//! The same message set travels over the network hop (client → host) and the
//! local hop (host → worker session). Each connection carries exactly one
//! request followed by one response; the host relays worker-addressed
//! requests unmodified.
//!
//! # Message Flow
//!
//! ```text
//! Client                        Host                         Worker
//!   |-- HasPackage ------------->|                              |
//!   |<------------- HasPackage --|                              |
//!   |-- AddUpdatePackage ------->|                              |
//!   |<----------- PackageStored -|                              |
//!   |-- CreateSession ---------->|-- spawn(6 positional args) ->|
//!   |<---------- SessionCreated -|                              |
//!   |-- SyncInterface(id) ------>|-- SyncInterface ------------>|
//!   |<--------------- Interface -|<------------------ Interface-|
//!   |-- InvokeRemoteMethod ----->|-- InvokeRemoteMethod ------->|
//!   |<----------------- Invoked -|<-------------------- Invoked-|
//!   |-- SweepLogMessages ------->|-- SweepLogMessages --------->|
//!   |<------------- LogMessages -|<---------------- LogMessages-|
//!   |-- KillSession(id) -------->|-- KillSession -------------->|
//!   |<----------- SessionKilled -|<-------------- SessionKilled-|
//! ```
//!
//! # Message Framing
//!
//! ```text
//! [4 bytes: message length (little-endian u32)][N bytes: MessagePack message]
//! ```

use crate::error::{DistError, FaultKind};
use crate::logsink::{LogLevel, LogMessage};
use crate::package::PackageHash;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted from a peer (packages travel in one frame)
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

/// Default session lifetime when a request asks for zero hours
pub const DEFAULT_HOURS_TO_LIVE: u16 = 48;

/// Session identifier (128-bit random)
pub type SessionId = Uuid;

/// Request to start a worker session on a host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedSessionRequest {
    pub protocol_version: u32,
    /// Fresh for every request
    pub session_id: SessionId,
    pub package_name: String,
    pub hours_to_live: u16,
    pub log_level: LogLevel,
    pub contract_type_name: String,
    pub implementation_type_name: String,
}

impl DistributedSessionRequest {
    pub fn new(
        package_name: impl Into<String>,
        contract_type_name: impl Into<String>,
        implementation_type_name: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id: Uuid::new_v4(),
            package_name: package_name.into(),
            hours_to_live: DEFAULT_HOURS_TO_LIVE,
            log_level: LogLevel::Error,
            contract_type_name: contract_type_name.into(),
            implementation_type_name: implementation_type_name.into(),
        }
    }

    /// Hours the worker is told to live; zero means the default
    pub fn effective_hours_to_live(&self) -> u16 {
        normalize_hours_to_live(self.hours_to_live)
    }
}

/// Zero hours is treated as the default lifetime
pub fn normalize_hours_to_live(hours: u16) -> u16 {
    if hours == 0 {
        DEFAULT_HOURS_TO_LIVE
    } else {
        hours
    }
}

/// Memory snapshot of a host machine, in kilobytes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryDetail {
    pub total_visible_memory_kb: u64,
    pub total_virtual_memory_kb: u64,
    pub free_physical_memory_kb: u64,
    pub free_virtual_memory_kb: u64,
}

/// A session successfully created on one host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedSessionNode {
    pub session_id: SessionId,
    pub package_name: String,
    pub end_point: SocketAddr,
    pub logical_processor_count: usize,
    pub memory: MemoryDetail,
}

/// One entry of a worker's method table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodSyncInfo {
    pub method_ident: u32,
    pub method_name: String,
    pub parameter_types: Vec<String>,
}

/// Failure raised by the invoked method itself, delivered as data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<RemoteFault> for DistError {
    fn from(fault: RemoteFault) -> Self {
        DistError::RemoteFault {
            kind: fault.kind,
            message: fault.message,
        }
    }
}

/// Result of invoking one remote method
///
/// On success `values[0]` is the encoded return value and `values[1..]`
/// echo the by-reference parameters (`None` for by-value positions). On a
/// fault `values` holds a single encoded [`RemoteFault`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvokeResponse {
    pub fault: bool,
    pub values: Vec<Option<Vec<u8>>>,
}

impl InvokeResponse {
    pub fn success(values: Vec<Option<Vec<u8>>>) -> Self {
        Self { fault: false, values }
    }

    pub fn faulted(fault: &RemoteFault) -> Self {
        let encoded = rmp_serde::to_vec(fault).ok();
        Self {
            fault: true,
            values: vec![encoded],
        }
    }

    /// Decode the fault carried by a faulted response
    pub fn fault_info(&self) -> Option<RemoteFault> {
        if !self.fault {
            return None;
        }
        let decoded = self
            .values
            .first()
            .and_then(|v| v.as_deref())
            .and_then(|bytes| rmp_serde::from_slice::<RemoteFault>(bytes).ok());
        Some(decoded.unwrap_or_else(|| RemoteFault::new(FaultKind::Invocation, "undecodable remote fault")))
    }
}

/// Error reply from either hop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    pub error: String,
}

/// Matchable class of an [`ErrorMessage`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    PackageNotFound,
    SessionNotFound,
    Protocol,
    Internal,
}

impl ErrorMessage {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Convert a reply into the caller-side error
    pub fn into_error(self) -> anyhow::Error {
        match self.kind {
            ErrorKind::PackageNotFound => DistError::PackageNotFound(self.error).into(),
            ErrorKind::Protocol => DistError::Protocol(self.error).into(),
            ErrorKind::SessionNotFound => match Uuid::parse_str(&self.error) {
                Ok(id) => DistError::SessionNotFound(id).into(),
                Err(_) => anyhow::anyhow!("session not found: {}", self.error),
            },
            ErrorKind::Internal => anyhow::anyhow!("remote error: {}", self.error),
        }
    }

    /// Classify a local error for transmission
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<DistError>() {
            Some(DistError::PackageNotFound(name)) => Self::new(ErrorKind::PackageNotFound, name.clone()),
            Some(DistError::SessionNotFound(id)) => Self::new(ErrorKind::SessionNotFound, id.to_string()),
            Some(DistError::Protocol(reason)) => Self::new(ErrorKind::Protocol, reason.clone()),
            _ => Self::new(ErrorKind::Internal, format!("{:#}", err)),
        }
    }
}

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Ask whether an equal package is already stored (Client → Host)
    HasPackage(PackageHash),

    /// Reply to `HasPackage` (Host → Client)
    HasPackageReply(bool),

    /// Replace a package's files and descriptor (Client → Host)
    AddUpdatePackage { hash: PackageHash, bundle: Vec<u8> },

    /// Package stored (Host → Client)
    PackageStored,

    /// Start a worker session (Client → Host)
    CreateSession(DistributedSessionRequest),

    /// Session started (Host → Client)
    SessionCreated(DistributedSessionNode),

    /// Terminate a session
    ///
    /// Client → Host carries the session id; Host → Worker carries `None`
    /// because the local endpoint already addresses one session.
    KillSession(Option<SessionId>),

    /// Session terminated (Worker → Host → Client)
    SessionKilled,

    /// Fetch the worker's method table
    SyncInterface(Option<SessionId>),

    /// Method table (Worker → Host → Client)
    Interface(Vec<MethodSyncInfo>),

    /// Invoke one method on the session singleton
    InvokeRemoteMethod {
        session_id: Option<SessionId>,
        method_ident: u32,
        params: Vec<Vec<u8>>,
    },

    /// Invocation outcome (Worker → Host → Client)
    Invoked(InvokeResponse),

    /// Drain the worker's buffered log messages
    SweepLogMessages(Option<SessionId>),

    /// Drained log messages (Worker → Host → Client)
    LogMessages(Vec<LogMessage>),

    /// Request failed on the receiving side
    Error(ErrorMessage),
}

impl Message {
    /// Session addressed by a worker-bound request, if any
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Message::KillSession(id)
            | Message::SyncInterface(id)
            | Message::SweepLogMessages(id) => *id,
            Message::InvokeRemoteMethod { session_id, .. } => *session_id,
            _ => None,
        }
    }

    /// Copy of a worker-bound request with the session address stripped
    pub fn for_worker(&self) -> Option<Message> {
        match self {
            Message::KillSession(_) => Some(Message::KillSession(None)),
            Message::SyncInterface(_) => Some(Message::SyncInterface(None)),
            Message::SweepLogMessages(_) => Some(Message::SweepLogMessages(None)),
            Message::InvokeRemoteMethod {
                method_ident,
                params,
                ..
            } => Some(Message::InvokeRemoteMethod {
                session_id: None,
                method_ident: *method_ident,
                params: params.clone(),
            }),
            _ => None,
        }
    }

    /// Short name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Message::HasPackage(_) => "HasPackage",
            Message::HasPackageReply(_) => "HasPackageReply",
            Message::AddUpdatePackage { .. } => "AddUpdatePackage",
            Message::PackageStored => "PackageStored",
            Message::CreateSession(_) => "CreateSession",
            Message::SessionCreated(_) => "SessionCreated",
            Message::KillSession(_) => "KillSession",
            Message::SessionKilled => "SessionKilled",
            Message::SyncInterface(_) => "SyncInterface",
            Message::Interface(_) => "Interface",
            Message::InvokeRemoteMethod { .. } => "InvokeRemoteMethod",
            Message::Invoked(_) => "Invoked",
            Message::SweepLogMessages(_) => "SweepLogMessages",
            Message::LogMessages(_) => "LogMessages",
            Message::Error(_) => "Error",
        }
    }
}

/// Serialize a message to a length-prefixed frame
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    if msg_bytes.len() > MAX_MESSAGE_BYTES {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_bytes.len());
    }

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from a buffer holding at least one complete frame
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one complete message from a stream
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_BYTES {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(msg)
}

/// Write one message to a stream and flush it
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;

    stream.write_all(&framed).await.context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

/// Send one request and wait for its response on an established stream
pub async fn request<S>(stream: &mut S, msg: &Message) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, msg).await?;
    read_message(stream).await
}

/// Encode one call parameter or return value
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).context("Failed to encode value")
}

/// Decode one call parameter or return value
pub fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).context("Failed to decode value")
}
