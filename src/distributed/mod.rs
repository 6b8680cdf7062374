//! Shared wire types and framing
//!
//! # Architecture
//!
//! - **Client**: pushes packages, creates sessions, drives distributed loops
//! - **Host**: one per machine; stores packages, spawns worker sessions and
//!   relays calls to them over a local socket
//! - **Worker session**: one process per session hosting a single
//!   implementation instance
//!
//! All coordination is hub-and-spoke from the client; nodes never talk to
//! each other.

pub mod protocol;

pub use protocol::{
    DistributedSessionNode,
    DistributedSessionRequest,
    ErrorKind,
    ErrorMessage,
    InvokeResponse,
    MemoryDetail,
    Message,
    MethodSyncInfo,
    RemoteFault,
    SessionId,
    PROTOCOL_VERSION,
};
