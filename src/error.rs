//! Typed failures
//!
//! Most of the crate propagates `anyhow::Error`. The variants here are the
//! failures callers are expected to match on; recover them with
//! `err.downcast_ref::<DistError>()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of a fault raised on the worker side of a remote call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FaultKind {
    /// The method identifier is not in the worker's method table
    MethodNotFound,
    /// The invoked method returned an error
    Invocation,
    /// The invoked method panicked
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::MethodNotFound => write!(f, "method not found"),
            FaultKind::Invocation => write!(f, "invocation failed"),
            FaultKind::Panic => write!(f, "method panicked"),
        }
    }
}

/// Errors surfaced by the distribution layer
#[derive(Debug, Error)]
pub enum DistError {
    #[error("package does not exist: {0}")]
    PackageNotFound(String),

    #[error("no live session with id {0}")]
    SessionNotFound(uuid::Uuid),

    #[error("unknown method identifier {ident}")]
    MethodNotFound { ident: u32 },

    #[error("cannot match method '{name}' to its server side equivalent")]
    MethodUnresolved { name: String },

    #[error("remote {kind}: {message}")]
    RemoteFault { kind: FaultKind, message: String },

    #[error("contract and implementation mismatch: {implementation} does not implement {contract}")]
    ContractMismatch {
        contract: String,
        implementation: String,
    },

    #[error("unknown type name: {0}")]
    UnknownType(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no connected slots available")]
    NoSlots,
}

impl DistError {
    /// Message carried by a remote fault, if this is one
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            DistError::RemoteFault { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_fault_display() {
        let err = DistError::RemoteFault {
            kind: FaultKind::Invocation,
            message: "divide by zero".to_string(),
        };
        assert_eq!(err.to_string(), "remote invocation failed: divide by zero");
        assert_eq!(err.remote_message(), Some("divide by zero"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = DistError::PackageNotFound("app".to_string()).into();
        match err.downcast_ref::<DistError>() {
            Some(DistError::PackageNotFound(name)) => assert_eq!(name, "app"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
