//! Loop state and results

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

/// Shared by every unit of one loop call
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    break_iteration: Arc<OnceLock<i64>>,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop launching new units
    ///
    /// Units already launched still run to completion. Only the first call
    /// is recorded.
    pub fn break_at(&self, iteration: i64) {
        let _ = self.break_iteration.set(iteration);
    }

    pub fn is_stopped(&self) -> bool {
        self.break_iteration.get().is_some()
    }

    pub fn break_iteration(&self) -> Option<i64> {
        self.break_iteration.get().copied()
    }
}

/// One failed loop iteration
#[derive(Debug)]
pub struct DistributedExceptionInfo {
    /// Iteration index, or node index for once-per-node loops
    pub index: i64,
    /// Debug rendering of the source value of a once-per-node loop
    pub source: Option<String>,
    pub end_point: SocketAddr,
    pub error: anyhow::Error,
    pub time_stamp: DateTime<Utc>,
}

impl DistributedExceptionInfo {
    pub fn new(index: i64, source: Option<String>, end_point: SocketAddr, error: anyhow::Error) -> Self {
        Self {
            index,
            source,
            end_point,
            error,
            time_stamp: Utc::now(),
        }
    }
}

impl fmt::Display for DistributedExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iteration {} on {}: {:#}", self.index, self.end_point, self.error)
    }
}

/// Outcome of a value-returning loop
///
/// `results` and `exceptions` are unordered.
#[derive(Debug)]
pub struct DistributedLoopResult<T> {
    pub results: Vec<T>,
    pub exceptions: Vec<DistributedExceptionInfo>,
    pub break_iteration: Option<i64>,
}

impl<T> Default for DistributedLoopResult<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            exceptions: Vec::new(),
            break_iteration: None,
        }
    }
}

impl<T> DistributedLoopResult<T> {
    /// Every launched iteration succeeded and no break was requested
    pub fn is_completed(&self) -> bool {
        self.exceptions.is_empty() && self.break_iteration.is_none()
    }

    /// Number of launched iterations
    pub fn launched(&self) -> usize {
        self.results.len() + self.exceptions.len()
    }

    pub fn into_status(self) -> DistributedLoopStatus {
        DistributedLoopStatus {
            exceptions: self.exceptions,
            break_iteration: self.break_iteration,
        }
    }
}

/// Outcome of a loop whose iterations return nothing
#[derive(Debug, Default)]
pub struct DistributedLoopStatus {
    pub exceptions: Vec<DistributedExceptionInfo>,
    pub break_iteration: Option<i64>,
}

impl DistributedLoopStatus {
    pub fn is_completed(&self) -> bool {
        self.exceptions.is_empty() && self.break_iteration.is_none()
    }
}
