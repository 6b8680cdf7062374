//! Session log sink
//!
//! Worker sessions buffer application log messages in a [`LogSink`] until a
//! client sweeps them. The sink is created once at process start and handed
//! to every component that logs (the implementation singleton receives it
//! through its `SessionContext`).
//!
//! Messages below the sink's level are dropped, except errors which are
//! always recorded. A sweep drains the buffer and returns the drained
//! messages ordered by UTC timestamp.

use chrono::{DateTime, Local, Utc};
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Log verbosity, ordered from least to most verbose
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    #[default]
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    /// Convert from the numeric form used on worker command lines
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LogLevel::Error),
            1 => Some(LogLevel::Warning),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Debug),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warning => write!(f, "Warning"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    /// Accepts either the numeric form ("2") or the name ("info")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return LogLevel::from_u8(n)
                .ok_or_else(|| anyhow::anyhow!("Log level out of range: {}", n));
        }
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => anyhow::bail!("Unknown log level: {}", other),
        }
    }
}

/// One buffered application log message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMessage {
    pub time_stamp: DateTime<Local>,
    pub time_stamp_utc: DateTime<Utc>,
    pub server_name: String,
    pub end_point: Option<SocketAddr>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.time_stamp.format("%Y%m%d_%H%M%S%.3f"),
            self.level,
            self.server_name,
            self.message
        )
    }
}

/// Replace line breaks so a message always renders on one line
pub fn flatten(message: &str) -> String {
    message.replace('\r', ":").replace('\n', ":")
}

struct SinkInner {
    level: AtomicU8,
    end_point: Option<SocketAddr>,
    server_name: String,
    messages: SegQueue<LogMessage>,
}

/// Buffered, level-filtered log sink shared by one worker session
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    /// Create a sink stamping messages with this machine's name
    pub fn new(level: LogLevel, end_point: Option<SocketAddr>) -> Self {
        let server_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::with_server_name(level, end_point, server_name)
    }

    pub fn with_server_name(level: LogLevel, end_point: Option<SocketAddr>, server_name: String) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                level: AtomicU8::new(level.as_u8()),
                end_point,
                server_name,
                messages: SegQueue::new(),
            }),
        }
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level.as_u8(), Ordering::Relaxed);
    }

    pub fn end_point(&self) -> Option<SocketAddr> {
        self.inner.end_point
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Error, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        if self.level() >= LogLevel::Warning {
            self.write(LogLevel::Warning, message.as_ref());
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        if self.level() >= LogLevel::Info {
            self.write(LogLevel::Info, message.as_ref());
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        if self.level() >= LogLevel::Debug {
            self.write(LogLevel::Debug, message.as_ref());
        }
    }

    /// Number of messages currently buffered
    pub fn len(&self) -> usize {
        self.inner.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.messages.is_empty()
    }

    /// Drain every buffered message, oldest first by UTC timestamp
    ///
    /// Messages written concurrently with a sweep land either in this
    /// sweep or the next one; none are lost or returned twice.
    pub fn sweep(&self) -> Vec<LogMessage> {
        let mut drained = Vec::with_capacity(self.inner.messages.len());
        while let Some(msg) = self.inner.messages.pop() {
            drained.push(msg);
        }
        drained.sort_by_key(|m| m.time_stamp_utc);
        drained
    }

    fn write(&self, level: LogLevel, message: &str) {
        let message = flatten(message);
        match level {
            LogLevel::Error => tracing::error!(target: "distloop::session", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "distloop::session", "{}", message),
            LogLevel::Info => tracing::info!(target: "distloop::session", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "distloop::session", "{}", message),
        }
        self.inner.messages.push(LogMessage {
            time_stamp: Local::now(),
            time_stamp_utc: Utc::now(),
            server_name: self.inner.server_name.clone(),
            end_point: self.inner.end_point,
            level,
            message,
        });
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("level", &self.level())
            .field("end_point", &self.inner.end_point)
            .field("buffered", &self.len())
            .finish()
    }
}
