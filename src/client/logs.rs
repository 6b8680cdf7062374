//! Log polling
//!
//! Sessions buffer their application logs; the client collects them by
//! sweeping every node on a timer and on demand. Retrieved batches are
//! appended to a cumulative collection and announced to subscribers.

use super::channel::ServiceClient;
use crate::distributed::protocol::SessionId;
use crate::logsink::LogMessage;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Bounded wait for an in-flight poll before a forced sweep
const SWEEP_WAIT_ATTEMPTS: usize = 20;
const SWEEP_WAIT_DELAY: Duration = Duration::from_millis(50);

const EVENT_CAPACITY: usize = 64;

/// A node whose log poll failed
#[derive(Debug, Clone)]
pub struct LogPollFailure {
    pub end_point: SocketAddr,
    pub error: String,
    pub time: DateTime<Utc>,
}

/// Logs retrieved by one poll
#[derive(Debug, Clone)]
pub struct LogMessageEvent {
    /// One non-empty batch per node that returned messages
    pub messages: Vec<Vec<LogMessage>>,
    /// Last node failure of this poll, if any
    pub last_error: Option<LogPollFailure>,
}

pub struct LogCollector {
    targets: Vec<(ServiceClient, SessionId)>,
    polling: AtomicBool,
    messages: Mutex<Vec<Vec<LogMessage>>>,
    events: broadcast::Sender<LogMessageEvent>,
}

/// Clears the polling flag when a poll ends, however it ends
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LogCollector {
    pub fn new(targets: Vec<(SocketAddr, SessionId)>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            targets: targets
                .into_iter()
                .map(|(end_point, session_id)| (ServiceClient::new(end_point), session_id))
                .collect(),
            polling: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessageEvent> {
        self.events.subscribe()
    }

    /// Poll every node once unless a poll is already in flight
    ///
    /// Returns the event raised for this poll, if anything was retrieved.
    pub async fn poll(&self) -> Option<LogMessageEvent> {
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _guard = PollGuard(&self.polling);

        let handles: Vec<_> = self
            .targets
            .iter()
            .map(|&(client, session_id)| {
                tokio::spawn(async move { (client.server(), client.sweep_log_messages(session_id).await) })
            })
            .collect();

        let mut batches = Vec::new();
        let mut last_error = None;
        for handle in handles {
            match handle.await {
                Ok((_, Ok(batch))) if !batch.is_empty() => batches.push(batch),
                Ok((_, Ok(_))) => {}
                Ok((end_point, Err(e))) => {
                    debug!("Log poll of {} failed: {:#}", end_point, e);
                    last_error = Some(LogPollFailure {
                        end_point,
                        error: format!("{:#}", e),
                        time: Utc::now(),
                    });
                }
                Err(e) => debug!("Log poll task failed: {}", e),
            }
        }

        if batches.is_empty() {
            return None;
        }

        self.lock_messages().extend(batches.iter().cloned());
        let event = LogMessageEvent {
            messages: batches,
            last_error,
        };
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Force a poll, first waiting briefly for an in-flight one to finish
    pub async fn sweep(&self) -> Option<LogMessageEvent> {
        for _ in 0..SWEEP_WAIT_ATTEMPTS {
            if !self.is_polling() {
                break;
            }
            tokio::time::sleep(SWEEP_WAIT_DELAY).await;
        }
        self.poll().await
    }

    /// Every message retrieved so far, flattened
    pub fn read(&self) -> Vec<LogMessage> {
        self.lock_messages().iter().flatten().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock_messages().clear();
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, Vec<Vec<LogMessage>>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Poll on a fixed interval until the returned task is aborted
pub fn spawn_poller(collector: Arc<LogCollector>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            collector.poll().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::protocol::{read_message, write_message, Message};
    use crate::logsink::LogLevel;
    use chrono::Local;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn message(text: &str) -> LogMessage {
        LogMessage {
            time_stamp: Local::now(),
            time_stamp_utc: Utc::now(),
            server_name: "node".to_string(),
            end_point: None,
            level: LogLevel::Error,
            message: text.to_string(),
        }
    }

    /// Host stand-in that answers every sweep with `batch`
    async fn fake_host(batch: Vec<LogMessage>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let _ = read_message(&mut stream).await.unwrap();
                write_message(&mut stream, &Message::LogMessages(batch.clone())).await.unwrap();
            }
        });
        addr
    }

    async fn dead_end_point() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_poll_collects_and_reports_failures() {
        let good = fake_host(vec![message("a"), message("b")]).await;
        let empty = fake_host(vec![]).await;
        let dead = dead_end_point().await;
        let collector = LogCollector::new(vec![
            (good, Uuid::new_v4()),
            (empty, Uuid::new_v4()),
            (dead, Uuid::new_v4()),
        ]);
        let mut events = collector.subscribe();

        let event = collector.poll().await.unwrap();
        assert_eq!(event.messages.len(), 1);
        assert_eq!(event.messages[0].len(), 2);
        assert_eq!(event.last_error.as_ref().unwrap().end_point, dead);

        let received = events.recv().await.unwrap();
        assert_eq!(received.messages[0][1].message, "b");

        collector.sweep().await.unwrap();
        assert_eq!(collector.read().len(), 4);
        collector.clear();
        assert!(collector.read().is_empty());
        assert!(!collector.is_polling());
    }

    #[tokio::test]
    async fn test_no_event_without_messages() {
        let empty = fake_host(vec![]).await;
        let collector = LogCollector::new(vec![(empty, Uuid::new_v4())]);
        let mut events = collector.subscribe();

        assert!(collector.poll().await.is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_poll_is_skipped() {
        let collector = LogCollector::new(vec![]);
        collector.polling.store(true, Ordering::Release);
        assert!(collector.poll().await.is_none());
        assert!(collector.is_polling());
    }

    #[tokio::test]
    async fn test_poller_runs_on_interval() {
        let good = fake_host(vec![message("tick")]).await;
        let collector = Arc::new(LogCollector::new(vec![(good, Uuid::new_v4())]));
        let mut events = collector.subscribe();

        let poller = spawn_poller(collector.clone(), Duration::from_millis(20));
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.messages[0][0].message, "tick");
        poller.abort();
    }
}
