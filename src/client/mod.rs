//! Distributed loop engine
//!
//! A [`DistributedClient`] owns the sessions created by a [`Distributor`]
//! and runs parallel loops over them. Every iteration becomes one spawned
//! task holding one proxy slot; an iteration that fails is recorded in the
//! loop result and never stops its siblings.
//!
//! # Example
//!
//! ```no_run
//! # use distloop::client::{Distributor, RemoteChannel, Contract};
//! # use distloop::distributed::protocol::encode_value;
//! struct Squarer(RemoteChannel);
//!
//! impl Contract for Squarer {
//!     const NAME: &'static str = "ISquarer";
//!     fn bind(channel: RemoteChannel) -> Self {
//!         Squarer(channel)
//!     }
//! }
//!
//! # async fn run() -> distloop::Result<()> {
//! let client = Distributor::new(["10.0.0.1:9096".parse()?, "10.0.0.2:9096".parse()?])
//!     .connect_named::<Squarer>("Squarer")
//!     .await?;
//! let result = client
//!     .parallel_for(0, 1000, |i, _state, proxy| async move {
//!         proxy.0.call::<i64>("square", &["i64"], vec![encode_value(&i)?]).await
//!     })
//!     .await?;
//! println!("{} results, {} failures", result.results.len(), result.exceptions.len());
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod distributor;
pub mod logs;
pub mod slots;
pub mod state;

pub use channel::{CallObserver, CallOutcome, Contract, RemoteChannel, ServiceClient};
pub use distributor::{Distributor, FailedNode};
pub use logs::{LogCollector, LogMessageEvent, LogPollFailure};
pub use slots::{Slot, SlotPool};
pub use state::{DistributedExceptionInfo, DistributedLoopResult, DistributedLoopStatus, LoopState};

use crate::config::ConnectOptions;
use crate::distributed::protocol::DistributedSessionNode;
use crate::error::DistError;
use crate::logsink::LogMessage;
use crate::Result;
use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

/// One launched iteration awaiting its outcome
struct Unit<T> {
    index: i64,
    end_point: SocketAddr,
    handle: JoinHandle<Result<T>>,
}

/// Sessions on connected nodes plus the slot pool driving them
///
/// Prefer [`shutdown`](Self::shutdown), which waits for every session to
/// be killed. Dropping the client inside a runtime spawns the kills and
/// returns; outside one, sessions live until their time to live runs out.
pub struct DistributedClient<P> {
    servers: Vec<SocketAddr>,
    nodes: Vec<DistributedSessionNode>,
    failed_nodes: Vec<FailedNode>,
    subscription_rate: f32,
    pool: SlotPool<P>,
    logs: Arc<LogCollector>,
    poller: Option<JoinHandle<()>>,
}

impl<P> std::fmt::Debug for DistributedClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedClient")
            .field("servers", &self.servers)
            .field("nodes", &self.nodes)
            .field("failed_nodes", &self.failed_nodes)
            .field("subscription_rate", &self.subscription_rate)
            .finish_non_exhaustive()
    }
}

impl<P: Contract> DistributedClient<P> {
    /// Build the slot pool and start log polling
    ///
    /// Must be called within a tokio runtime when polling is enabled.
    pub fn new(
        servers: Vec<SocketAddr>,
        nodes: Vec<DistributedSessionNode>,
        failed_nodes: Vec<FailedNode>,
        options: &ConnectOptions,
    ) -> Self {
        let pool = SlotPool::new(&nodes, options.subscription_rate, options.shuffle_seed);
        let logs = Arc::new(LogCollector::new(
            nodes.iter().map(|n| (n.end_point, n.session_id)).collect(),
        ));
        let poller = match options.log_polling_interval() {
            Some(interval) if !nodes.is_empty() => Some(logs::spawn_poller(logs.clone(), interval)),
            _ => None,
        };
        debug!("Client built with {} slots over {} nodes", pool.len(), nodes.len());

        Self {
            servers,
            nodes,
            failed_nodes,
            subscription_rate: options.subscription_rate,
            pool,
            logs,
            poller,
        }
    }

    /// Every server the connect call was asked to use
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Nodes with a live session
    pub fn nodes(&self) -> &[DistributedSessionNode] {
        &self.nodes
    }

    pub fn failed_nodes(&self) -> &[FailedNode] {
        &self.failed_nodes
    }

    pub fn subscription_rate(&self) -> f32 {
        self.subscription_rate
    }

    pub fn slot_count(&self) -> usize {
        self.pool.len()
    }

    /// In-flight invocations per node, in node order
    pub fn node_job_counts(&self) -> Vec<i64> {
        self.pool.node_job_counts()
    }

    /// Run `body` for every index in `from..to`
    ///
    /// Fails only when there is work to do and no node is connected.
    pub async fn parallel_for<T, F, Fut>(&self, from: i64, to: i64, body: F) -> Result<DistributedLoopResult<T>>
    where
        T: Send + 'static,
        F: Fn(i64, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.dispatch((from..to).map(|i| (i, ())), |i, (), state, proxy| body(i, state, proxy))
            .await
    }

    /// Run `body` for every element of `source`
    ///
    /// Exceptions are indexed by element position.
    pub async fn parallel_for_each<W, I, T, F, Fut>(&self, source: I, body: F) -> Result<DistributedLoopResult<T>>
    where
        I: IntoIterator<Item = W>,
        T: Send + 'static,
        F: Fn(W, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let items: Vec<W> = source.into_iter().collect();
        let work = items.into_iter().enumerate().map(|(i, item)| (i as i64, item));
        self.dispatch(work, |_, item, state, proxy| body(item, state, proxy)).await
    }

    /// Run `body` exactly once on every connected node
    ///
    /// Uses each node's dedicated proxy, independent of the pool. Exceptions
    /// are indexed by node and carry the debug rendering of `source`.
    pub async fn once_per_node<S, T, F, Fut>(&self, source: S, body: F) -> DistributedLoopResult<T>
    where
        S: Clone + Debug,
        T: Send + 'static,
        F: Fn(usize, S, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let state = LoopState::new();
        let mut units = Vec::with_capacity(self.pool.node_slots().len());
        for (node_index, slot) in self.pool.node_slots().iter().enumerate() {
            if state.is_stopped() {
                break;
            }
            let unit = body(node_index, source.clone(), state.clone(), slot.proxy.clone());
            units.push(Unit {
                index: node_index as i64,
                end_point: slot.end_point,
                handle: tokio::spawn(unit),
            });
        }
        collect(units, Some(format!("{:?}", source)), &state).await
    }

    pub async fn run_for<F, Fut>(&self, from: i64, to: i64, body: F) -> Result<DistributedLoopStatus>
    where
        F: Fn(i64, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Ok(self.parallel_for(from, to, body).await?.into_status())
    }

    pub async fn run_for_each<W, I, F, Fut>(&self, source: I, body: F) -> Result<DistributedLoopStatus>
    where
        I: IntoIterator<Item = W>,
        F: Fn(W, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Ok(self.parallel_for_each(source, body).await?.into_status())
    }

    pub async fn run_once_per_node<S, F, Fut>(&self, source: S, body: F) -> DistributedLoopStatus
    where
        S: Clone + Debug,
        F: Fn(usize, S, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.once_per_node(source, body).await.into_status()
    }

    /// Launch one unit per work item on the next available slot
    async fn dispatch<W, T, F, Fut>(
        &self,
        work: impl Iterator<Item = (i64, W)>,
        body: F,
    ) -> Result<DistributedLoopResult<T>>
    where
        T: Send + 'static,
        F: Fn(i64, W, LoopState, Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut work = work.peekable();
        if work.peek().is_none() {
            return Ok(DistributedLoopResult::default());
        }
        if self.pool.is_empty() {
            return Err(DistError::NoSlots.into());
        }

        let state = LoopState::new();
        let mut units = Vec::new();
        for (index, item) in work {
            if state.is_stopped() {
                break;
            }
            let slot = self.pool.next_available().await.ok_or(DistError::NoSlots)?;
            // A unit may have broken the loop while this one waited for a slot
            if state.is_stopped() {
                break;
            }
            let unit = body(index, item, state.clone(), slot.proxy.clone());
            units.push(Unit {
                index,
                end_point: slot.end_point,
                handle: tokio::spawn(unit),
            });
        }
        Ok(collect(units, None, &state).await)
    }
}

impl<P> DistributedClient<P> {
    /// Poll every node for logs now
    ///
    /// Returns the messages retrieved by this poll, if any.
    pub async fn sweep_logs(&self) -> Option<LogMessageEvent> {
        self.logs.sweep().await
    }

    /// Every log message retrieved so far; order is not guaranteed
    pub fn read_log_messages(&self) -> Vec<LogMessage> {
        self.logs.read()
    }

    pub fn clear_log_messages(&self) {
        self.logs.clear();
    }

    /// Receive one event per poll that retrieved messages
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogMessageEvent> {
        self.logs.subscribe()
    }

    /// Stop polling and kill every session
    ///
    /// Failures to reach a node are logged and otherwise ignored. Dropping
    /// the client instead only fires the kills without waiting for them.
    pub async fn shutdown(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }

        let nodes = std::mem::take(&mut self.nodes);
        let kills: Vec<_> = nodes.iter().map(spawn_kill).collect();
        for kill in kills {
            match kill.await {
                Ok((_, Ok(()))) => {}
                Ok((end_point, Err(e))) => debug!("Failed to kill session on {}: {:#}", end_point, e),
                Err(e) => debug!("Kill task failed: {}", e),
            }
        }
        info!("Disconnected from {} nodes", nodes.len());
    }
}

impl<P> Drop for DistributedClient<P> {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if self.nodes.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No runtime to kill {} sessions; they expire with their time to live", self.nodes.len());
            return;
        }
        for node in self.nodes.drain(..) {
            drop(spawn_kill(&node));
        }
    }
}

fn spawn_kill(node: &DistributedSessionNode) -> JoinHandle<(SocketAddr, Result<()>)> {
    let client = ServiceClient::new(node.end_point);
    let session_id = node.session_id;
    tokio::spawn(async move { (client.server(), client.kill_session(session_id).await) })
}

/// Wait for every unit and sort outcomes into results and exceptions
async fn collect<T>(units: Vec<Unit<T>>, source: Option<String>, state: &LoopState) -> DistributedLoopResult<T> {
    let mut result = DistributedLoopResult::default();
    for unit in units {
        let outcome = match unit.handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(join_error(e)),
        };
        match outcome {
            Ok(value) => result.results.push(value),
            Err(error) => {
                debug!("Iteration {} on {} failed: {:#}", unit.index, unit.end_point, error);
                result.exceptions.push(DistributedExceptionInfo::new(
                    unit.index,
                    source.clone(),
                    unit.end_point,
                    error,
                ));
            }
        }
    }
    result.break_iteration = state.break_iteration();
    result
}

fn join_error(e: JoinError) -> anyhow::Error {
    if e.is_panic() {
        anyhow::anyhow!("iteration panicked: {}", panic_message(e.into_panic()))
    } else {
        anyhow::anyhow!("iteration cancelled")
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(s) => s.to_string(),
            Err(_) => "non-string payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Catalog, Implementation, MethodRegistry, Param, SessionContext};
    use crate::config::HostConfig;
    use crate::distributed::protocol::encode_value;
    use crate::host::{HostService, RunningHost};
    use crate::logsink::LogSink;
    use crate::package::Packager;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Worker side of the test contract
    struct Calc {
        base: AtomicI64,
        log: LogSink,
    }

    impl Implementation for Calc {
        const NAME: &'static str = "Calc";
        const CONTRACTS: &'static [&'static str] = &["ICalc"];

        fn create(ctx: &SessionContext) -> Result<Self> {
            Ok(Calc {
                base: AtomicI64::new(0),
                log: ctx.log.clone(),
            })
        }

        fn register(methods: &mut MethodRegistry<Self>) {
            methods
                .method("offset", &[Param::value("i64")], |calc: &Calc, args| {
                    let n: i64 = args.get(0)?;
                    Ok(n + calc.base.load(Ordering::SeqCst))
                })
                .method("set_base", &[Param::value("i64")], |calc: &Calc, args| {
                    calc.base.store(args.get(0)?, Ordering::SeqCst);
                    Ok(())
                })
                .method("reject", &[Param::value("i64")], |_: &Calc, args| -> Result<i64> {
                    let n: i64 = args.get(0)?;
                    anyhow::bail!("rejected {}", n)
                })
                .method("note", &[Param::value("String")], |calc: &Calc, args| {
                    calc.log.error(args.get::<String>(0)?);
                    Ok(())
                });
        }
    }

    /// Client side adapter
    struct CalcProxy(RemoteChannel);

    impl Contract for CalcProxy {
        const NAME: &'static str = "ICalc";

        fn bind(channel: RemoteChannel) -> Self {
            CalcProxy(channel)
        }
    }

    impl CalcProxy {
        async fn offset(&self, n: i64) -> Result<i64> {
            self.0.call("offset", &["i64"], vec![encode_value(&n)?]).await
        }

        async fn set_base(&self, base: i64) -> Result<()> {
            self.0.call("set_base", &["i64"], vec![encode_value(&base)?]).await
        }

        async fn reject(&self, n: i64) -> Result<i64> {
            self.0.call("reject", &["i64"], vec![encode_value(&n)?]).await
        }

        async fn note(&self, text: &str) -> Result<()> {
            self.0.call("note", &["String"], vec![encode_value(text)?]).await
        }
    }

    struct Cluster {
        _dirs: Vec<TempDir>,
        hosts: Vec<RunningHost>,
        packager: Packager,
    }

    async fn cluster(count: usize) -> Cluster {
        let mut dirs = Vec::new();
        let mut hosts = Vec::new();
        for _ in 0..count {
            let dir = TempDir::new().unwrap();
            let config = HostConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                package_dir: dir.path().join("_dpack"),
                exec_dir: dir.path().join("_dexec"),
                socket_dir: dir.path().join("sock"),
                run_local_in_process: true,
                logical_processors: Some(4),
                ..Default::default()
            };
            hosts.push(
                HostService::with_catalog(config, Catalog::new().register::<Calc>())
                    .start()
                    .await
                    .unwrap(),
            );
            dirs.push(dir);
        }

        let app = TempDir::new().unwrap();
        std::fs::write(app.path().join("calc"), b"entry").unwrap();
        let packager = Packager::from_dir(app.path(), "calc").unwrap();
        dirs.push(app);

        Cluster {
            _dirs: dirs,
            hosts,
            packager,
        }
    }

    impl Cluster {
        async fn connect(&self) -> DistributedClient<CalcProxy> {
            Distributor::new(self.hosts.iter().map(|h| h.local_addr()))
                .package(self.packager.clone())
                .log_polling_interval(0)
                .shuffle_seed(11)
                .connect::<CalcProxy, Calc>()
                .await
                .unwrap()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_for_over_two_nodes() {
        let cluster = cluster(2).await;
        let client = cluster.connect().await;
        assert_eq!(client.nodes().len(), 2);
        assert!(client.failed_nodes().is_empty());
        assert_eq!(client.slot_count(), 8);

        let result = client
            .parallel_for(0, 8, |i, _state, proxy| async move { proxy.offset(i).await })
            .await
            .unwrap();
        assert!(result.is_completed());
        let values: BTreeSet<i64> = result.results.into_iter().collect();
        assert_eq!(values, (0..8).collect());
        assert_eq!(client.node_job_counts(), vec![0, 0]);

        client.shutdown().await;
        for host in &cluster.hosts {
            assert_eq!(host.service().session_count(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drop_kills_sessions() {
        let cluster = cluster(2).await;
        let client = cluster.connect().await;
        for host in &cluster.hosts {
            assert_eq!(host.service().session_count(), 1);
        }

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.hosts.iter().any(|h| h.service().session_count() > 0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_connect_reuses_package() {
        let cluster = cluster(1).await;
        let first = cluster.connect().await;
        let second = cluster.connect().await;
        assert_eq!(first.nodes().len(), 1);
        assert_eq!(second.nodes().len(), 1);
        assert_ne!(first.nodes()[0].session_id, second.nodes()[0].session_id);
        assert_eq!(cluster.hosts[0].service().session_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_once_per_node_sets_node_state() {
        let cluster = cluster(2).await;
        let client = cluster.connect().await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let result = {
            let calls = calls.clone();
            client
                .once_per_node(100i64, move |node, base, _state, proxy| {
                    let calls = calls.clone();
                    async move {
                        calls.lock().unwrap().push(node);
                        proxy.set_base(base).await
                    }
                })
                .await
        };
        assert!(result.is_completed());
        assert_eq!(result.results.len(), 2);
        let mut nodes = calls.lock().unwrap().clone();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![0, 1]);

        // Every pool slot now sees its node's singleton with the new base
        let result = client
            .parallel_for(0, 16, |i, _state, proxy| async move { proxy.offset(i).await })
            .await
            .unwrap();
        let values: BTreeSet<i64> = result.results.into_iter().collect();
        assert_eq!(values, (100..116).collect());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exceptions_are_isolated() {
        let cluster = cluster(2).await;
        let client = cluster.connect().await;

        let result = client
            .parallel_for(0, 20, |i, _state, proxy| async move {
                if i % 5 == 0 {
                    proxy.reject(i).await
                } else {
                    proxy.offset(i).await
                }
            })
            .await
            .unwrap();

        assert_eq!(result.launched(), 20);
        assert_eq!(result.results.len(), 16);
        let mut failed: Vec<i64> = result.exceptions.iter().map(|e| e.index).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![0, 5, 10, 15]);

        let addrs: Vec<SocketAddr> = cluster.hosts.iter().map(|h| h.local_addr()).collect();
        for info in &result.exceptions {
            assert!(addrs.contains(&info.end_point));
            let remote = info.error.downcast_ref::<DistError>().and_then(|e| e.remote_message());
            assert_eq!(remote, Some(format!("rejected {}", info.index).as_str()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_index_ends_exactly_once() {
        let cluster = cluster(2).await;
        let client = cluster.connect().await;

        let (from, to) = (5i64, 37i64);
        let result = client
            .parallel_for(from, to, |i, _state, proxy| async move {
                if i % 3 == 0 {
                    proxy.reject(i).await
                } else if i % 7 == 0 {
                    panic!("index {}", i)
                } else {
                    proxy.offset(i).await
                }
            })
            .await
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(result.break_iteration, None);
        assert_eq!((result.results.len() + result.exceptions.len()) as i64, to - from);

        let mut seen: Vec<i64> = result.results.clone();
        seen.extend(result.exceptions.iter().map(|e| e.index));
        seen.sort_unstable();
        assert_eq!(seen, (from..to).collect::<Vec<_>>());

        for info in &result.exceptions {
            assert!((from..to).contains(&info.index));
            let message = format!("{:#}", info.error);
            if info.index % 3 == 0 {
                assert!(message.contains(&format!("rejected {}", info.index)), "{}", message);
            } else {
                assert_eq!(info.index % 7, 0);
                assert!(message.contains("panicked"), "{}", message);
            }
        }
        assert_eq!(result.exceptions.iter().filter(|e| e.index % 3 != 0).count(), 4);
        assert_eq!(client.node_job_counts(), vec![0, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_break_stops_new_iterations() {
        let cluster = cluster(1).await;
        let client = cluster.connect().await;

        // Breaking while the unit is created makes the cut-off exact
        let result = client
            .parallel_for(0, 1000, |i, state, proxy| {
                if i == 3 {
                    state.break_at(i);
                }
                async move { proxy.offset(i).await }
            })
            .await
            .unwrap();

        assert_eq!(result.break_iteration, Some(3));
        assert!(!result.is_completed());
        assert_eq!(result.launched(), 4);
        let values: BTreeSet<i64> = result.results.into_iter().collect();
        assert_eq!(values, (0..4).collect());

        // A break from inside a running unit still lets launched units finish
        let result = client
            .parallel_for(0, 50, |i, state, proxy| async move {
                if i == 0 {
                    state.break_at(0);
                }
                proxy.offset(i).await
            })
            .await
            .unwrap();
        assert_eq!(result.break_iteration, Some(0));
        assert!(result.results.contains(&0));
        assert!(result.exceptions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_iteration_is_recorded() {
        let cluster = cluster(1).await;
        let client = cluster.connect().await;

        let status = client
            .run_for(0, 4, |i, _state, proxy| async move {
                if i == 2 {
                    panic!("unit two");
                }
                proxy.offset(i).await.map(|_| ())
            })
            .await
            .unwrap();
        assert_eq!(status.exceptions.len(), 1);
        assert_eq!(status.exceptions[0].index, 2);
        assert!(status.exceptions[0].error.to_string().contains("unit two"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_for_each_and_empty_ranges() {
        let cluster = cluster(1).await;
        let client = cluster.connect().await;

        let result = client
            .parallel_for_each(vec![10i64, 20, 30], |n, _state, proxy| async move { proxy.offset(n).await })
            .await
            .unwrap();
        let values: BTreeSet<i64> = result.results.into_iter().collect();
        assert_eq!(values, [10, 20, 30].into_iter().collect());

        let status = client
            .run_for(5, 5, |_, _state, _proxy| async move { Ok(()) })
            .await
            .unwrap();
        assert!(status.is_completed());
        let status = client
            .run_for_each(Vec::<i64>::new(), |_, _state, _proxy| async move { Ok(()) })
            .await
            .unwrap();
        assert!(status.is_completed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_logs_are_swept_from_every_node() {
        let cluster = cluster(2).await;
        let client = cluster.connect().await;
        let mut events = client.subscribe_logs();

        let status = client
            .run_once_per_node("hello", |node, text, _state, proxy| async move {
                proxy.note(&format!("{} from {}", text, node)).await
            })
            .await;
        assert!(status.is_completed());

        let event = client.sweep_logs().await.unwrap();
        assert_eq!(event.messages.len(), 2);
        assert!(event.last_error.is_none());
        assert_eq!(events.recv().await.unwrap().messages.len(), 2);

        let mut texts: Vec<String> = client.read_log_messages().into_iter().map(|m| m.message).collect();
        texts.sort();
        assert_eq!(texts, vec!["hello from 0", "hello from 1"]);

        client.clear_log_messages();
        assert!(client.read_log_messages().is_empty());
        assert!(client.sweep_logs().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_host_does_not_block_others() {
        let cluster = cluster(1).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let live = cluster.hosts[0].local_addr();
        let client = Distributor::new([live, dead])
            .package(cluster.packager.clone())
            .log_polling_interval(0)
            .connect::<CalcProxy, Calc>()
            .await
            .unwrap();

        assert_eq!(client.servers(), &[live, dead]);
        assert_eq!(client.nodes().len(), 1);
        assert_eq!(client.failed_nodes().len(), 1);
        assert_eq!(client.failed_nodes()[0].end_point, dead);
        assert_eq!(client.slot_count(), 4);
    }

    #[tokio::test]
    async fn test_no_slots() {
        let client: DistributedClient<CalcProxy> =
            DistributedClient::new(vec![], vec![], vec![], &ConnectOptions::default());
        let err = client
            .parallel_for(0, 3, |i, _state, _proxy| async move { Ok(i) })
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<DistError>(), Some(DistError::NoSlots)));

        let result = client.once_per_node((), |_, _, _state, _proxy| async move { Ok(()) }).await;
        assert!(result.results.is_empty());
        tokio::time::timeout(Duration::from_secs(1), client.shutdown()).await.unwrap();
    }
}
