//! Self-deploying console demo
//!
//! Start a host (`distloop --listen 127.0.0.1:9096`), then run this binary
//! with the host endpoints. The binary ships itself to every host, and the
//! hosts start it again in agent mode to serve the `Primes` implementation.

use anyhow::Result;
use clap::Parser;
use distloop::agent::{self, Catalog, Implementation, MethodRegistry, Param, SessionContext};
use distloop::client::{Contract, Distributor, RemoteChannel};
use distloop::distributed::protocol::encode_value;
use distloop::logsink::{LogLevel, LogSink};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Parser, Debug)]
#[command(name = "console", about = "Distributed loop demo")]
struct Args {
    /// Host endpoints
    #[arg(default_value = "127.0.0.1:9096")]
    servers: Vec<SocketAddr>,

    /// Slots per logical processor
    #[arg(long, default_value_t = 0.5)]
    subscription_rate: f32,
}

struct Primes {
    from: AtomicI64,
    to: AtomicI64,
    log: LogSink,
}

impl Primes {
    fn count(&self) -> usize {
        let (from, to) = (self.from.load(Ordering::Relaxed), self.to.load(Ordering::Relaxed));
        (from.max(2)..to)
            .filter(|&n| (2..).take_while(|d| d * d <= n).all(|d| n % d != 0))
            .count()
    }
}

impl Implementation for Primes {
    const NAME: &'static str = "Primes";
    const CONTRACTS: &'static [&'static str] = &["IPrimes"];

    fn create(ctx: &SessionContext) -> Result<Self> {
        Ok(Primes {
            from: AtomicI64::new(1),
            to: AtomicI64::new(1000),
            log: ctx.log.clone(),
        })
    }

    fn register(methods: &mut MethodRegistry<Self>) {
        methods
            .method("set_from_to", &[Param::value("i64"), Param::value("i64")], |p: &Primes, args| {
                let (from, to): (i64, i64) = (args.get(0)?, args.get(1)?);
                p.from.store(from, Ordering::Relaxed);
                p.to.store(to, Ordering::Relaxed);
                p.log.info(format!("from {} and to {} set", from, to));
                Ok(())
            })
            .method("get_name", &[Param::value("String")], |p: &Primes, args| {
                let query: String = args.get(0)?;
                let primes = p.count();
                p.log.warning(format!("{} primes for {}", primes, query));
                Ok(format!("name:{}:{}", query, primes))
            });
    }
}

struct PrimesProxy(RemoteChannel);

impl Contract for PrimesProxy {
    const NAME: &'static str = "IPrimes";

    fn bind(channel: RemoteChannel) -> Self {
        PrimesProxy(channel)
    }
}

impl PrimesProxy {
    async fn set_from_to(&self, from: i64, to: i64) -> Result<()> {
        self.0
            .call("set_from_to", &["i64", "i64"], vec![encode_value(&from)?, encode_value(&to)?])
            .await
    }

    async fn get_name(&self, query: &str) -> Result<String> {
        self.0.call("get_name", &["String"], vec![encode_value(query)?]).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let catalog = Catalog::new().register::<Primes>();
    if agent::is_agent_invocation() {
        return agent::run_from_env(catalog).await;
    }

    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let client = Distributor::new(args.servers)
        .subscription_rate(args.subscription_rate)
        .log_polling_interval(1)
        .log_level(LogLevel::Debug)
        .connect::<PrimesProxy, Primes>()
        .await?;
    for failed in client.failed_nodes() {
        println!("Failed node {}", failed);
    }

    let mut events = client.subscribe_logs();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!();
            println!("Log messages:");
            for message in event.messages.iter().flatten() {
                println!("{}", message);
            }
            if let Some(failure) = event.last_error {
                println!("Error at {} on {} as: {}", failure.time, failure.end_point, failure.error);
            }
        }
    });

    let status = client
        .run_once_per_node((501i64, 3001i64), |_, (from, to), _state, proxy| async move {
            proxy.set_from_to(from, to).await
        })
        .await;
    for e in &status.exceptions {
        println!("{}", e);
    }

    let first = client
        .parallel_for(0, 10, |i, _state, proxy| async move { proxy.get_name(&i.to_string()).await })
        .await?;
    for name in &first.results {
        println!("{}", name);
    }
    client.sweep_logs().await;

    let second = client
        .parallel_for_each(first.results, |query, _state, proxy| async move { proxy.get_name(&query).await })
        .await?;
    for name in &second.results {
        println!("{}", name);
    }
    for e in first.exceptions.iter().chain(&second.exceptions) {
        println!("{}", e);
    }
    client.sweep_logs().await;

    client.shutdown().await;
    printer.abort();
    println!();
    println!("done");
    Ok(())
}
