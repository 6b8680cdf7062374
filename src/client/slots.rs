//! Slot pool
//!
//! A slot is one proxy bound to one session, plus an availability flag that
//! the proxy's channel flips around each remote invocation. Every connected
//! node contributes `max(1, round(logical processors × subscription rate))`
//! slots, and the whole pool is shuffled once so that a forward scan spreads
//! early work across nodes.
//!
//! Each node additionally gets one dedicated proxy outside the pool, used by
//! once-per-node loops.

use super::channel::{CallObserver, Contract, RemoteChannel};
use crate::distributed::protocol::DistributedSessionNode;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One proxy of the pool
pub struct Slot<P> {
    pub proxy: Arc<P>,
    pub node_index: usize,
    pub end_point: SocketAddr,
    busy: Arc<AtomicBool>,
}

impl<P> Clone for Slot<P> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            node_index: self.node_index,
            end_point: self.end_point,
            busy: self.busy.clone(),
        }
    }
}

impl<P> Slot<P> {
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Flips a slot's flag and its node's job counter around each invocation
struct SlotObserver {
    busy: Arc<AtomicBool>,
    node_jobs: Arc<Vec<AtomicI64>>,
    node_index: usize,
    released: Arc<Notify>,
}

impl CallObserver for SlotObserver {
    fn call_started(&self) {
        self.busy.store(true, Ordering::Release);
        if let Some(jobs) = self.node_jobs.get(self.node_index) {
            jobs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn call_finished(&self) {
        if let Some(jobs) = self.node_jobs.get(self.node_index) {
            jobs.fetch_sub(1, Ordering::Relaxed);
        }
        self.busy.store(false, Ordering::Release);
        self.released.notify_waiters();
    }
}

/// Number of pool slots created for one node
pub fn slots_for(logical_processors: usize, subscription_rate: f32) -> usize {
    let scaled = (logical_processors as f64 * f64::from(subscription_rate)).round();
    if scaled.is_finite() && scaled >= 1.0 {
        scaled as usize
    } else {
        1
    }
}

pub struct SlotPool<P> {
    slots: Vec<Slot<P>>,
    node_slots: Vec<Slot<P>>,
    last: AtomicUsize,
    released: Arc<Notify>,
    node_jobs: Arc<Vec<AtomicI64>>,
}

impl<P: Contract> SlotPool<P> {
    /// Build and shuffle the pool for the connected nodes
    pub fn new(nodes: &[DistributedSessionNode], subscription_rate: f32, shuffle_seed: Option<u64>) -> Self {
        let released = Arc::new(Notify::new());
        let node_jobs: Arc<Vec<AtomicI64>> = Arc::new(nodes.iter().map(|_| AtomicI64::new(0)).collect());

        let bind = |node_index: usize, node: &DistributedSessionNode| -> Slot<P> {
            let busy = Arc::new(AtomicBool::new(false));
            let observer = Arc::new(SlotObserver {
                busy: busy.clone(),
                node_jobs: node_jobs.clone(),
                node_index,
                released: released.clone(),
            });
            let channel = RemoteChannel::new(node.end_point, node.session_id).with_observer(observer);
            Slot {
                proxy: Arc::new(P::bind(channel)),
                node_index,
                end_point: node.end_point,
                busy,
            }
        };

        let mut slots = Vec::new();
        for (node_index, node) in nodes.iter().enumerate() {
            for _ in 0..slots_for(node.logical_processor_count, subscription_rate) {
                slots.push(bind(node_index, node));
            }
        }
        let node_slots = nodes.iter().enumerate().map(|(i, node)| bind(i, node)).collect();

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(shuffle_seed.unwrap_or_else(rand::random));
        slots.shuffle(&mut rng);

        let last = slots.len().saturating_sub(1);
        Self {
            slots,
            node_slots,
            last: AtomicUsize::new(last),
            released,
            node_jobs,
        }
    }
}

impl<P> SlotPool<P> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot<P>] {
        &self.slots
    }

    /// One dedicated slot per connected node, in node order
    pub fn node_slots(&self) -> &[Slot<P>] {
        &self.node_slots
    }

    /// In-flight invocations per node, in node order
    pub fn node_job_counts(&self) -> Vec<i64> {
        self.node_jobs.iter().map(|j| j.load(Ordering::Relaxed)).collect()
    }

    /// Next available slot, scanning forward from the last one dispatched
    ///
    /// The most recently dispatched slot is the final candidate of each
    /// scan, so a slot is never handed out twice in a row while another is
    /// free. Waits without timeout until some slot frees up; returns `None`
    /// only for an empty pool.
    pub async fn next_available(&self) -> Option<Slot<P>> {
        if self.slots.is_empty() {
            return None;
        }
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(index) = self.scan() {
                self.last.store(index, Ordering::Release);
                return Some(self.slots[index].clone());
            }
            released.await;
        }
    }

    fn scan(&self) -> Option<usize> {
        let n = self.slots.len();
        let last = self.last.load(Ordering::Acquire);
        (1..=n)
            .map(|step| (last + step) % n)
            .find(|&i| !self.slots[i].is_busy())
    }
}
