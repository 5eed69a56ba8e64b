//! Event-loop selection for newly accepted connections.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use socket2::SockAddr;

use crate::config::LbPolicy;
use crate::poller::Poller;

/// The externally shareable face of an event loop: enough to target its
/// trigger queue and track its load, without touching loop-owned state.
pub(crate) struct LoopHandle {
    pub(crate) idx: i32,
    pub(crate) poller: Arc<Poller>,
    /// Live connection count, maintained by the owning loop.
    pub(crate) conn_count: AtomicI32,
}

/// Holds the ordered set of event loops and picks the target for each new
/// connection. Topology is immutable once the engine has started.
pub(crate) trait LoadBalancer: Send + Sync {
    /// Called exactly once per loop during setup, in idx order.
    fn register(&mut self, handle: Arc<LoopHandle>);

    /// Select the loop for a connection from `remote`.
    fn next(&self, remote: Option<&SockAddr>) -> Arc<LoopHandle>;

    /// Visit loops in idx order until `f` returns false.
    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool);

    fn len(&self) -> usize;
}

pub(crate) fn new_balancer(policy: LbPolicy) -> Box<dyn LoadBalancer> {
    match policy {
        LbPolicy::RoundRobin => Box::new(RoundRobin::default()),
        LbPolicy::LeastConnections => Box::new(LeastConnections::default()),
        LbPolicy::SourceAddrHash => Box::new(SourceAddrHash::default()),
    }
}

#[derive(Default)]
struct RoundRobin {
    loops: Vec<Arc<LoopHandle>>,
    cursor: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn register(&mut self, handle: Arc<LoopHandle>) {
        debug_assert_eq!(handle.idx as usize, self.loops.len());
        self.loops.push(handle);
    }

    fn next(&self, _remote: Option<&SockAddr>) -> Arc<LoopHandle> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool) {
        for (i, handle) in self.loops.iter().enumerate() {
            if !f(i, handle) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.loops.len()
    }
}

#[derive(Default)]
struct LeastConnections {
    loops: Vec<Arc<LoopHandle>>,
}

impl LoadBalancer for LeastConnections {
    fn register(&mut self, handle: Arc<LoopHandle>) {
        debug_assert_eq!(handle.idx as usize, self.loops.len());
        self.loops.push(handle);
    }

    fn next(&self, _remote: Option<&SockAddr>) -> Arc<LoopHandle> {
        // Scanning in idx order breaks count ties toward the lower idx.
        let mut best = &self.loops[0];
        let mut best_count = best.conn_count.load(Ordering::Relaxed);
        for handle in &self.loops[1..] {
            let count = handle.conn_count.load(Ordering::Relaxed);
            if count < best_count {
                best = handle;
                best_count = count;
            }
        }
        best.clone()
    }

    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool) {
        for (i, handle) in self.loops.iter().enumerate() {
            if !f(i, handle) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.loops.len()
    }
}

#[derive(Default)]
struct SourceAddrHash {
    loops: Vec<Arc<LoopHandle>>,
    /// One hasher instance per balancer: the mapping stays stable for the
    /// engine's lifetime.
    hasher: ahash::RandomState,
}

/// Reduce a peer address to the part that identifies the source host, so
/// reconnects from the same peer land on the same loop.
fn normalize_addr(addr: &SockAddr) -> String {
    if let Some(socket_addr) = addr.as_socket() {
        socket_addr.ip().to_string()
    } else if let Some(path) = addr.as_pathname() {
        path.display().to_string()
    } else {
        String::new()
    }
}

impl LoadBalancer for SourceAddrHash {
    fn register(&mut self, handle: Arc<LoopHandle>) {
        debug_assert_eq!(handle.idx as usize, self.loops.len());
        self.loops.push(handle);
    }

    fn next(&self, remote: Option<&SockAddr>) -> Arc<LoopHandle> {
        let i = match remote {
            Some(addr) => {
                let mut h = self.hasher.build_hasher();
                normalize_addr(addr).hash(&mut h);
                (h.finish() % self.loops.len() as u64) as usize
            }
            None => 0,
        };
        self.loops[i].clone()
    }

    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool) {
        for (i, handle) in self.loops.iter().enumerate() {
            if !f(i, handle) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.loops.len()
    }
}
