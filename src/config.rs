use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;

/// Load-balancing policy for assigning accepted connections to event loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbPolicy {
    /// Rotate through the loops with an atomic counter.
    #[default]
    RoundRobin,
    /// Pick the loop with the fewest live connections; ties break to the
    /// lower loop index.
    LeastConnections,
    /// Hash the remote address so one peer always lands on the same loop.
    SourceAddrHash,
}

/// Configuration for the engine.
#[derive(Clone)]
pub struct Options {
    /// Run one event loop per CPU. Ignored when `num_event_loop` is set.
    pub multicore: bool,
    /// Explicit event-loop count. 0 = derive from `multicore`.
    pub num_event_loop: usize,
    /// Load-balancing policy.
    pub lb: LbPolicy,
    /// Bind one listener per loop with SO_REUSEPORT instead of running a
    /// main accept reactor. Forced on when any listener is UDP.
    pub reuse_port: bool,
    /// Pin each event-loop thread to a CPU core.
    pub lock_os_thread: bool,
    /// Enable the periodic `on_tick` callback.
    pub ticker: bool,
    /// Size of the per-loop read scratch buffer.
    pub read_buffer_cap: usize,
    /// Keep-alive period applied to accepted TCP sockets.
    pub tcp_keepalive: Option<Duration>,
    /// Set TCP_NODELAY on accepted TCP sockets.
    pub tcp_nodelay: bool,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Frame codec prototype, cloned per connection. None = raw passthrough.
    pub codec: Option<Arc<dyn Codec>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            multicore: false,
            num_event_loop: 0,
            lb: LbPolicy::RoundRobin,
            reuse_port: false,
            lock_os_thread: false,
            ticker: false,
            read_buffer_cap: 64 * 1024,
            tcp_keepalive: None,
            tcp_nodelay: true,
            backlog: 1024,
            codec: None,
        }
    }
}

impl Options {
    /// Resolve the effective event-loop count.
    pub(crate) fn event_loop_count(&self) -> usize {
        if self.num_event_loop > 0 {
            self.num_event_loop
        } else if self.multicore {
            crate::affinity::num_cpus()
        } else {
            1
        }
    }

    /// Build a fresh per-connection codec instance.
    pub(crate) fn new_codec(&self) -> Box<dyn Codec> {
        match &self.codec {
            Some(proto) => proto.clone_box(),
            None => Box::new(crate::codec::RawCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = Options::default();
        assert!(!opts.multicore);
        assert_eq!(opts.num_event_loop, 0);
        assert_eq!(opts.lb, LbPolicy::RoundRobin);
        assert!(!opts.reuse_port);
        assert_eq!(opts.read_buffer_cap, 64 * 1024);
        assert_eq!(opts.event_loop_count(), 1);
    }

    #[test]
    fn explicit_loop_count_wins() {
        let opts = Options {
            multicore: true,
            num_event_loop: 3,
            ..Options::default()
        };
        assert_eq!(opts.event_loop_count(), 3);
    }

    #[test]
    fn multicore_uses_all_cpus() {
        let opts = Options {
            multicore: true,
            ..Options::default()
        };
        assert!(opts.event_loop_count() >= 1);
    }
}
