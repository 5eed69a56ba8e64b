//! Engine orchestration: startup topology, shutdown sequencing.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use socket2::SockAddr;

use crate::balancer::{LoadBalancer, LoopHandle, new_balancer};
use crate::config::Options;
use crate::error::Error;
use crate::event_loop::{EventLoop, ticker_loop};
use crate::handle::Engine;
use crate::handler::{Action, EventHandler};
use crate::listener::{Listener, Network, parse_proto_addr};
use crate::poller::{Poller, Priority};

pub(crate) struct EngineCore {
    pub(crate) opts: Options,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) lb: Box<dyn LoadBalancer>,
    /// Main accept reactor; None in reuseport mode.
    main: Option<Arc<LoopHandle>>,
    pub(crate) local_addrs: Vec<SockAddr>,
    shutdown_fired: Mutex<bool>,
    shutdown_cond: Condvar,
    signal_once: Once,
    in_shutdown: AtomicBool,
    ticker_cancel: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    ticker_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineCore {
    pub(crate) fn is_in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    fn wait_for_shutdown(&self) {
        let mut fired = self.shutdown_fired.lock();
        while !*fired {
            self.shutdown_cond.wait(&mut fired);
        }
    }

    /// Fire the shutdown condition. At most once; later calls are no-ops.
    pub(crate) fn signal_shutdown(&self) {
        self.signal_once.call_once(|| {
            let mut fired = self.shutdown_fired.lock();
            *fired = true;
            self.shutdown_cond.notify_all();
        });
    }

    /// Funnel for every loop exit. Logs the error, if any, and signals the
    /// shutdown condition so the whole engine cascades down.
    pub(crate) fn shutdown(&self, err: Option<Error>) {
        if let Some(e) = err {
            tracing::error!(error = %e, "engine is stopping due to event-loop error");
        }
        self.signal_shutdown();
    }

    fn stop(&self, eng: Engine) {
        self.wait_for_shutdown();

        self.handler.on_shutdown(eng);

        // Unwind every worker loop.
        self.lb.iterate(&mut |_i, h| {
            let triggered = h.poller.trigger(
                Priority::Urgent,
                Box::new(|_el: &mut EventLoop| Err(Error::EngineShutdown)),
            );
            if let Err(e) = triggered {
                tracing::error!(error = %e, "failed to trigger shutdown on event-loop");
            }
            true
        });

        // The main reactor closes its listeners before unwinding so no new
        // connection slips in during teardown.
        if let Some(main) = &self.main {
            let triggered = main.poller.trigger(
                Priority::Urgent,
                Box::new(|el: &mut EventLoop| {
                    el.close_listeners();
                    Err(Error::EngineShutdown)
                }),
            );
            if let Err(e) = triggered {
                tracing::error!(error = %e, "failed to trigger shutdown on main event-loop");
            }
        }

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }

        self.lb.iterate(&mut |_i, h| {
            h.poller.close();
            true
        });
        if let Some(main) = &self.main {
            main.poller.close();
        }

        self.ticker_cancel.store(true, Ordering::Relaxed);
        if let Some(t) = self.ticker_thread.lock().take() {
            let _ = t.join();
        }

        self.in_shutdown.store(true, Ordering::Release);
    }
}

/// Run the engine on `addrs` until shutdown. Blocks the calling thread.
///
/// Addresses are proto-prefixed: `tcp://127.0.0.1:9000`, `udp://...`,
/// `unix://...` (bare addresses default to TCP). Returns once the engine
/// has fully stopped, or immediately with an error if startup fails.
pub fn serve(
    handler: Arc<dyn EventHandler>,
    addrs: &[&str],
    opts: Options,
) -> Result<(), Error> {
    if addrs.is_empty() {
        return Err(Error::InvalidAddr("no listener address".to_string()));
    }
    let parsed = addrs
        .iter()
        .map(|a| parse_proto_addr(a))
        .collect::<Result<Vec<_>, _>>()?;

    let num_loops = opts.event_loop_count();
    let has_udp = parsed.iter().any(|(network, _)| *network == Network::Udp);
    let reuseport_mode = opts.reuse_port || has_udp;
    // Sibling loops binding the same address need SO_REUSEPORT even when the
    // mode was forced by a UDP listener rather than configured.
    let reuse_flag = opts.reuse_port || (reuseport_mode && num_loops > 1);

    let mut primary = Vec::with_capacity(parsed.len());
    for (network, address) in &parsed {
        let per_socket_reuse = reuse_flag && *network != Network::Unix;
        primary.push(Listener::bind(*network, address, &opts, per_socket_reuse)?);
    }
    let local_addrs: Vec<SockAddr> = primary.iter().map(|l| l.local_addr().clone()).collect();

    // Extra listener sets for loops 1..N in reuseport mode, bound from the
    // kernel-resolved addresses so port 0 works. Unix listeners cannot be
    // rebound (the bind would steal the socket file) and stay on loop 0.
    let mut extra_sets: Vec<Vec<Listener>> = Vec::new();
    if reuseport_mode {
        for _ in 1..num_loops {
            let set = primary
                .iter()
                .filter(|l| l.network != Network::Unix)
                .map(|l| l.rebind(&opts))
                .collect::<Result<Vec<_>, _>>()?;
            extra_sets.push(set);
        }
    }

    let mut lb = new_balancer(opts.lb);
    let mut worker_handles = Vec::with_capacity(num_loops);
    for i in 0..num_loops {
        let handle = Arc::new(LoopHandle {
            idx: i as i32,
            poller: Arc::new(Poller::open()?),
            conn_count: AtomicI32::new(0),
        });
        lb.register(Arc::clone(&handle));
        worker_handles.push(handle);
    }
    let main_handle = if reuseport_mode {
        None
    } else {
        Some(Arc::new(LoopHandle {
            idx: -1,
            poller: Arc::new(Poller::open()?),
            conn_count: AtomicI32::new(0),
        }))
    };

    let core = Arc::new(EngineCore {
        opts: opts.clone(),
        handler: Arc::clone(&handler),
        lb,
        main: main_handle.clone(),
        local_addrs,
        shutdown_fired: Mutex::new(false),
        shutdown_cond: Condvar::new(),
        signal_once: Once::new(),
        in_shutdown: AtomicBool::new(false),
        ticker_cancel: Arc::new(AtomicBool::new(false)),
        threads: Mutex::new(Vec::new()),
        ticker_thread: Mutex::new(None),
    });

    let eng = Engine {
        eng: Some(Arc::clone(&core)),
    };
    if handler.on_boot(eng.clone()) == Action::Shutdown {
        return Ok(());
    }

    // Build every loop and register listener interest before any thread
    // starts, so startup errors surface without a teardown dance.
    let mut loops: Vec<EventLoop> = Vec::with_capacity(num_loops);
    let mut main_loop: Option<EventLoop> = None;
    if reuseport_mode {
        let mut sets = extra_sets.into_iter();
        for handle in &worker_handles {
            let set: AHashMap<RawFd, Listener> = if handle.idx == 0 {
                std::mem::take(&mut primary)
                    .into_iter()
                    .map(|l| (l.fd(), l))
                    .collect()
            } else {
                sets.next()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| (l.fd(), l))
                    .collect()
            };
            for &lfd in set.keys() {
                handle.poller.add_read(lfd)?;
            }
            loops.push(EventLoop::new(Arc::clone(&core), Arc::clone(handle), set));
        }
    } else {
        for handle in &worker_handles {
            loops.push(EventLoop::new(
                Arc::clone(&core),
                Arc::clone(handle),
                AHashMap::new(),
            ));
        }
        if let Some(mh) = &main_handle {
            let set: AHashMap<RawFd, Listener> =
                primary.into_iter().map(|l| (l.fd(), l)).collect();
            for &lfd in set.keys() {
                mh.poller.add_read(lfd)?;
            }
            main_loop = Some(EventLoop::new(Arc::clone(&core), Arc::clone(mh), set));
        }
    }

    {
        let mut threads = core.threads.lock();
        for el in loops {
            let name = format!("gyre-loop-{}", el.idx);
            let t = if reuseport_mode {
                thread::Builder::new().name(name).spawn(move || el.run())
            } else {
                thread::Builder::new().name(name).spawn(move || el.orbit())
            }
            .map_err(Error::Io)?;
            threads.push(t);
        }
        if let Some(el) = main_loop {
            let t = thread::Builder::new()
                .name("gyre-main".to_string())
                .spawn(move || el.rotate())
                .map_err(Error::Io)?;
            threads.push(t);
        }
    }

    if opts.ticker {
        let tick_target = if reuseport_mode {
            Some(Arc::clone(&worker_handles[0]))
        } else {
            main_handle.clone()
        };
        if let Some(target) = tick_target {
            let tick_handler = Arc::clone(&handler);
            let cancel = Arc::clone(&core.ticker_cancel);
            let t = thread::Builder::new()
                .name("gyre-ticker".to_string())
                .spawn(move || ticker_loop(tick_handler, target, cancel))
                .map_err(Error::Io)?;
            *core.ticker_thread.lock() = Some(t);
        }
    }

    core.stop(eng);
    Ok(())
}
