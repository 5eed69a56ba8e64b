//! Event loops: one polling thread per loop, owning its connections.
//!
//! Topology decides the entry point. In reuseport mode every loop runs
//! [`EventLoop::run`], accepting on its own listeners and doing I/O. In
//! reactor mode a main loop runs [`EventLoop::rotate`] (accept only,
//! handing fds to workers through their urgent trigger queue) while the
//! workers run [`EventLoop::orbit`] (I/O only).

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use socket2::{SockAddr, Socket};

use crate::affinity;
use crate::balancer::LoopHandle;
use crate::conn::Conn;
use crate::engine::EngineCore;
use crate::error::Error;
use crate::handler::{Action, EventHandler};
use crate::listener::{Listener, Network};
use crate::poller::{Poller, Priority};

pub(crate) struct EventLoop {
    pub(crate) idx: i32,
    engine: Arc<EngineCore>,
    handle: Arc<LoopHandle>,
    pub(crate) poller: Arc<Poller>,
    handler: Arc<dyn EventHandler>,
    /// Listeners this loop accepts on. Empty for reactor-mode workers.
    listeners: AHashMap<RawFd, Listener>,
    /// Connections owned by this loop, keyed by fd. Never touched from
    /// another thread.
    connections: AHashMap<RawFd, Conn>,
    /// Read scratch buffer, sized by `read_buffer_cap`.
    buffer: Vec<u8>,
    /// Generation counter for conn-id staleness detection. Wraps mod 2^16.
    next_id: u16,
}

impl EventLoop {
    pub(crate) fn new(
        engine: Arc<EngineCore>,
        handle: Arc<LoopHandle>,
        listeners: AHashMap<RawFd, Listener>,
    ) -> EventLoop {
        let buffer = vec![0u8; engine.opts.read_buffer_cap.max(1)];
        EventLoop {
            idx: handle.idx,
            poller: Arc::clone(&handle.poller),
            handler: Arc::clone(&engine.handler),
            engine,
            handle,
            listeners,
            connections: AHashMap::new(),
            buffer,
            next_id: 0,
        }
    }

    /// Reuseport entry point: this loop both accepts and does I/O.
    pub(crate) fn run(mut self) {
        self.pin_if_requested();
        let poller = Arc::clone(&self.poller);
        let res = poller.polling(&mut self, |el, fd, ev| el.ready_run(fd, ev));
        self.finish(res, true);
    }

    /// Sub-reactor entry point: I/O only, never accepts.
    pub(crate) fn orbit(mut self) {
        self.pin_if_requested();
        let poller = Arc::clone(&self.poller);
        let res = poller.polling(&mut self, |el, fd, ev| el.ready_orbit(fd, ev));
        self.finish(res, true);
    }

    /// Main-reactor entry point: accepts only, owns no data connections.
    pub(crate) fn rotate(mut self) {
        self.pin_if_requested();
        let poller = Arc::clone(&self.poller);
        let res = poller.polling(&mut self, |el, fd, _ev| el.accept_dispatch(fd));
        self.finish(res, false);
    }

    fn finish(&mut self, res: Result<(), Error>, close_conns: bool) {
        let err = match res {
            Ok(()) | Err(Error::EngineShutdown) => {
                tracing::debug!(idx = self.idx, "event-loop is exiting on demand");
                None
            }
            Err(e) => {
                tracing::error!(idx = self.idx, error = %e, "event-loop is exiting due to error");
                Some(e)
            }
        };
        if close_conns {
            self.close_all_conns();
        }
        self.engine.shutdown(err);
    }

    fn pin_if_requested(&self) {
        if !self.engine.opts.lock_os_thread {
            return;
        }
        let core = (self.idx.max(0) as usize) % affinity::num_cpus();
        if let Err(e) = affinity::set_cpu_affinity(core) {
            tracing::warn!(idx = self.idx, core, error = %e, "failed to pin event-loop thread");
        }
    }

    fn ready_run(&mut self, fd: RawFd, ev: &mio::event::Event) -> Result<(), Error> {
        if self.connections.contains_key(&fd) {
            return self.process_io(fd, ev);
        }
        if self.listeners.contains_key(&fd) {
            return self.accept_local(fd);
        }
        // Stale notification for an fd we no longer track.
        let _ = self.poller.delete(fd);
        Ok(())
    }

    fn ready_orbit(&mut self, fd: RawFd, ev: &mio::event::Event) -> Result<(), Error> {
        if self.connections.contains_key(&fd) {
            return self.process_io(fd, ev);
        }
        let _ = self.poller.delete(fd);
        Ok(())
    }

    /// Accept on a listener owned by this loop and register locally.
    fn accept_local(&mut self, lfd: RawFd) -> Result<(), Error> {
        let network = match self.listeners.get(&lfd) {
            Some(l) => l.network,
            None => return Ok(()),
        };
        if network == Network::Udp {
            return self.read_udp(lfd);
        }
        loop {
            let accepted = match self.listeners.get(&lfd) {
                Some(l) => l.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((socket, remote)) => {
                    self.configure_stream(&socket, network);
                    let conn = Conn::new_stream(
                        socket,
                        remote,
                        self.engine.opts.new_codec(),
                        Arc::clone(&self.poller),
                        self.idx,
                    );
                    self.register_conn(conn)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let e = Error::AcceptSocket(e);
                    tracing::error!(idx = self.idx, listener = lfd, error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    /// Main-reactor accept: pick a worker via the load balancer and enqueue
    /// the registration on its urgent trigger queue.
    fn accept_dispatch(&mut self, lfd: RawFd) -> Result<(), Error> {
        let network = match self.listeners.get(&lfd) {
            Some(l) => l.network,
            None => {
                let _ = self.poller.delete(lfd);
                return Ok(());
            }
        };
        loop {
            let accepted = match self.listeners.get(&lfd) {
                Some(l) => l.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((socket, remote)) => {
                    self.configure_stream(&socket, network);
                    let target = self.engine.lb.next(Some(&remote));
                    let conn = Conn::new_stream(
                        socket,
                        remote,
                        self.engine.opts.new_codec(),
                        Arc::clone(&target.poller),
                        target.idx,
                    );
                    let handed = target
                        .poller
                        .trigger(Priority::Urgent, Box::new(move |el| el.register_conn(conn)));
                    if let Err(e) = handed {
                        // The conn was consumed by the failed hand-off; its
                        // fd closes with it.
                        tracing::error!(worker = target.idx, error = %e, "failed to hand off accepted connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let e = Error::AcceptSocket(e);
                    tracing::error!(listener = lfd, error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn configure_stream(&self, socket: &Socket, network: Network) {
        if network != Network::Tcp {
            return;
        }
        if self.engine.opts.tcp_nodelay {
            let _ = socket.set_nodelay(true);
        }
        if let Some(period) = self.engine.opts.tcp_keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(period);
            if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
                tracing::warn!(error = %e, "failed to set TCP keep-alive");
            }
        }
    }

    /// Insert an accepted connection into this loop. Runs on the loop
    /// thread in both topologies; assigns the generation id here so it is
    /// unique per (loop, fd) slot.
    pub(crate) fn register_conn(&mut self, mut conn: Conn) -> Result<(), Error> {
        let fd = conn.fd();
        self.next_id = self.next_id.wrapping_add(1);
        conn.id = self.next_id;
        if let Err(e) = self.poller.add_read(fd) {
            tracing::error!(idx = self.idx, fd, error = %e, "failed to register accepted fd");
            return Ok(()); // conn drops here, closing the fd
        }
        self.connections.insert(fd, conn);
        self.handle.conn_count.fetch_add(1, Ordering::Relaxed);
        self.open_conn(fd)
    }

    fn open_conn(&mut self, fd: RawFd) -> Result<(), Error> {
        let handler = Arc::clone(&self.handler);
        let (action, failed) = {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            let (initial, action) = handler.on_open(c);
            c.opened = true;
            if let Some(bytes) = initial {
                c.write(&bytes);
            }
            (action, c.failed.take())
        };
        if let Some(e) = failed {
            return self.close_conn(fd, Some(e));
        }
        self.handle_action(fd, action)
    }

    fn process_io(&mut self, fd: RawFd, ev: &mio::event::Event) -> Result<(), Error> {
        if ev.is_writable() {
            self.conn_writable(fd)?;
        }
        if ev.is_readable() || ev.is_read_closed() {
            self.conn_readable(fd)?;
        }
        if ev.is_error() && self.connections.contains_key(&fd) {
            self.close_conn(fd, Some(io::Error::other("socket error")))?;
        }
        Ok(())
    }

    fn conn_readable(&mut self, fd: RawFd) -> Result<(), Error> {
        let handler = Arc::clone(&self.handler);
        loop {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            match c.read_into(&mut self.buffer) {
                Ok(0) => return self.close_conn(fd, None),
                Ok(n) => {
                    c.ingest(&self.buffer[..n]);
                    let action = handler.on_traffic(c);
                    let failed = c.failed.take();
                    if let Some(e) = failed {
                        return self.close_conn(fd, Some(e));
                    }
                    self.handle_action(fd, action)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.close_conn(fd, Some(e)),
            }
        }
    }

    fn conn_writable(&mut self, fd: RawFd) -> Result<(), Error> {
        let Some(c) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        c.flush_outbound();
        let failed = c.failed.take();
        if let Some(e) = failed {
            return self.close_conn(fd, Some(e));
        }
        Ok(())
    }

    /// Drain one UDP listener. Each datagram becomes a transient
    /// pseudo-connection that replies via `sendto`; no open/close callbacks.
    fn read_udp(&mut self, lfd: RawFd) -> Result<(), Error> {
        let handler = Arc::clone(&self.handler);
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    lfd,
                    self.buffer.as_mut_ptr() as *mut libc::c_void,
                    self.buffer.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                match e.kind() {
                    io::ErrorKind::WouldBlock => return Ok(()),
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        tracing::error!(idx = self.idx, listener = lfd, error = %e, "recvfrom failed");
                        return Ok(());
                    }
                }
            }
            let remote = unsafe { SockAddr::new(storage, addr_len) };
            let mut conn = Conn::new_datagram(
                lfd,
                remote,
                self.engine.opts.new_codec(),
                Arc::clone(&self.poller),
                self.idx,
            );
            conn.ingest(&self.buffer[..n as usize]);
            if handler.on_traffic(&mut conn) == Action::Shutdown {
                return Err(Error::EngineShutdown);
            }
        }
    }

    /// Remove, notify and release a connection. The fd closes when the
    /// connection drops.
    fn close_conn(&mut self, fd: RawFd, err: Option<io::Error>) -> Result<(), Error> {
        let Some(mut c) = self.connections.remove(&fd) else {
            return Ok(());
        };
        if c.has_pending_write() {
            c.flush_outbound();
        }
        let _ = self.poller.delete(fd);
        self.handle.conn_count.fetch_sub(1, Ordering::Relaxed);
        let action = self.handler.on_close(&mut c, err.as_ref());
        c.opened = false;
        drop(c);
        match action {
            Action::Shutdown => Err(Error::EngineShutdown),
            _ => Ok(()),
        }
    }

    fn handle_action(&mut self, fd: RawFd, action: Action) -> Result<(), Error> {
        match action {
            Action::None => Ok(()),
            Action::Close => self.close_conn(fd, None),
            Action::Shutdown => Err(Error::EngineShutdown),
        }
    }

    fn close_all_conns(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            // The engine is already stopping; a Shutdown action is moot.
            let _ = self.close_conn(fd, None);
        }
    }

    pub(crate) fn close_listeners(&mut self) {
        for (fd, _) in self.listeners.drain() {
            let _ = self.poller.delete(fd);
        }
    }

    /// Cross-thread write landing on the owning loop. Silently drops stale
    /// or not-yet-open targets.
    pub(crate) fn cross_write(&mut self, fd: RawFd, id: u16, data: Vec<u8>) -> Result<(), Error> {
        let Some(c) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        if c.id != id || !c.opened {
            return Ok(());
        }
        c.write(&data);
        let failed = c.failed.take();
        match failed {
            Some(e) => self.close_conn(fd, Some(e)),
            None => Ok(()),
        }
    }

    /// Cross-thread callback landing on the owning loop.
    pub(crate) fn cross_invoke(
        &mut self,
        fd: RawFd,
        id: u16,
        cb: Box<dyn FnOnce(&mut Conn) + Send>,
    ) -> Result<(), Error> {
        let Some(c) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        if c.id != id || !c.opened {
            return Ok(());
        }
        cb(c);
        let failed = c.failed.take();
        match failed {
            Some(e) => self.close_conn(fd, Some(e)),
            None => Ok(()),
        }
    }
}

/// Ticker driver thread. Each round trampolines `on_tick` onto the target
/// loop's thread through a high-priority trigger, then sleeps the interval
/// the callback returned. Cancellation is checked between sleep quanta.
pub(crate) fn ticker_loop(
    handler: Arc<dyn EventHandler>,
    target: Arc<LoopHandle>,
    cancel: Arc<AtomicBool>,
) {
    const QUANTUM: Duration = Duration::from_millis(25);
    let mut delay = Duration::from_secs(1);

    while !cancel.load(Ordering::Relaxed) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let h = Arc::clone(&handler);
        let triggered = target.poller.trigger(
            Priority::High,
            Box::new(move |_el| {
                let (next, action) = h.on_tick();
                let _ = tx.send(next);
                if action == Action::Shutdown {
                    return Err(Error::EngineShutdown);
                }
                Ok(())
            }),
        );
        if triggered.is_err() {
            return;
        }
        if let Ok(next) = rx.recv_timeout(Duration::from_secs(1)) {
            delay = next;
        }

        let deadline = Instant::now() + delay;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(QUANTUM.min(deadline - now));
        }
    }
}
