//! Readiness poller: a mio `Poll` plus a cross-thread trigger channel.
//!
//! The poller is shared behind an `Arc`; only the owning loop's thread ever
//! runs [`Poller::polling`], while any thread may register interest or
//! enqueue trigger closures. Trigger closures run on the loop thread with
//! exclusive access to the loop state, which is what makes cross-thread
//! connection writes safe without locks on the connection itself.

use std::io;
use std::os::fd::RawFd;

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Reserved token for the wake mechanism; never collides with an fd token.
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Closure executed on the owning loop's thread.
pub(crate) type Task = Box<dyn FnOnce(&mut EventLoop) -> Result<(), Error> + Send>;

/// Trigger priority classes. Urgent drains before high; each class is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Priority {
    /// Shutdown and connection registration.
    Urgent,
    /// Everything else, including cross-thread writes.
    High,
}

pub(crate) struct Poller {
    /// Owned by the polling thread for the lifetime of the loop; taken by
    /// `close()` after the thread has joined.
    poll: Mutex<Option<Poll>>,
    registry: Registry,
    waker: Waker,
    urgent_tx: Sender<Task>,
    urgent_rx: Receiver<Task>,
    high_tx: Sender<Task>,
    high_rx: Receiver<Task>,
}

impl Poller {
    pub(crate) fn open() -> Result<Poller, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKE_TOKEN)?;
        let (urgent_tx, urgent_rx) = crossbeam_channel::unbounded();
        let (high_tx, high_rx) = crossbeam_channel::unbounded();
        Ok(Poller {
            poll: Mutex::new(Some(poll)),
            registry,
            waker,
            urgent_tx,
            urgent_rx,
            high_tx,
            high_rx,
        })
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> Result<(), Error> {
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
        Ok(())
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> Result<(), Error> {
        self.registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
        Ok(())
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> Result<(), Error> {
        self.registry.reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    pub(crate) fn delete(&self, fd: RawFd) -> Result<(), Error> {
        self.registry.deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    /// Enqueue a closure to run inside the owning loop's next polling
    /// iteration. Thread-safe; wakes the poller.
    pub(crate) fn trigger(&self, priority: Priority, task: Task) -> Result<(), Error> {
        let sent = match priority {
            Priority::Urgent => self.urgent_tx.send(task),
            Priority::High => self.high_tx.send(task),
        };
        if sent.is_err() {
            return Err(Error::EngineShutdown);
        }
        self.waker.wake()?;
        Ok(())
    }

    /// Block dispatching readiness and trigger closures until a closure
    /// returns [`Error::EngineShutdown`] or the kernel reports an
    /// unrecoverable error.
    pub(crate) fn polling<F>(&self, el: &mut EventLoop, mut ready: F) -> Result<(), Error>
    where
        F: FnMut(&mut EventLoop, RawFd, &mio::event::Event) -> Result<(), Error>,
    {
        let mut guard = self.poll.lock();
        let poll = match guard.as_mut() {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut events = Events::with_capacity(1024);

        loop {
            match poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }

            self.run_pending(el)?;

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                ready(el, event.token().0 as RawFd, event)?;
            }
        }
    }

    /// Drain the trigger queues, urgent first. Only tasks already queued at
    /// entry run now; tasks enqueued by a running task wait for the next
    /// iteration, so triggers never execute re-entrantly.
    fn run_pending(&self, el: &mut EventLoop) -> Result<(), Error> {
        for _ in 0..self.urgent_rx.len() {
            match self.urgent_rx.try_recv() {
                Ok(task) => task(el)?,
                Err(_) => break,
            }
        }
        for _ in 0..self.high_rx.len() {
            match self.high_rx.try_recv() {
                Ok(task) => task(el)?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Release kernel resources. Idempotent; called after the polling thread
    /// has joined.
    pub(crate) fn close(&self) {
        *self.poll.lock() = None;
    }
}
