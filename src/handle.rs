//! The user-facing engine handle.
//!
//! `Engine` is a small cloneable value safe to use from any thread. A
//! default-constructed handle is "empty": `async_write` reports
//! [`Error::EmptyEngine`] and everything else is a no-op.

use std::sync::Arc;

use socket2::SockAddr;

use crate::conn::Conn;
use crate::connid;
use crate::engine::EngineCore;
use crate::error::Error;
use crate::poller::Priority;

#[derive(Clone, Default)]
pub struct Engine {
    pub(crate) eng: Option<Arc<EngineCore>>,
}

impl Engine {
    /// Asynchronously write `data` to the connection identified by
    /// `conn_id`, from any thread.
    ///
    /// The write is enqueued onto the owning loop and executed there, so no
    /// locking of connection state is involved. A stale or malformed id is
    /// silently dropped: the connection may have closed and its fd been
    /// reused, which the generation check detects on the owning loop.
    /// Writes submitted from one thread to one connection keep their order.
    pub fn async_write(&self, conn_id: i64, data: &[u8]) -> Result<(), Error> {
        let Some(eng) = &self.eng else {
            return Err(Error::EmptyEngine);
        };
        let (loop_idx, id, fd) = connid::unpack(conn_id);

        let mut dispatched = false;
        let mut payload = Some(data.to_vec());
        eng.lb.iterate(&mut |i, h| {
            if i != loop_idx {
                return true;
            }
            dispatched = true;
            let data = payload.take().unwrap_or_default();
            let triggered = h
                .poller
                .trigger(Priority::High, Box::new(move |el| el.cross_write(fd, id, data)));
            if let Err(e) = triggered {
                tracing::debug!(conn_id, error = %e, "async write dropped");
            }
            false
        });
        if !dispatched {
            tracing::debug!(conn_id, loop_idx, "async write targets unknown event-loop");
        }
        Ok(())
    }

    /// Run `cb` on the owning loop's thread with exclusive access to the
    /// connection. No-op on an empty handle or a stale id.
    pub fn trigger<F>(&self, conn_id: i64, cb: F)
    where
        F: FnOnce(&mut Conn) + Send + 'static,
    {
        let Some(eng) = &self.eng else {
            return;
        };
        let (loop_idx, id, fd) = connid::unpack(conn_id);

        let mut dispatched = false;
        let mut cb = Some(Box::new(cb) as Box<dyn FnOnce(&mut Conn) + Send>);
        eng.lb.iterate(&mut |i, h| {
            if i != loop_idx {
                return true;
            }
            dispatched = true;
            if let Some(cb) = cb.take() {
                let triggered = h
                    .poller
                    .trigger(Priority::High, Box::new(move |el| el.cross_invoke(fd, id, cb)));
                if let Err(e) = triggered {
                    tracing::debug!(conn_id, error = %e, "trigger dropped");
                }
            }
            false
        });
        if !dispatched {
            tracing::debug!(conn_id, loop_idx, "trigger targets unknown event-loop");
        }
    }

    /// Request engine shutdown. Idempotent; no-op on an empty handle.
    pub fn stop(&self) {
        if let Some(eng) = &self.eng {
            eng.signal_shutdown();
        }
    }

    /// True once `serve` has fully stopped: all loops joined, pollers
    /// closed. An empty handle reports true.
    pub fn is_shutdown(&self) -> bool {
        match &self.eng {
            Some(eng) => eng.is_in_shutdown(),
            None => true,
        }
    }

    /// Addresses the engine's listeners are bound to, in the order the
    /// addresses were passed to `serve`.
    pub fn local_addrs(&self) -> Vec<SockAddr> {
        match &self.eng {
            Some(eng) => eng.local_addrs.clone(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_async_write_errors() {
        let eng = Engine::default();
        assert!(matches!(eng.async_write(0, b""), Err(Error::EmptyEngine)));
    }

    #[test]
    fn empty_handle_trigger_and_stop_are_noops() {
        let eng = Engine::default();
        eng.trigger(0, |_c| {});
        eng.stop();
        assert!(eng.is_shutdown());
        assert!(eng.local_addrs().is_empty());
    }
}
