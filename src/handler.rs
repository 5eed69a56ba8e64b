use std::io;
use std::time::Duration;

use crate::conn::Conn;
use crate::handle::Engine;

/// What the engine should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close the connection the callback ran for.
    Close,
    /// Stop the whole engine.
    Shutdown,
}

/// User event handler. One instance is shared by every event loop; each
/// callback runs on the thread of the loop that owns the connection, so
/// per-connection event order is total. Callbacks must not block.
pub trait EventHandler: Send + Sync {
    /// Called once before any event loop starts. Returning
    /// [`Action::Shutdown`] aborts startup.
    fn on_boot(&self, _eng: Engine) -> Action {
        Action::None
    }

    /// Called after a connection is accepted and registered with its owning
    /// loop. The returned bytes, if any, are written once the connection is
    /// marked open.
    fn on_open(&self, _c: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Called for each batch of inbound data.
    fn on_traffic(&self, _c: &mut Conn) -> Action {
        Action::None
    }

    /// Called before the fd is closed and the connection released. `err` is
    /// the I/O error that caused the close, when there was one.
    fn on_close(&self, _c: &mut Conn, _err: Option<&io::Error>) -> Action {
        Action::None
    }

    /// Called exactly once while the engine stops.
    fn on_shutdown(&self, _eng: Engine) {}

    /// Periodic callback when the ticker is enabled. Returns the delay
    /// before the next tick.
    fn on_tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
