//! gyre: a multi-reactor event-driven network engine.
//!
//! A small pool of polling threads multiplexes many TCP/UDP/Unix-socket
//! connections. Inbound connections are accepted either by a dedicated main
//! reactor that hands fds to worker loops, or (in reuseport mode) by every
//! loop on its own SO_REUSEPORT listener. Lifecycle events are delivered to
//! a user [`EventHandler`]; any thread holding a connection's 64-bit id can
//! reach it through [`Engine::async_write`] / [`Engine::trigger`], which
//! funnel work onto the owning loop instead of locking connection state.

pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod handle;
pub mod handler;

mod affinity;
mod balancer;
mod connid;
mod engine;
mod event_loop;
mod listener;
mod poller;

pub use codec::{Codec, RawCodec};
pub use config::{LbPolicy, Options};
pub use conn::Conn;
pub use engine::serve;
pub use error::Error;
pub use handle::Engine;
pub use handler::{Action, EventHandler};
