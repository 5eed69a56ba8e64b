use std::fmt;
use std::io;

/// Errors returned by the gyre engine.
#[derive(Debug)]
pub enum Error {
    /// Sentinel returned from a trigger closure to unwind the polling loop.
    /// Never surfaced to user callbacks.
    EngineShutdown,
    /// The handle was never bound to a running engine.
    EmptyEngine,
    /// Accept failed non-transiently on a listener socket.
    AcceptSocket(io::Error),
    /// A proto-address string could not be parsed.
    InvalidAddr(String),
    /// The proto-address scheme is not one of tcp/udp/unix.
    UnsupportedProtocol(String),
    /// Underlying I/O failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EngineShutdown => write!(f, "engine is shutting down"),
            Error::EmptyEngine => write!(f, "engine handle is empty"),
            Error::AcceptSocket(e) => write!(f, "accept failed: {e}"),
            Error::InvalidAddr(addr) => write!(f, "invalid address: {addr}"),
            Error::UnsupportedProtocol(proto) => write!(f, "unsupported protocol: {proto}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::AcceptSocket(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
