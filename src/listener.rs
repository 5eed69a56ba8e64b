//! Listener socket setup.
//!
//! Addresses are proto-prefixed strings: `tcp://127.0.0.1:9000`,
//! `udp://0.0.0.0:5353`, `unix:///tmp/app.sock`. A bare address defaults
//! to TCP.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::Options;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Network {
    Tcp,
    Udp,
    Unix,
}

pub(crate) struct Listener {
    socket: Socket,
    fd: RawFd,
    pub(crate) network: Network,
    /// Address string kept for per-loop rebinding in reuseport mode.
    address: String,
    local: SockAddr,
}

/// Split a proto-addr string into (network, bare address).
pub(crate) fn parse_proto_addr(addr: &str) -> Result<(Network, String), Error> {
    let (proto, rest) = match addr.split_once("://") {
        Some((p, r)) => (p, r),
        None => ("tcp", addr),
    };
    if rest.is_empty() {
        return Err(Error::InvalidAddr(addr.to_string()));
    }
    let network = match proto {
        "tcp" | "tcp4" | "tcp6" => Network::Tcp,
        "udp" | "udp4" | "udp6" => Network::Udp,
        "unix" => Network::Unix,
        other => return Err(Error::UnsupportedProtocol(other.to_string())),
    };
    Ok((network, rest.to_string()))
}

impl Listener {
    /// Bind a listening socket. `reuse_port` additionally sets SO_REUSEPORT
    /// so sibling loops can bind the same address.
    pub(crate) fn bind(
        network: Network,
        address: &str,
        opts: &Options,
        reuse_port: bool,
    ) -> Result<Listener, Error> {
        let socket = match network {
            Network::Tcp | Network::Udp => {
                let sock_addr: SocketAddr = address
                    .parse()
                    .map_err(|_| Error::InvalidAddr(address.to_string()))?;
                let domain = Domain::for_address(sock_addr);
                let (ty, proto) = match network {
                    Network::Tcp => (Type::STREAM, Protocol::TCP),
                    _ => (Type::DGRAM, Protocol::UDP),
                };
                let socket = Socket::new(domain, ty, Some(proto))?;
                socket.set_reuse_address(true)?;
                if reuse_port {
                    socket.set_reuse_port(true)?;
                }
                socket.set_nonblocking(true)?;
                socket.bind(&sock_addr.into())?;
                if network == Network::Tcp {
                    socket.listen(opts.backlog)?;
                }
                socket
            }
            Network::Unix => {
                // A leftover socket file from a previous run would fail bind.
                let _ = std::fs::remove_file(address);
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.set_nonblocking(true)?;
                socket.bind(&SockAddr::unix(address)?)?;
                socket.listen(opts.backlog)?;
                socket
            }
        };

        let local = socket.local_addr()?;
        let fd = socket.as_raw_fd();
        Ok(Listener {
            socket,
            fd,
            network,
            address: address.to_string(),
            local,
        })
    }

    /// Bind another instance of this listener on the same address.
    pub(crate) fn rebind(&self, opts: &Options) -> Result<Listener, Error> {
        // Rebinding a bound IP address requires SO_REUSEPORT on both sockets.
        let address = match (self.network, self.local.as_socket()) {
            // The configured address may have been port 0; rebind the port
            // the kernel actually assigned.
            (Network::Tcp | Network::Udp, Some(resolved)) => resolved.to_string(),
            _ => self.address.clone(),
        };
        Listener::bind(self.network, &address, opts, true)
    }

    pub(crate) fn accept(&self) -> io::Result<(Socket, SockAddr)> {
        let (socket, remote) = self.socket.accept()?;
        socket.set_nonblocking(true)?;
        Ok((socket, remote))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn local_addr(&self) -> &SockAddr {
        &self.local
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.network == Network::Unix {
            let _ = std::fs::remove_file(PathBuf::from(&self.address));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_schemes() {
        assert_eq!(
            parse_proto_addr("tcp://127.0.0.1:80").unwrap(),
            (Network::Tcp, "127.0.0.1:80".to_string())
        );
        assert_eq!(
            parse_proto_addr("udp://0.0.0.0:53").unwrap(),
            (Network::Udp, "0.0.0.0:53".to_string())
        );
        assert_eq!(
            parse_proto_addr("unix:///tmp/x.sock").unwrap(),
            (Network::Unix, "/tmp/x.sock".to_string())
        );
    }

    #[test]
    fn bare_address_defaults_to_tcp() {
        assert_eq!(
            parse_proto_addr("127.0.0.1:80").unwrap(),
            (Network::Tcp, "127.0.0.1:80".to_string())
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            parse_proto_addr("sctp://1.2.3.4:5"),
            Err(Error::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            parse_proto_addr("tcp://"),
            Err(Error::InvalidAddr(_))
        ));
    }

    #[test]
    fn bind_ephemeral_tcp() {
        let opts = Options::default();
        let ln = Listener::bind(Network::Tcp, "127.0.0.1:0", &opts, false).unwrap();
        let local = ln.local_addr().as_socket().unwrap();
        assert_ne!(local.port(), 0);
        assert!(ln.fd() >= 0);
    }

    #[test]
    fn rebind_shares_port_with_reuseport() {
        let opts = Options::default();
        let first = Listener::bind(Network::Tcp, "127.0.0.1:0", &opts, true).unwrap();
        let second = first.rebind(&opts).unwrap();
        assert_eq!(
            first.local_addr().as_socket().unwrap().port(),
            second.local_addr().as_socket().unwrap().port()
        );
    }
}
