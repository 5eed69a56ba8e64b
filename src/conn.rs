//! Connection state.
//!
//! A `Conn` is owned by exactly one event loop after registration and is
//! only ever touched from that loop's polling thread. External writers go
//! through the owning poller's trigger queue (see [`Engine`](crate::Engine)).

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{SockAddr, Socket};

use crate::codec::Codec;
use crate::connid;
use crate::poller::Poller;

enum Transport {
    /// Owned stream socket; the fd closes when the connection is released.
    Stream(Socket),
    /// Transient datagram pseudo-connection borrowing the listener's fd.
    Datagram,
}

pub struct Conn {
    fd: RawFd,
    /// Generation id distinguishing this connection from a prior occupant
    /// of the same fd slot. Assigned by the owning loop at registration.
    pub(crate) id: u16,
    pub(crate) loop_idx: i32,
    /// True between the open callback and the close callback.
    pub(crate) opened: bool,
    transport: Transport,
    inbound: BytesMut,
    outbound: BytesMut,
    codec: Box<dyn Codec>,
    remote: SockAddr,
    local: Option<SockAddr>,
    poller: Arc<Poller>,
    write_interest: bool,
    /// Sticky I/O failure; the owning loop closes the connection when set.
    pub(crate) failed: Option<io::Error>,
}

impl Conn {
    pub(crate) fn new_stream(
        socket: Socket,
        remote: SockAddr,
        codec: Box<dyn Codec>,
        poller: Arc<Poller>,
        loop_idx: i32,
    ) -> Conn {
        let fd = socket.as_raw_fd();
        let local = socket.local_addr().ok();
        Conn {
            fd,
            id: 0,
            loop_idx,
            opened: false,
            transport: Transport::Stream(socket),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            codec,
            remote,
            local,
            poller,
            write_interest: false,
            failed: None,
        }
    }

    pub(crate) fn new_datagram(
        listener_fd: RawFd,
        remote: SockAddr,
        codec: Box<dyn Codec>,
        poller: Arc<Poller>,
        loop_idx: i32,
    ) -> Conn {
        Conn {
            fd: listener_fd,
            id: 0,
            loop_idx,
            opened: true,
            transport: Transport::Datagram,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            codec,
            remote,
            local: None,
            poller,
            write_interest: false,
            failed: None,
        }
    }

    /// The 64-bit identifier usable with [`Engine::async_write`] and
    /// [`Engine::trigger`] from any thread.
    ///
    /// [`Engine::async_write`]: crate::Engine::async_write
    /// [`Engine::trigger`]: crate::Engine::trigger
    pub fn conn_id(&self) -> i64 {
        connid::pack(self.loop_idx, self.id, self.fd)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn remote_addr(&self) -> &SockAddr {
        &self.remote
    }

    pub fn local_addr(&self) -> Option<&SockAddr> {
        self.local.as_ref()
    }

    /// Bytes buffered inbound that the codec has not yet consumed.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Borrow up to `n` buffered inbound bytes without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.inbound[..n.min(self.inbound.len())]
    }

    /// Drop `n` buffered inbound bytes.
    pub fn discard(&mut self, n: usize) {
        self.inbound.advance(n.min(self.inbound.len()));
    }

    /// Decode the next frame from the inbound buffer.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        self.codec.decode(&mut self.inbound)
    }

    /// Queue bytes for delivery to the peer.
    ///
    /// On a stream connection the syscall is attempted immediately when no
    /// earlier bytes are pending; any remainder is buffered and the fd is
    /// promoted to write interest until drained. Datagram replies go out
    /// right away via `sendto`.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.failed.is_some() {
            return;
        }
        match self.transport {
            Transport::Datagram => self.send_datagram(data),
            Transport::Stream(_) => {
                let had_pending = !self.outbound.is_empty();
                self.codec.encode(data, &mut self.outbound);
                if !had_pending {
                    self.flush_outbound();
                }
            }
        }
    }

    /// Push raw inbound bytes into the buffer (loop-thread read path).
    pub(crate) fn ingest(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Read once from the socket into the loop's scratch buffer.
    pub(crate) fn read_into(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        match &self.transport {
            Transport::Stream(socket) => (&*socket).read(scratch),
            Transport::Datagram => Ok(0),
        }
    }

    /// Write buffered outbound bytes until drained or the socket blocks.
    /// Manages write-interest promotion/demotion on the owning poller.
    pub(crate) fn flush_outbound(&mut self) {
        let Transport::Stream(ref socket) = self.transport else {
            return;
        };
        while !self.outbound.is_empty() {
            match (&*socket).write(&self.outbound) {
                Ok(0) => {
                    self.failed = Some(io::Error::from(io::ErrorKind::WriteZero));
                    return;
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.failed = Some(e);
                    return;
                }
            }
        }

        if self.outbound.is_empty() {
            if self.write_interest {
                if let Err(e) = self.poller.mod_read(self.fd) {
                    tracing::warn!(fd = self.fd, error = %e, "failed to demote write interest");
                }
                self.write_interest = false;
            }
        } else if !self.write_interest {
            match self.poller.mod_read_write(self.fd) {
                Ok(()) => self.write_interest = true,
                Err(e) => {
                    tracing::warn!(fd = self.fd, error = %e, "failed to promote write interest");
                }
            }
        }
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn send_datagram(&mut self, data: &[u8]) {
        let ret = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                self.remote.as_ptr(),
                self.remote.len(),
            )
        };
        if ret < 0 {
            let e = io::Error::last_os_error();
            tracing::debug!(fd = self.fd, error = %e, "sendto failed");
        }
    }
}
