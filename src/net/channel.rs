//! Non-blocking file-descriptor channels.
//!
//! A [`Channel`] owns exactly one socket descriptor: ownership is
//! move-only, the descriptor is closed on drop, and a closed channel
//! reports `invalid_state` from every operation. Blocking `read`/`write`
//! suspend through [`select`](crate::select::select), so they honour the
//! current context; `maybe_` variants fail with `try_again` instead of
//! blocking; `async_` variants return awaitables that perform one
//! non-blocking syscall on readiness.
//!
//! The channel never retries partial I/O: callers loop at a higher layer.
//! End-of-stream is reported as a zero-byte read, not an error.

use crate::awaitable::{Awaitable, Trigger};
use crate::error::{Error, Result};
use crate::net::addr::Address;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 10;

/// An owned, move-only socket descriptor.
#[derive(Debug)]
pub struct Channel {
    socket: Option<Socket>,
}

impl Channel {
    /// Creates a TCP stream socket suitable for connecting to `addr`.
    ///
    /// # Errors
    ///
    /// `io_error` if the socket cannot be created.
    pub fn stream_for(addr: &Address) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::from_io(e, "socket creation"))?;
        Ok(Self {
            socket: Some(socket),
        })
    }

    /// Wraps an already-open socket.
    #[must_use]
    pub fn from_socket(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    fn sock(&self) -> Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::invalid_state("channel is closed"))
    }

    /// Returns the raw descriptor.
    ///
    /// # Errors
    ///
    /// `invalid_state` on a closed channel.
    pub fn fd(&self) -> Result<RawFd> {
        Ok(self.sock()?.as_raw_fd())
    }

    /// Returns true while the descriptor is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Closes the descriptor.
    ///
    /// Closing is observable exactly once; a second close is a programmer
    /// error and panics in debug builds.
    pub fn close(&mut self) {
        debug_assert!(self.socket.is_some(), "channel closed twice");
        self.socket = None;
    }

    /// Switches the descriptor in or out of non-blocking mode.
    ///
    /// # Errors
    ///
    /// `invalid_state` on a closed channel, `io_error` on failure.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.sock()?
            .set_nonblocking(nonblocking)
            .map_err(|e| Error::from_io(e, "non-blocking mode"))
    }

    /// Reads once, failing with `try_again` when the kernel would block.
    ///
    /// # Errors
    ///
    /// `try_again`, `invalid_state`, or `io_error`. End-of-stream is
    /// `Ok(0)`.
    pub fn maybe_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut sock = self.sock()?;
        sock.read(buf).map_err(|e| Error::from_io(e, "read"))
    }

    /// Writes once, failing with `try_again` when the kernel would block.
    ///
    /// # Errors
    ///
    /// `try_again`, `invalid_state`, or `io_error`.
    pub fn maybe_write(&self, buf: &[u8]) -> Result<usize> {
        let mut sock = self.sock()?;
        sock.write(buf).map_err(|e| Error::from_io(e, "write"))
    }

    /// Blocks until at least one byte was read (or end-of-stream).
    ///
    /// Performs a single syscall per readiness wake; a partial read
    /// returns immediately.
    ///
    /// # Errors
    ///
    /// `io_error`, or `cancelled` / `deadline_exceeded` from the context.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.maybe_read(buf) {
                Err(e) if e.is_try_again() => {
                    let _ = crate::select::select((self.can_read(),))?;
                }
                other => return other,
            }
        }
    }

    /// Blocks until at least one byte was written.
    ///
    /// # Errors
    ///
    /// `io_error`, or `cancelled` / `deadline_exceeded` from the context.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            match self.maybe_write(buf) {
                Err(e) if e.is_try_again() => {
                    let _ = crate::select::select((self.can_write(),))?;
                }
                other => return other,
            }
        }
    }

    fn readiness(&self, write: bool) -> Awaitable<'static, ()> {
        match self.fd() {
            Ok(fd) => {
                let trigger = if write {
                    Trigger::Writable(fd)
                } else {
                    Trigger::Readable(fd)
                };
                Awaitable::new(trigger, || Ok(()))
            }
            Err(e) => {
                let mut err = Some(e);
                Awaitable::new(Trigger::Always, move || {
                    Err(err
                        .take()
                        .unwrap_or_else(|| Error::invalid_state("channel is closed")))
                })
            }
        }
    }

    /// An awaitable that fires when the channel is readable.
    #[must_use]
    pub fn can_read(&self) -> Awaitable<'static, ()> {
        self.readiness(false)
    }

    /// An awaitable that fires when the channel is writable.
    #[must_use]
    pub fn can_write(&self) -> Awaitable<'static, ()> {
        self.readiness(true)
    }

    /// An awaitable that, on readability, performs one non-blocking read
    /// and yields the byte count (zero at end-of-stream).
    #[must_use]
    pub fn async_read<'a>(&'a self, buf: &'a mut [u8]) -> Awaitable<'a, usize> {
        match self.fd() {
            Ok(fd) => Awaitable::new(Trigger::Readable(fd), move || self.maybe_read(buf)),
            Err(e) => {
                let mut err = Some(e);
                Awaitable::new(Trigger::Always, move || {
                    Err(err
                        .take()
                        .unwrap_or_else(|| Error::invalid_state("channel is closed")))
                })
            }
        }
    }

    /// An awaitable that, on writability, performs one non-blocking write
    /// and yields the byte count.
    #[must_use]
    pub fn async_write<'a>(&'a self, buf: &'a [u8]) -> Awaitable<'a, usize> {
        match self.fd() {
            Ok(fd) => Awaitable::new(Trigger::Writable(fd), move || self.maybe_write(buf)),
            Err(e) => {
                let mut err = Some(e);
                Awaitable::new(Trigger::Always, move || {
                    Err(err
                        .take()
                        .unwrap_or_else(|| Error::invalid_state("channel is closed")))
                })
            }
        }
    }

    /// Connects to `addr`, blocking until established.
    ///
    /// # Errors
    ///
    /// `io_error` on failure, or `cancelled` / `deadline_exceeded` from
    /// the context.
    pub fn connect(&self, addr: &Address) -> Result<()> {
        let _ = crate::select::select((self.async_connect(addr),))?;
        Ok(())
    }

    /// Starts a non-blocking connect to `addr`; the returned awaitable
    /// fires once the attempt concludes and yields its outcome.
    #[must_use]
    pub fn async_connect(&self, addr: &Address) -> Awaitable<'_, ()> {
        let started: Result<bool> = (|| {
            let sock = self.sock()?;
            sock.set_nonblocking(true)
                .map_err(|e| Error::from_io(e, "non-blocking mode"))?;
            match sock.connect(&SockAddr::from(addr.socket_addr())) {
                Ok(()) => Ok(true),
                Err(e) if connect_in_progress(&e) => Ok(false),
                Err(e) => Err(Error::from_io(e, format!("connecting to {addr}"))),
            }
        })();

        match started {
            Ok(true) => Awaitable::new(Trigger::Always, || Ok(())),
            Ok(false) => {
                let fd = self.fd().unwrap_or(-1);
                Awaitable::new(Trigger::Writable(fd), move || self.connect_outcome())
            }
            Err(e) => {
                let mut err = Some(e);
                Awaitable::new(Trigger::Always, move || {
                    Err(err
                        .take()
                        .unwrap_or_else(|| Error::invalid_state("connect already failed")))
                })
            }
        }
    }

    /// Resolves the outcome of an in-progress connect after the socket
    /// became writable.
    fn connect_outcome(&self) -> Result<()> {
        let sock = self.sock()?;
        if let Some(err) = sock
            .take_error()
            .map_err(|e| Error::from_io(e, "SO_ERROR"))?
        {
            return Err(Error::from_io(err, "connect"));
        }
        sock.peer_addr()
            .map(|_| ())
            .map_err(|e| Error::from_io(e, "connect"))
    }

    /// Binds the socket to `addr`.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn bind(&self, addr: &Address) -> Result<()> {
        self.sock()?
            .bind(&SockAddr::from(addr.socket_addr()))
            .map_err(|e| Error::from_io(e, format!("binding {addr}")))
    }

    /// Starts listening with the given backlog.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.sock()?
            .listen(backlog)
            .map_err(|e| Error::from_io(e, "listen"))
    }

    /// Returns the locally bound address.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn local_addr(&self) -> Result<Address> {
        let addr = self
            .sock()?
            .local_addr()
            .map_err(|e| Error::from_io(e, "local address"))?;
        addr.as_socket()
            .map(Address::from)
            .ok_or_else(|| Error::internal("local address is not an inet address"))
    }

    /// Accepts one connection, failing with `try_again` when none is
    /// pending.
    ///
    /// # Errors
    ///
    /// `try_again`, `invalid_state`, or `io_error`.
    pub fn maybe_accept(&self) -> Result<(Channel, Address)> {
        let (socket, addr) = self
            .sock()?
            .accept()
            .map_err(|e| Error::from_io(e, "accept"))?;
        let addr = addr
            .as_socket()
            .map(Address::from)
            .ok_or_else(|| Error::internal("peer address is not an inet address"))?;
        Ok((Channel::from_socket(socket), addr))
    }

    /// Blocks until a connection arrives and accepts it.
    ///
    /// # Errors
    ///
    /// `io_error`, or `cancelled` / `deadline_exceeded` from the context.
    pub fn accept(&self) -> Result<(Channel, Address)> {
        loop {
            match self.maybe_accept() {
                Err(e) if e.is_try_again() => {
                    let _ = crate::select::select((self.can_read(),))?;
                }
                other => return other,
            }
        }
    }

    /// An awaitable that accepts one connection on readability.
    #[must_use]
    pub fn async_accept(&self) -> Awaitable<'_, (Channel, Address)> {
        match self.fd() {
            Ok(fd) => Awaitable::new(Trigger::Readable(fd), move || self.maybe_accept()),
            Err(e) => {
                let mut err = Some(e);
                Awaitable::new(Trigger::Always, move || {
                    Err(err
                        .take()
                        .unwrap_or_else(|| Error::invalid_state("channel is closed")))
                })
            }
        }
    }

    /// Shuts down one or both directions of the stream.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.sock()?
            .shutdown(how)
            .map_err(|e| Error::from_io(e, "shutdown"))
    }

    /// Enables or disables TCP keepalive probes.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn set_keep_alive(&self, keep_alive: bool) -> Result<()> {
        self.sock()?
            .set_keepalive(keep_alive)
            .map_err(|e| Error::from_io(e, "SO_KEEPALIVE"))
    }

    /// Enables or disables Nagle's algorithm.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn set_no_delay(&self, no_delay: bool) -> Result<()> {
        self.sock()?
            .set_nodelay(no_delay)
            .map_err(|e| Error::from_io(e, "TCP_NODELAY"))
    }

    /// Allows rebinding a recently used local address.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn set_reuse_addr(&self, reuse: bool) -> Result<()> {
        self.sock()?
            .set_reuse_address(reuse)
            .map_err(|e| Error::from_io(e, "SO_REUSEADDR"))
    }

    /// Configures close-time lingering.
    ///
    /// # Errors
    ///
    /// `invalid_state` or `io_error`.
    pub fn set_linger(&self, linger: Option<Duration>) -> Result<()> {
        self.sock()?
            .set_linger(linger)
            .map_err(|e| Error::from_io(e, "SO_LINGER"))
    }
}

fn connect_in_progress(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::select;
    use std::net::SocketAddr;

    fn loopback_listener() -> (Channel, Address) {
        let any: Address = "127.0.0.1:0".parse::<SocketAddr>().unwrap().into();
        let listener = Channel::stream_for(&any).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&any).unwrap();
        listener.listen(DEFAULT_BACKLOG).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn close_is_observable_once() {
        let addr: Address = "127.0.0.1:0".parse::<SocketAddr>().unwrap().into();
        let mut ch = Channel::stream_for(&addr).unwrap();
        assert!(ch.is_open());
        ch.close();
        assert!(!ch.is_open());
        assert_eq!(
            ch.fd().unwrap_err().kind(),
            crate::error::ErrorKind::InvalidState
        );
    }

    #[test]
    #[should_panic(expected = "channel closed twice")]
    #[cfg(debug_assertions)]
    fn double_close_panics_in_debug() {
        let addr: Address = "127.0.0.1:0".parse::<SocketAddr>().unwrap().into();
        let mut ch = Channel::stream_for(&addr).unwrap();
        ch.close();
        ch.close();
    }

    #[test]
    fn connect_accept_and_exchange() {
        let (listener, addr) = loopback_listener();

        let client = Channel::stream_for(&addr).unwrap();
        client.connect(&addr).unwrap();

        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        assert_eq!(peer.ip(), addr.ip());

        let written = client.write(b"ping").unwrap();
        assert_eq!(written, 4);

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn eof_reads_as_zero_bytes() {
        let (listener, addr) = loopback_listener();
        let mut client = Channel::stream_for(&addr).unwrap();
        client.connect(&addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        client.close();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn maybe_read_on_idle_stream_is_try_again() {
        let (listener, addr) = loopback_listener();
        let client = Channel::stream_for(&addr).unwrap();
        client.connect(&addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 8];
        assert!(server.maybe_read(&mut buf).unwrap_err().is_try_again());
    }

    #[test]
    fn async_read_yields_count_in_select() {
        let (listener, addr) = loopback_listener();
        let client = Channel::stream_for(&addr).unwrap();
        client.connect(&addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        client.write(b"abc").unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = select((
            server.async_read(&mut buf),
            crate::awaitable::timeout(Duration::from_secs(5)),
        ))
        .unwrap();
        assert_eq!(n, Some(3));
    }

    #[test]
    fn connect_to_dead_port_fails() {
        // Bind then drop a listener so the port is very likely closed.
        let addr = {
            let (listener, addr) = loopback_listener();
            drop(listener);
            addr
        };
        let client = Channel::stream_for(&addr).unwrap();
        let err = client.connect(&addr).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
