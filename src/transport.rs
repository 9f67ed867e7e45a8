//! Packet framing over reconnecting stream connections.
//!
//! Wire format per packet:
//!
//! ```text
//! [length:4, LE][payload:length][crc32c(payload):4, LE]
//! ```
//!
//! Length counts payload bytes only. Oversized packets are rejected with
//! `out_of_range` before any allocation, checksum mismatches decode as
//! `data_mismatch`, and an orderly close between packets is `eof`.
//!
//! [`ReconnectingConnection`] keeps at most one live transport: `connect`
//! is idempotent, and any I/O failure tears the socket down so the next
//! use dials again. [`PacketConnection`] combines both layers into the
//! send/receive surface the RPC engine uses.

use crate::error::{Error, Result};
use crate::net::addr::Endpoint;
use crate::net::channel::Channel;
use crate::net::resolve::Resolver;
use crate::select::select;
use crate::sync::flag::Flag;
use parking_lot::Mutex;
use std::net::Shutdown;
use std::sync::Arc;

/// Default cap on a single packet's payload.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A connected stream with interruptible, cancellable I/O.
///
/// Reads and writes suspend in `select` together with an internal closing
/// flag, so [`shutdown`](Self::shutdown) from any thread unblocks them.
pub struct StreamConnection {
    channel: Channel,
    closing: Flag,
}

impl StreamConnection {
    /// Wraps a connected channel, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// `io_error` if the mode switch or flag allocation fails.
    pub fn new(channel: Channel) -> Result<Self> {
        channel.set_nonblocking(true)?;
        Ok(Self {
            channel,
            closing: Flag::new()?,
        })
    }

    /// Interrupts in-flight I/O and shuts the stream down.
    ///
    /// Safe to call from any thread and idempotent. The descriptor itself
    /// closes when the last reference drops.
    pub fn shutdown(&self) {
        self.closing.set();
        let _ = self.channel.shutdown(Shutdown::Both);
    }

    /// Returns true once `shutdown` was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closing.is_set()
    }

    /// Reads until `buf` is full or the peer closes; returns the number of
    /// bytes read.
    ///
    /// # Errors
    ///
    /// `io_error` on failure or local shutdown, `cancelled` /
    /// `deadline_exceeded` from the context.
    pub fn read_full(&self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let (read, closing) = select((
                self.channel.async_read(&mut buf[total..]),
                self.closing.async_wait(),
            ))?;
            if closing.is_some() {
                return Err(Error::io("read interrupted by connection shutdown"));
            }
            if let Some(n) = read {
                if n == 0 {
                    break;
                }
                total += n;
            }
        }
        Ok(total)
    }

    /// Writes the whole buffer.
    ///
    /// # Errors
    ///
    /// `io_error` on failure or local shutdown, `cancelled` /
    /// `deadline_exceeded` from the context.
    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let (wrote, closing) = select((
                self.channel.async_write(&buf[written..]),
                self.closing.async_wait(),
            ))?;
            if closing.is_some() {
                return Err(Error::io("write interrupted by connection shutdown"));
            }
            if let Some(n) = wrote {
                written += n;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Frames and sends one packet.
///
/// # Errors
///
/// `out_of_range` for payloads over `max_size`, otherwise the transport's
/// errors.
pub fn write_packet(conn: &StreamConnection, payload: &[u8], max_size: usize) -> Result<()> {
    if payload.len() > max_size || u32::try_from(payload.len()).is_err() {
        return Err(Error::out_of_range(format!(
            "packet of {} bytes exceeds maximum {max_size}",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    conn.write_all(&frame)
}

/// Receives and verifies one packet.
///
/// # Errors
///
/// `eof` on an orderly close (between packets or mid-frame),
/// `out_of_range` for an oversized announced length, `data_mismatch` on a
/// checksum failure, otherwise the transport's errors.
pub fn read_packet(conn: &StreamConnection, max_size: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    let got = conn.read_full(&mut header)?;
    if got == 0 {
        return Err(Error::eof("connection closed"));
    }
    if got < header.len() {
        return Err(Error::eof("connection closed mid-frame"));
    }
    let length = u32::from_le_bytes(header) as usize;
    if length > max_size {
        return Err(Error::out_of_range(format!(
            "announced packet of {length} bytes exceeds maximum {max_size}"
        )));
    }

    let mut payload = vec![0u8; length];
    if conn.read_full(&mut payload)? < length {
        return Err(Error::eof("connection closed mid-frame"));
    }

    let mut trailer = [0u8; 4];
    if conn.read_full(&mut trailer)? < trailer.len() {
        return Err(Error::eof("connection closed mid-frame"));
    }
    let expected = u32::from_le_bytes(trailer);
    let actual = crc32c::crc32c(&payload);
    if expected != actual {
        return Err(Error::data_mismatch(format!(
            "packet checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
        )));
    }
    Ok(payload)
}

/// A lazily dialled stream connection that re-establishes itself on the
/// next use after a failure.
pub struct ReconnectingConnection {
    endpoint: Endpoint,
    active: Mutex<Option<Arc<StreamConnection>>>,
}

impl ReconnectingConnection {
    /// Creates a connection that will dial `endpoint` on first use.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            active: Mutex::new(None),
        }
    }

    /// Returns the live transport, dialling if necessary.
    ///
    /// Idempotent: an existing live transport is returned as-is. Otherwise
    /// the endpoint is resolved and each candidate address is tried in
    /// order until one accepts.
    ///
    /// # Errors
    ///
    /// Resolution errors, or `unavailable` when no candidate accepted.
    pub fn connect(&self) -> Result<Arc<StreamConnection>> {
        let mut active = self.active.lock();
        if let Some(conn) = active.as_ref() {
            if !conn.is_shut_down() {
                return Ok(Arc::clone(conn));
            }
            *active = None;
        }

        let addresses = Resolver::global().resolve(self.endpoint.clone())?;
        let mut last_error = None;
        for addr in &addresses {
            let attempt = (|| {
                let channel = Channel::stream_for(addr)?;
                channel.connect(addr)?;
                channel.set_no_delay(true)?;
                StreamConnection::new(channel)
            })();
            match attempt {
                Ok(conn) => {
                    tracing::debug!(endpoint = %self.endpoint, address = %addr, "connected");
                    let conn = Arc::new(conn);
                    *active = Some(Arc::clone(&conn));
                    return Ok(conn);
                }
                Err(e) if e.is_cancelled() || e.is_deadline() => return Err(e),
                Err(e) => {
                    tracing::debug!(address = %addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => Error::unavailable(format!("no address of {} accepted", self.endpoint))
                .with_source(e),
            None => Error::unavailable(format!("no candidate addresses for {}", self.endpoint)),
        })
    }

    /// Tears down the live transport, if any. Blocked I/O on it fails.
    pub fn disconnect(&self) {
        if let Some(conn) = self.active.lock().take() {
            tracing::debug!(endpoint = %self.endpoint, "disconnected");
            conn.shutdown();
        }
    }

    /// Returns true while a live transport exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|c| !c.is_shut_down())
    }
}

impl std::fmt::Debug for ReconnectingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingConnection")
            .field("endpoint", &self.endpoint.to_string())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Packet-framed I/O over a reconnecting connection.
///
/// `send` and `receive` implicitly connect first and disconnect on any
/// I/O failure before re-raising it, so there is exactly one in-flight
/// transport at a time.
pub struct PacketConnection {
    inner: ReconnectingConnection,
    max_packet_size: usize,
}

impl PacketConnection {
    /// Creates a packet connection dialling `endpoint` on first use.
    #[must_use]
    pub fn new(endpoint: Endpoint, max_packet_size: usize) -> Self {
        Self {
            inner: ReconnectingConnection::new(endpoint),
            max_packet_size,
        }
    }

    /// Ensures the transport is connected.
    ///
    /// # Errors
    ///
    /// See [`ReconnectingConnection::connect`].
    pub fn connect(&self) -> Result<()> {
        self.inner.connect().map(|_| ())
    }

    /// Tears down the transport.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Returns true while the transport is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Sends one framed packet, connecting first if necessary.
    ///
    /// # Errors
    ///
    /// Connection or framing errors; the transport is disconnected before
    /// an I/O error is re-raised.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let conn = self.inner.connect()?;
        match write_packet(&conn, payload, self.max_packet_size) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.disconnect();
                Err(e)
            }
        }
    }

    /// Receives one framed packet, connecting first if necessary.
    ///
    /// # Errors
    ///
    /// Connection or framing errors; the transport is disconnected before
    /// an I/O error is re-raised.
    pub fn receive(&self) -> Result<Vec<u8>> {
        let conn = self.inner.connect()?;
        match read_packet(&conn, self.max_packet_size) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                self.inner.disconnect();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for PacketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConnection")
            .field("connected", &self.is_connected())
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::Address;
    use crate::net::channel::DEFAULT_BACKLOG;
    use std::net::SocketAddr;

    fn connected_pair() -> (StreamConnection, StreamConnection) {
        let any: Address = "127.0.0.1:0".parse::<SocketAddr>().unwrap().into();
        let listener = Channel::stream_for(&any).unwrap();
        listener.bind(&any).unwrap();
        listener.listen(DEFAULT_BACKLOG).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Channel::stream_for(&addr).unwrap();
        client.connect(&addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (
            StreamConnection::new(client).unwrap(),
            StreamConnection::new(server).unwrap(),
        )
    }

    #[test]
    fn packet_round_trip() {
        let (client, server) = connected_pair();
        write_packet(&client, b"hello framing", DEFAULT_MAX_PACKET_SIZE).unwrap();
        let payload = read_packet(&server, DEFAULT_MAX_PACKET_SIZE).unwrap();
        assert_eq!(payload, b"hello framing");
    }

    #[test]
    fn empty_packet_round_trip() {
        let (client, server) = connected_pair();
        write_packet(&client, b"", DEFAULT_MAX_PACKET_SIZE).unwrap();
        assert!(read_packet(&server, DEFAULT_MAX_PACKET_SIZE).unwrap().is_empty());
    }

    #[test]
    fn corrupted_payload_is_a_checksum_mismatch() {
        let (client, server) = connected_pair();
        let payload = b"intact bytes";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
        frame[6] ^= 0x40;
        client.write_all(&frame).unwrap();

        let err = read_packet(&server, DEFAULT_MAX_PACKET_SIZE).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DataMismatch);
    }

    #[test]
    fn orderly_close_between_packets_is_eof() {
        let (client, server) = connected_pair();
        client.shutdown();
        let err = read_packet(&server, DEFAULT_MAX_PACKET_SIZE).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Eof);
    }

    #[test]
    fn truncated_frame_is_eof() {
        let (client, server) = connected_pair();
        let mut frame = Vec::new();
        frame.extend_from_slice(&100u32.to_le_bytes());
        frame.extend_from_slice(b"only a little");
        client.write_all(&frame).unwrap();
        client.shutdown();

        let err = read_packet(&server, DEFAULT_MAX_PACKET_SIZE).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Eof);
    }

    #[test]
    fn oversized_packets_are_rejected_both_ways() {
        let (client, server) = connected_pair();
        let err = write_packet(&client, &vec![0u8; 64], 16).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfRange);

        let mut frame = Vec::new();
        frame.extend_from_slice(&(1_000_000u32).to_le_bytes());
        client.write_all(&frame).unwrap();
        let err = read_packet(&server, 1024).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfRange);
    }

    #[test]
    fn shutdown_unblocks_a_reader() {
        let (client, server) = connected_pair();
        let server = Arc::new(server);
        let reader = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read_full(&mut buf)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        server.shutdown();
        let result = handle.join().unwrap();
        assert!(result.is_err() || result == Ok(0));
        drop(client);
    }
}
