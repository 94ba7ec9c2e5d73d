//! Per-connection state shared between the reactor, the worker serving the
//! connection and the idle sweep.
//!
//! Lifecycle: accepted, armed (registered for one readable event), disarmed
//! and dispatched to a worker, re-armed by that worker, and so on until the
//! connection is closed. Closing is terminal.

use crate::util::lock;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

/// Back-off between write attempts on a full socket buffer.
const WRITE_BACKOFF: Duration = Duration::from_millis(1);

/// Result of draining the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket drained, peer still connected.
    Drained,
    /// Peer closed its side.
    Eof,
    /// Buffer reached its limit; the socket may hold more.
    Full,
}

pub struct Connection {
    token: Token,
    stream: TcpStream,
    fd: RawFd,
    peer: SocketAddr,
    registry: Arc<Registry>,
    last_activity: AtomicU64,
    /// Set while a worker owns the connection.
    in_flight: AtomicBool,
    /// Guards registration changes against a concurrent close.
    closed: Mutex<bool>,
    /// Bytes read but not yet consumed by a complete request.
    pending: Mutex<BytesMut>,
}

impl Connection {
    pub fn new(
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        registry: Arc<Registry>,
        now: u64,
    ) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            token,
            stream,
            fd,
            peer,
            registry,
            last_activity: AtomicU64::new(now),
            in_flight: AtomicBool::new(false),
            closed: Mutex::new(false),
            pending: Mutex::new(BytesMut::new()),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn token_ref(&self) -> &Token {
        &self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Release);
    }

    pub fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity.load(Ordering::Acquire))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_flight(&self, value: bool) {
        self.in_flight.store(value, Ordering::Release);
    }

    /// Register for the next readable edge.
    pub fn arm(&self) -> io::Result<()> {
        let closed = lock(&self.closed);
        if *closed {
            return Ok(());
        }
        self.registry
            .register(&mut SourceFd(&self.fd), self.token, Interest::READABLE)
    }

    /// Stop event delivery until the next [`arm`](Self::arm).
    pub fn disarm(&self) -> io::Result<()> {
        let _closed = lock(&self.closed);
        self.registry.deregister(&mut SourceFd(&self.fd))
    }

    /// Deregister and shut the socket down. Idempotent.
    pub fn close(&self) {
        let mut closed = lock(&self.closed);
        if *closed {
            return;
        }
        *closed = true;
        // Already deregistered while dispatched.
        let _ = self.registry.deregister(&mut SourceFd(&self.fd));
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!(token = self.token.0, peer = %self.peer, "Connection closed");
    }

    /// Pending socket error, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }

    /// Buffer of unconsumed input. Only the worker serving the connection
    /// touches it.
    pub(crate) fn pending(&self) -> MutexGuard<'_, BytesMut> {
        lock(&self.pending)
    }

    /// Read what the socket has into `buf`, stopping once `buf` holds at
    /// least `limit` bytes.
    pub(crate) fn read_available(
        &self,
        buf: &mut BytesMut,
        limit: usize,
    ) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if buf.len() >= limit {
                return Ok(ReadOutcome::Full);
            }
            match (&self.stream).read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write all of `data`, retrying while the socket buffer is full until
    /// `timeout` elapses.
    pub(crate) fn write_all(&self, mut data: &[u8], timeout: Duration) -> io::Result<()> {
        let started = Instant::now();
        while !data.is_empty() {
            match (&self.stream).write(data) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                    }
                    thread::sleep(WRITE_BACKOFF);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("peer", &self.peer)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::TcpListener as StdListener;

    fn pair(poll: &Poll) -> (Connection, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let registry = Arc::new(poll.registry().try_clone().unwrap());
        let conn = Connection::new(Token(7), TcpStream::from_std(server), peer, registry, 0);
        (conn, client)
    }

    fn readable_within(poll: &mut Poll, timeout: Duration) -> bool {
        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(timeout)).unwrap();
        events.iter().any(|e| e.token() == Token(7) && e.is_readable())
    }

    #[test]
    fn test_idle_accounting() {
        let poll = Poll::new().unwrap();
        let (conn, _client) = pair(&poll);
        assert_eq!(conn.idle_for(500), 500);
        conn.touch(400);
        assert_eq!(conn.idle_for(500), 100);
        assert_eq!(conn.idle_for(300), 0);
    }

    #[test]
    fn test_arm_reports_pending_data() {
        let mut poll = Poll::new().unwrap();
        let (conn, mut client) = pair(&poll);

        // Data that arrived before the registration is still reported.
        client.write_all(b"ping").unwrap();
        thread::sleep(Duration::from_millis(20));
        conn.arm().unwrap();
        assert!(readable_within(&mut poll, Duration::from_secs(1)));

        conn.disarm().unwrap();
        client.write_all(b"more").unwrap();
        assert!(!readable_within(&mut poll, Duration::from_millis(50)));

        let mut buf = BytesMut::new();
        assert_eq!(conn.read_available(&mut buf, 1024).unwrap(), ReadOutcome::Drained);
        assert_eq!(&buf[..], b"pingmore");
    }

    #[test]
    fn test_close_is_terminal() {
        let mut poll = Poll::new().unwrap();
        let (conn, mut client) = pair(&poll);
        conn.arm().unwrap();
        conn.close();
        conn.close();
        assert!(conn.is_closed());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        // Re-arming a closed connection is a no-op, even though the socket
        // now reads as EOF.
        conn.arm().unwrap();
        assert!(!readable_within(&mut poll, Duration::from_millis(50)));
    }

    #[test]
    fn test_read_eof() {
        let poll = Poll::new().unwrap();
        let (conn, mut client) = pair(&poll);
        client.write_all(b"bye").unwrap();
        drop(client);
        thread::sleep(Duration::from_millis(20));

        let mut buf = BytesMut::new();
        assert_eq!(conn.read_available(&mut buf, 1024).unwrap(), ReadOutcome::Eof);
        assert_eq!(&buf[..], b"bye");
    }

    #[test]
    fn test_read_stops_at_limit() {
        let poll = Poll::new().unwrap();
        let (conn, mut client) = pair(&poll);
        client.write_all(&[b'x'; 64 * 1024]).unwrap();
        thread::sleep(Duration::from_millis(20));

        let mut buf = BytesMut::new();
        assert_eq!(conn.read_available(&mut buf, 1024).unwrap(), ReadOutcome::Full);
        assert!(buf.len() >= 1024);
        assert!(buf.len() <= READ_CHUNK);

        // The rest stays in the socket for the next read.
        buf.clear();
        assert_eq!(
            conn.read_available(&mut buf, 128 * 1024).unwrap(),
            ReadOutcome::Drained
        );
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_write_all() {
        let poll = Poll::new().unwrap();
        let (conn, mut client) = pair(&poll);
        conn.write_all(b"hello", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
