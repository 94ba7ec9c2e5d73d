//! The readiness loop.
//!
//! A single thread owns the `Poll` and the listening socket. It accepts
//! connections, turns each readable edge into a pool task, and queues the
//! sweeps when their interval has elapsed. Connections are registered for
//! one event at a time: the reactor deregisters a socket before handing it
//! to a worker and the worker registers it again once it is done, so no two
//! workers ever serve the same connection concurrently.

use super::connection::Connection;
use super::sweep::{self, SweepClock};
use super::{serve, ServerContext, ShutdownHandle};
use crate::pool::{PoolStats, WorkerPool};
use crate::util::now_millis;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    /// Shared with connections so workers can re-arm them.
    registry: Arc<Registry>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
    /// Connection tokens are never reused.
    next_token: usize,
}

impl Reactor {
    pub fn bind(ctx: Arc<ServerContext>, pool: WorkerPool) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);

        let mut listener = TcpListener::from_std(create_listener(ctx.settings.listen)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            poll,
            listener,
            registry,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            ctx,
            pool,
            next_token: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run until a shutdown is requested or polling fails.
    pub fn run(mut self) -> io::Result<()> {
        let settings = self.ctx.settings.clone();
        let mut events = Events::with_capacity(settings.max_events);
        let mut sweeps = SweepClock::new(settings.sweep_interval_ms, now_millis());

        info!(
            addr = %self.local_addr()?,
            workers = self.pool.stats().size,
            max_connections = settings.max_connections,
            "Reactor started"
        );

        let result = loop {
            if let Err(e) = self.poll.poll(&mut events, Some(settings.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                break Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => trace!("Reactor woken"),
                    token => self.dispatch(token, event),
                }
            }

            if self.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if sweeps.due(now_millis()) {
                sweep::submit(&self.pool, &self.ctx);
            }
        };

        self.shutdown();
        result
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let conn = Arc::new(Connection::new(
            token,
            stream,
            peer,
            Arc::clone(&self.registry),
            now_millis(),
        ));
        if let Err(rejected) = self.ctx.timers.insert(Arc::clone(&conn)) {
            warn!(peer = %peer, "Connection limit reached");
            rejected.close();
            return;
        }
        if let Err(e) = conn.arm() {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            self.ctx.timers.close(token);
            return;
        }

        debug!(token = token.0, peer = %peer, "Accepted connection");
    }

    fn dispatch(&self, token: Token, event: &Event) {
        let Some(conn) = self.ctx.timers.get(token) else {
            trace!(token = token.0, "Event for closed connection");
            return;
        };

        if event.is_error() {
            match conn.take_error() {
                Ok(None) => {}
                Ok(Some(ref e)) if is_transient(e) => {
                    trace!(token = token.0, error = %e, "Transient socket error");
                    return;
                }
                Ok(Some(e)) | Err(e) => {
                    debug!(token = token.0, error = %e, "Socket error");
                    self.ctx.timers.close(token);
                    return;
                }
            }
        }
        if event.is_read_closed() && event.is_write_closed() && !event.is_readable() {
            debug!(token = token.0, "Peer hung up");
            self.ctx.timers.close(token);
            return;
        }

        if let Err(e) = conn.disarm() {
            debug!(token = token.0, error = %e, "Failed to disarm connection");
            self.ctx.timers.close(token);
            return;
        }
        conn.set_in_flight(true);

        let ctx = Arc::clone(&self.ctx);
        if !self.pool.submit("serve", move || serve::serve(&ctx, conn)) {
            warn!(token = token.0, "Dropped connection task");
            self.ctx.timers.close(token);
        }
    }

    fn shutdown(&mut self) {
        info!("Reactor stopping");
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.pool.shutdown();

        let connections = self.ctx.timers.len();
        self.ctx.timers.clear();
        let cache = self.ctx.cache.stats();
        info!(
            connections,
            cached = cache.entries,
            hits = cache.hits,
            misses = cache.misses,
            "Reactor stopped"
        );
        self.ctx.cache.dump();
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Create a non-blocking listener with the system's maximum backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}

impl ShutdownHandle {
    /// Ask the reactor to stop. The reactor closes every connection and
    /// drains the pool before `run` returns.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake reactor");
        }
    }
}
