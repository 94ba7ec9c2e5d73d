//! Readiness-driven server runtime.
//!
//! - `reactor`: the mio loop that accepts connections and dispatches events
//! - `connection`: per-connection state and one-shot (re)registration
//! - `serve`: the worker side of an event
//! - `timers`: live connections, ordered by token, swept when idle
//! - `sweep`: periodic eviction of idle connections and stale cache entries

mod connection;
mod reactor;
mod serve;
mod sweep;
mod timers;

pub use connection::Connection;
pub use reactor::Reactor;
pub use timers::Timers;

use crate::cache::Cache;
use crate::http::Service;
use mio::Waker;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_EVENTS: usize = 2048;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_MS: u64 = 60_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub listen: SocketAddr,
    /// Events collected per poll.
    pub max_events: usize,
    pub poll_timeout: Duration,
    pub write_timeout: Duration,
    /// Idle time after which the sweep closes a connection.
    pub keepalive_ms: u64,
    pub max_connections: usize,
    pub sweep_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9000)),
            max_events: DEFAULT_MAX_EVENTS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

/// State shared by the reactor and every pool task.
pub struct ServerContext {
    pub settings: RuntimeSettings,
    pub cache: Arc<Cache>,
    pub timers: Timers,
    pub service: Arc<dyn Service>,
}

impl ServerContext {
    pub fn new(settings: RuntimeSettings, cache: Arc<Cache>, service: Arc<dyn Service>) -> Self {
        let timers = Timers::new(settings.max_connections, settings.keepalive_ms);
        Self {
            settings,
            cache,
            timers,
            service,
        }
    }
}

/// Stops a running [`Reactor`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, FsBacking};
    use crate::http::{HttpService, Request, Response};
    use crate::pool::{PoolSettings, WorkerPool};
    use std::io::{self, Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, JoinHandle};
    use std::time::Instant;
    use tempfile::TempDir;

    struct Running {
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
        handle: ShutdownHandle,
        thread: Option<JoinHandle<io::Result<()>>>,
    }

    impl Running {
        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(&mut self) -> io::Result<()> {
            self.handle.shutdown();
            self.thread.take().unwrap().join().unwrap()
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            if let Some(thread) = self.thread.take() {
                self.handle.shutdown();
                let _ = thread.join();
            }
        }
    }

    fn test_settings() -> RuntimeSettings {
        RuntimeSettings {
            listen: "127.0.0.1:0".parse().unwrap(),
            max_events: 64,
            poll_timeout: Duration::from_millis(10),
            write_timeout: Duration::from_secs(1),
            keepalive_ms: 60_000,
            max_connections: 64,
            sweep_interval_ms: 20,
        }
    }

    fn start(settings: RuntimeSettings, cache: Arc<Cache>, service: Arc<dyn Service>) -> Running {
        let ctx = Arc::new(ServerContext::new(settings, cache, service));
        let pool = WorkerPool::new(PoolSettings {
            initial: 4,
            min: 4,
            max: 8,
            rebalance_interval: Duration::from_secs(3600),
            ..PoolSettings::default()
        })
        .unwrap();
        let reactor = Reactor::bind(Arc::clone(&ctx), pool).unwrap();
        assert_eq!(reactor.pool_stats().size, 4);
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.shutdown_handle();
        let thread = thread::spawn(move || reactor.run());
        Running {
            addr,
            ctx,
            handle,
            thread: Some(thread),
        }
    }

    fn empty_cache() -> Arc<Cache> {
        let dir = std::env::temp_dir();
        Arc::new(Cache::new(
            Arc::new(FsBacking::new(dir)),
            CacheSettings::default(),
        ))
    }

    fn read_response(stream: &mut TcpStream) -> (u16, String, Vec<u8>) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).unwrap();
            assert_eq!(n, 1, "connection closed mid-response");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        let status = head[9..12].parse().unwrap();
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).unwrap();
        (status, head, body)
    }

    fn get(stream: &mut TcpStream, path: &str) -> (u16, String, Vec<u8>) {
        write!(stream, "GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
        read_response(stream)
    }

    fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {n} bytes"),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Answers every request after a short delay while counting how many
    /// requests it serves at the same time.
    #[derive(Default)]
    struct Counting {
        active: AtomicUsize,
        peak: AtomicUsize,
        served: AtomicUsize,
    }

    impl Service for Counting {
        fn respond(&self, _req: &Request) -> Response {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.served.fetch_add(1, Ordering::SeqCst);
            Response::page(200, "ok")
        }
    }

    #[test]
    fn test_static_file_cached_then_refetched() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"first").unwrap();
        let cache = Arc::new(Cache::new(
            Arc::new(FsBacking::new(dir.path())),
            CacheSettings {
                freshness_ms: 300,
                ..CacheSettings::default()
            },
        ));
        let service = Arc::new(HttpService::new(Arc::clone(&cache)));
        let server = start(test_settings(), Arc::clone(&cache), service);
        let mut client = server.connect();

        let (status, _, body) = get(&mut client, "/a");
        assert_eq!(status, 200);
        assert_eq!(body, b"first");
        assert_eq!(cache.stats().misses, 1);
        let first = cache.lookup_or_populate("/a", u64::MAX).unwrap();

        let (status, _, body) = get(&mut client, "/a");
        assert_eq!(status, 200);
        assert_eq!(body, b"first");
        assert_eq!(cache.stats().misses, 1);
        let again = cache.lookup_or_populate("/a", u64::MAX).unwrap();
        assert!(Arc::ptr_eq(&first.content(), &again.content()));

        std::fs::write(dir.path().join("a"), b"second version").unwrap();
        thread::sleep(Duration::from_millis(400));

        let (status, _, body) = get(&mut client, "/a");
        assert_eq!(status, 200);
        assert_eq!(body, b"second version");
        assert_eq!(cache.stats().reloads, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_connection_served_by_one_worker_at_a_time() {
        let service = Arc::new(Counting::default());
        let server = start(test_settings(), empty_cache(), service.clone());
        let mut client = server.connect();
        let mut reader = client.try_clone().unwrap();

        // Dribble pipelined requests so that several readiness edges fire
        // while earlier ones are still being served.
        let writer = thread::spawn(move || {
            for _ in 0..50 {
                client
                    .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
                    .unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            client
        });
        for _ in 0..50 {
            let (status, _, _) = read_response(&mut reader);
            assert_eq!(status, 200);
        }
        let _client = writer.join().unwrap();

        assert_eq!(service.served.load(Ordering::SeqCst), 50);
        assert_eq!(service.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connections_served_concurrently() {
        let service = Arc::new(Counting::default());
        let server = start(test_settings(), empty_cache(), service.clone());

        let clients: Vec<_> = (0..8)
            .map(|_| {
                let mut client = server.connect();
                thread::spawn(move || {
                    for _ in 0..10 {
                        assert_eq!(get(&mut client, "/").0, 200);
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }
        assert_eq!(service.served.load(Ordering::SeqCst), 80);
    }

    #[test]
    fn test_keep_alive_and_close() {
        let service = Arc::new(Counting::default());
        let server = start(test_settings(), empty_cache(), service);
        let mut client = server.connect();

        let (_, head, _) = get(&mut client, "/");
        assert!(head.contains("Connection: keep-alive"));
        assert_eq!(get(&mut client, "/").0, 200);

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        let (status, head, _) = read_response(&mut client);
        assert_eq!(status, 200);
        assert!(head.contains("Connection: close"));
        assert_closed(&mut client);
        assert!(wait_for(|| server.ctx.timers.is_empty()));
    }

    #[test]
    fn test_pipelined_requests_in_one_segment() {
        let service = Arc::new(Counting::default());
        let server = start(test_settings(), empty_cache(), service);
        let mut client = server.connect();

        client
            .write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n")
            .unwrap();
        for _ in 0..3 {
            assert_eq!(read_response(&mut client).0, 200);
        }
    }

    #[test]
    fn test_malformed_request_rejected() {
        let service = Arc::new(Counting::default());
        let server = start(test_settings(), empty_cache(), service);
        let mut client = server.connect();

        client.write_all(b"NOT HTTP AT ALL\r\n\r\n").unwrap();
        let (status, _, _) = read_response(&mut client);
        assert_eq!(status, 400);
        assert_closed(&mut client);
    }

    #[test]
    fn test_idle_connection_swept() {
        let settings = RuntimeSettings {
            keepalive_ms: 100,
            ..test_settings()
        };
        let service = Arc::new(Counting::default());
        let server = start(settings, empty_cache(), service);
        let mut client = server.connect();
        assert_eq!(get(&mut client, "/").0, 200);

        let started = Instant::now();
        assert_closed(&mut client);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(wait_for(|| server.ctx.timers.is_empty()));
    }

    #[test]
    fn test_connection_limit() {
        let settings = RuntimeSettings {
            max_connections: 1,
            ..test_settings()
        };
        let service = Arc::new(Counting::default());
        let server = start(settings, empty_cache(), service);

        let mut first = server.connect();
        assert_eq!(get(&mut first, "/").0, 200);

        let mut second = server.connect();
        assert_closed(&mut second);

        assert_eq!(get(&mut first, "/").0, 200);
        assert_eq!(server.ctx.timers.len(), 1);
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let service = Arc::new(Counting::default());
        let mut server = start(test_settings(), empty_cache(), service);
        let mut client = server.connect();
        assert_eq!(get(&mut client, "/").0, 200);

        server.stop().unwrap();
        assert_closed(&mut client);
        assert!(server.ctx.timers.is_empty());
        assert!(TcpStream::connect(server.addr).is_err());
    }
}
