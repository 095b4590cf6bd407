//! Per-destination backend client: owns one outbound TCP or UDP connection,
//! a bounded send queue, and the `Init -> Connecting -> Backoff -> Connected
//! -> Terminated` state machine from the original `tcpclient.h` (despite the
//! name, that module also spoke UDP; so does this one).
//!
//! Unlike the C original's single-threaded `libev` callbacks, each backend
//! here owns a dedicated tokio task that loops over "connect, then drain the
//! queue" until told to stop. The queue itself lives behind a
//! `parking_lot::Mutex` so `sendall` (called from relay/group code on the
//! hot path) never has to hop onto the backend's task to enqueue bytes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::buffer::ByteBuffer;
use crate::stats;

/// Non-blocking connect timeout, matching `TCPCLIENT_CONNECT_TIMEOUT`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Backoff hold time after a connection error, matching `TCPCLIENT_RETRY_TIMEOUT`.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default send queue cap, matching `TCPCLIENT_SEND_QUEUE` (128 MiB).
pub const DEFAULT_SEND_QUEUE: usize = 134_217_728;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Connecting = 1,
    Backoff = 2,
    Connected = 3,
    Terminated = 4,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Init,
            1 => State::Connecting,
            2 => State::Backoff,
            3 => State::Connected,
            _ => State::Terminated,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("send queue is full")]
    QueueFull,
    #[error("backend has been terminated")]
    Terminated,
}

/// Construction-time knobs mirroring the per-backend config fields in
/// `StatsdBackendConfig`.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub max_send_queue: usize,
    pub auto_reconnect: bool,
    pub reconnect_threshold: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            max_send_queue: DEFAULT_SEND_QUEUE,
            auto_reconnect: true,
            reconnect_threshold: 1.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct BackendCounters {
    pub bytes_queued: std::sync::atomic::AtomicU64,
    pub bytes_sent: std::sync::atomic::AtomicU64,
    pub relayed_lines: std::sync::atomic::AtomicU64,
    pub dropped_lines: std::sync::atomic::AtomicU64,
}

struct Shared {
    host: String,
    port: u16,
    proto: Proto,
    canonical_key: String,
    config: BackendConfig,
    queue: Mutex<ByteBuffer>,
    state: AtomicU8,
    failing: AtomicBool,
    reconnect_requested: AtomicBool,
    last_error_at: Mutex<Option<Instant>>,
    retry_count: std::sync::atomic::AtomicU64,
    notify: Notify,
    counters: BackendCounters,
    stat_fails: stats::Counter,
    stat_reconnects: stats::Counter,
}

/// A cloneable handle to one backend connection. Cloning shares the queue,
/// counters and background task; the task itself is spawned once, at
/// construction, and runs until `terminate` is called.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Shared>,
}

impl Backend {
    pub fn spawn(host: String, port: u16, proto: Proto, config: BackendConfig, scope: stats::Scope) -> Backend {
        let canonical_key = format!("{}:{}:{}", host, port, proto);
        let max_send_queue = config.max_send_queue;
        let initial_size = max_send_queue.min(4096).max(1);
        let shared = Arc::new(Shared {
            host,
            port,
            proto,
            canonical_key,
            config,
            queue: Mutex::new(ByteBuffer::new(initial_size, max_send_queue)),
            state: AtomicU8::new(State::Init as u8),
            failing: AtomicBool::new(false),
            reconnect_requested: AtomicBool::new(false),
            last_error_at: Mutex::new(None),
            retry_count: std::sync::atomic::AtomicU64::new(0),
            notify: Notify::new(),
            counters: BackendCounters::default(),
            stat_fails: scope.counter("connect_failures").expect("counter registration"),
            stat_reconnects: scope.counter("forced_reconnects").expect("counter registration"),
        });

        let backend = Backend { inner: shared };
        let task_handle = backend.clone();
        tokio::spawn(async move { task_handle.run().await });
        backend
    }

    pub fn canonical_key(&self) -> &str {
        &self.inner.canonical_key
    }

    pub fn state(&self) -> State {
        State::from(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_failing(&self) -> bool {
        self.inner.failing.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u64 {
        self.inner.retry_count.load(Ordering::Relaxed)
    }

    pub fn last_error_at(&self) -> Option<Instant> {
        *self.inner.last_error_at.lock()
    }

    pub fn counters(&self) -> &BackendCounters {
        &self.inner.counters
    }

    /// Queue `bytes` for delivery, per the `sendall` contract.
    pub fn sendall(&self, bytes: &[u8]) -> Result<(), SendError> {
        if self.state() == State::Terminated {
            return Err(SendError::Terminated);
        }

        let mut queue = self.inner.queue.lock();
        if bytes.len() > queue.spacecount() {
            queue.realign();
        }
        if queue.append(bytes).is_err() {
            // realign wasn't enough; try growing up to the configured cap.
            let mut appended = false;
            while queue.expand().is_ok() {
                if queue.append(bytes).is_ok() {
                    appended = true;
                    break;
                }
                if queue.capacity() >= self.inner.config.max_send_queue {
                    break;
                }
            }
            if !appended {
                self.inner.failing.store(true, Ordering::Relaxed);
                self.inner
                    .counters
                    .dropped_lines
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SendError::QueueFull);
            }
        }

        self.inner
            .counters
            .bytes_queued
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.inner
            .counters
            .relayed_lines
            .fetch_add(1, Ordering::Relaxed);
        self.inner.failing.store(false, Ordering::Relaxed);

        let occupancy = queue.datacount() as f64 / self.inner.config.max_send_queue as f64;
        drop(queue);

        if self.inner.config.auto_reconnect
            && occupancy >= self.inner.config.reconnect_threshold
            && self.state() == State::Connected
        {
            self.inner.reconnect_requested.store(true, Ordering::Relaxed);
        }

        self.inner.notify.notify_one();
        Ok(())
    }

    /// Close the backend permanently; queued bytes are dropped.
    pub fn terminate(&self) {
        self.inner.state.store(State::Terminated as u8, Ordering::Release);
        self.inner.notify.notify_one();
    }

    fn set_state(&self, state: State) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    async fn resolve(&self) -> std::io::Result<std::net::SocketAddr> {
        use std::io::{Error, ErrorKind};
        tokio::net::lookup_host((self.inner.host.as_str(), self.inner.port))
            .await?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no address resolved"))
    }

    /// Background connect/drain loop. Exactly one connection attempt is in
    /// flight at any time.
    async fn run(self) {
        loop {
            if self.state() == State::Terminated {
                return;
            }

            self.set_state(State::Connecting);
            let addr = match self.resolve().await {
                Ok(addr) => addr,
                Err(_) => {
                    self.enter_backoff();
                    tokio::time::sleep(RETRY_TIMEOUT).await;
                    continue;
                }
            };

            let connected = match self.inner.proto {
                Proto::Tcp => tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .map(Connection::Tcp),
                Proto::Udp => {
                    let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
                    match UdpSocket::bind(bind_addr).await {
                        Ok(sock) => match sock.connect(addr).await {
                            Ok(()) => Some(Connection::Udp(sock)),
                            Err(_) => None,
                        },
                        Err(_) => None,
                    }
                }
            };

            let conn = match connected {
                Some(c) => c,
                None => {
                    self.enter_backoff();
                    tokio::time::sleep(RETRY_TIMEOUT).await;
                    continue;
                }
            };

            self.set_state(State::Connected);
            self.inner.failing.store(false, Ordering::Relaxed);
            if !self.drain(conn).await {
                self.enter_backoff();
                tokio::time::sleep(RETRY_TIMEOUT).await;
            }
        }
    }

    fn enter_backoff(&self) {
        self.inner.stat_fails.inc();
        self.inner.retry_count.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_error_at.lock() = Some(Instant::now());
        self.set_state(State::Backoff);
    }

    /// Drain the queue over `conn` until terminated, a forced reconnect is
    /// requested, or a fatal socket error occurs. Returns `false` on error
    /// (caller should back off before reconnecting).
    async fn drain(&self, mut conn: Connection) -> bool {
        loop {
            if self.state() == State::Terminated {
                return true;
            }
            if self.inner.reconnect_requested.swap(false, Ordering::Relaxed) {
                self.inner.stat_reconnects.inc();
                return false;
            }

            let chunk: Option<Vec<u8>> = {
                let queue = self.inner.queue.lock();
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.as_slice().to_vec())
                }
            };

            let chunk = match chunk {
                Some(c) => c,
                None => {
                    let wait = self.inner.notify.notified();
                    tokio::select! {
                        _ = wait => continue,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                    }
                }
            };

            let written = match &mut conn {
                Connection::Tcp(stream) => stream.write(&chunk).await,
                Connection::Udp(sock) => sock.send(&chunk).await,
            };

            match written {
                Ok(n) if n > 0 => {
                    self.inner.queue.lock().consume(n);
                    self.inner
                        .counters
                        .bytes_sent
                        .fetch_add(n as u64, Ordering::Relaxed);
                }
                _ => return false,
            }
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}
