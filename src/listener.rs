//! TCP acceptor + per-session readers, and the UDP receiver. Sockets and
//! line-framing live here; everything past "here is one newline-delimited
//! line" is `relay::RelayCore`'s job. Uses `tokio::net::UdpSocket` rather
//! than a dedicated blocking thread, since this relay has no other use for
//! a non-async thread.
//!
//! Binding is split from serving so the supervisor can capture a listener's
//! raw fd before handing the socket off to its accept/receive loop — needed
//! for the SIGUSR2 hot-restart handoff, which passes bound descriptors to a
//! freshly exec'd process rather than rebinding from scratch.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, warn};
use memchr::memchr;
use stream_cancel::Tripwire;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::select;
use tokio::time::timeout;

use crate::relay::{LineOutcome, RelayCore};
use crate::stats;

const TCP_READ_TIMEOUT: Duration = Duration::from_secs(62);
const READ_BUFFER: usize = 8192;
const UDP_DATAGRAM_CAP: usize = 65_536;
const TCP_LISTEN_BACKLOG: u32 = 128;

fn parse_bind(bind: &str) -> std::io::Result<SocketAddr> {
    bind.parse()
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, format!("invalid bind address '{}'", bind)))
}

/// Bind a fresh TCP listener with `SO_REUSEADDR` and a fixed backlog, or
/// adopt an inherited descriptor handed down across a hot restart.
pub fn bind_tcp(bind: &str, inherited_fd: Option<RawFd>) -> std::io::Result<TcpListener> {
    if let Some(fd) = inherited_fd {
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        return TcpListener::from_std(std_listener);
    }

    let addr = parse_bind(bind)?;
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(TCP_LISTEN_BACKLOG)
}

/// Bind a fresh UDP socket, or adopt an inherited descriptor (see `bind_tcp`).
pub fn bind_udp(bind: &str, inherited_fd: Option<RawFd>) -> std::io::Result<UdpSocket> {
    if let Some(fd) = inherited_fd {
        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
        std_socket.set_nonblocking(true)?;
        return UdpSocket::from_std(std_socket);
    }

    let addr = parse_bind(bind)?;
    std::net::UdpSocket::bind(addr).and_then(|std_socket| {
        std_socket.set_nonblocking(true)?;
        UdpSocket::from_std(std_socket)
    })
}

/// Split `buf` on `\n`, stripping an optional trailing `\r`, draining every
/// complete line. A trailing partial line (no terminating `\n` yet) is left
/// in `buf` for the next read.
fn drain_lines(buf: &mut BytesMut) -> Vec<BytesMut> {
    let mut lines = Vec::new();
    loop {
        match memchr(b'\n', buf) {
            None => break,
            Some(newline) => {
                let mut line = buf.split_to(newline + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    let new_len = line.len() - 1;
                    line.truncate(new_len);
                }
                lines.push(line);
            }
        }
    }
    lines
}

fn split_datagram(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n').filter_map(|line| {
        let line = if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        };
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    })
}

/// Drive one accepted TCP connection until EOF, a malformed line, a read
/// timeout, or the shared `tripwire` fires (graceful shutdown).
async fn tcp_session(
    core: Arc<RelayCore>,
    stats: stats::Scope,
    peer: String,
    mut tripwire: Tripwire,
    mut socket: TcpStream,
) {
    core.record_connection();
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    let disconnects = stats.counter("disconnects").expect("counter registration");
    let lines_counter = stats.counter("lines").expect("counter registration");

    'session: loop {
        if buf.remaining_mut() < READ_BUFFER {
            buf.reserve(READ_BUFFER);
        }
        let result = select! {
            r = timeout(TCP_READ_TIMEOUT, socket.read_buf(&mut buf)) => match r {
                Err(_) => Err(std::io::Error::new(ErrorKind::TimedOut, "read timeout")),
                Ok(Err(e)) => Err(e),
                Ok(Ok(n)) => Ok(n),
            },
            _ = &mut tripwire => Err(std::io::Error::new(ErrorKind::Other, "shutting down")),
        };

        match result {
            Ok(0) => {
                debug!("closing reader (eof) {}", peer);
                break;
            }
            Ok(n) => {
                core.record_tcp_bytes(n);
                let lines = drain_lines(&mut buf);
                lines_counter.inc_by(lines.len() as f64);
                for line in lines {
                    match core.handle_line(&line) {
                        LineOutcome::StatusCommand => {
                            let _ = socket.write_all(core.status_text().as_bytes()).await;
                        }
                        LineOutcome::Malformed => {
                            debug!("malformed line from {}, closing session", peer);
                            break 'session;
                        }
                        LineOutcome::Routed => {}
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Other => {
                let _ = timeout(
                    Duration::from_secs(1),
                    socket.write_all(b"server closing due to shutdown, goodbye\n"),
                )
                .await;
                break;
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                debug!("read timeout, closing {}", peer);
                break;
            }
            Err(e) => {
                debug!("socket error {:?} {}", e, peer);
                break;
            }
        }
    }
    disconnects.inc();
}

/// Accept loop for one already-bound TCP listener. Returns once `tripwire`
/// fires. `bind` is carried through only for log messages.
pub async fn run_tcp(
    core: Arc<RelayCore>,
    stats: stats::Scope,
    listener: TcpListener,
    bind: String,
    mut tripwire: Tripwire,
) -> std::io::Result<()> {
    info!("statsd tcp server running on {}", bind);
    let accepts = stats.counter("accepts").expect("counter registration");
    let accept_failures = stats.counter("accept_failures").expect("counter registration");

    loop {
        select! {
            _ = tripwire.clone() => {
                info!("stopped tcp listener loop on {}", bind);
                return Ok(());
            }
            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        accepts.inc();
                        debug!("accepted connection from {:?}", addr);
                        let core = core.clone();
                        let session_stats = stats.scope("connections");
                        let tw = tripwire.clone();
                        tokio::spawn(async move {
                            tcp_session(core, session_stats, addr.to_string(), tw, socket).await;
                        });
                    }
                    Err(err) => {
                        accept_failures.inc();
                        warn!("accept error = {:?}", err);
                    }
                }
            }
        }
    }
}

/// Single non-blocking UDP receiver; no sessions.
pub async fn run_udp(
    core: Arc<RelayCore>,
    stats: stats::Scope,
    socket: UdpSocket,
    bind: String,
    mut tripwire: Tripwire,
) -> std::io::Result<()> {
    info!("statsd udp server running on {}", bind);
    let incoming_bytes = stats.counter("incoming_bytes").expect("counter registration");

    let mut buf = vec![0u8; UDP_DATAGRAM_CAP];
    loop {
        select! {
            _ = tripwire.clone() => {
                info!("stopped udp listener loop on {}", bind);
                return Ok(());
            }
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((n, _remote)) => {
                        incoming_bytes.inc_by(n as f64);
                        core.record_udp_bytes(n);
                        for line in split_datagram(&buf[..n]) {
                            core.handle_line(line);
                        }
                    }
                    Err(e) => warn!("udp receiver error {:?}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drain_lines_leaves_partial_trailing_data() {
        let mut b = BytesMut::new();
        b.put_slice(b"hello:1|c\nhello:1|c\nhello2");
        let lines = drain_lines(&mut b);
        assert_eq!(lines.len(), 2);
        assert_eq!(b.chunk(), b"hello2");
    }

    #[test]
    fn drain_lines_strips_carriage_return() {
        let mut b = BytesMut::new();
        b.put_slice(b"hello:1|c\r\nhello2:1|c\n");
        let lines = drain_lines(&mut b);
        assert_eq!(lines[0].as_ref(), b"hello:1|c");
        assert_eq!(lines[1].as_ref(), b"hello2:1|c");
    }

    #[test]
    fn drain_lines_no_newline_leaves_buffer_untouched() {
        let mut b = BytesMut::new();
        b.put_slice(b"hello");
        let lines = drain_lines(&mut b);
        assert!(lines.is_empty());
        assert_eq!(b.chunk(), b"hello");
    }

    #[test]
    fn split_datagram_skips_empty_segments() {
        let segments: Vec<&[u8]> = split_datagram(b"a:1|c\n\nb:2|c\r\n").collect();
        assert_eq!(segments, vec![&b"a:1|c"[..], &b"b:2|c"[..]]);
    }
}
