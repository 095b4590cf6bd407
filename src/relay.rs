//! Relay core: the validate -> hash -> fan-out pipeline, the `status`
//! command, and the self-stats flush. Listeners own sockets and framing;
//! this module owns what happens once a line has been split out of a
//! datagram or session buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::backend::Backend;
use crate::group::BackendGroup;
use crate::hash::hash_key;
use crate::proto::Pdu;
use crate::validate::{self, Parsed};

#[derive(Debug, Default)]
pub struct RelayCounters {
    pub bytes_recv_tcp: AtomicU64,
    pub bytes_recv_udp: AtomicU64,
    pub total_connections: AtomicU64,
    pub malformed_lines: AtomicU64,
}

/// Outcome of handling one line, used by TCP sessions to decide whether to
/// close (malformed lines are fatal to a TCP session, but not to a UDP
/// datagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Routed,
    Malformed,
    /// The line was the literal `status` command; the caller should write
    /// the status dump back to the session instead of routing anything.
    StatusCommand,
}

pub struct RelayCore {
    primary_group: BackendGroup,
    duplicate_groups: Vec<BackendGroup>,
    monitor_group: Option<BackendGroup>,
    backend_registry: HashMap<String, Backend>,
    validate_point_tags: bool,
    counters: RelayCounters,
}

impl RelayCore {
    pub fn new(
        primary_group: BackendGroup,
        duplicate_groups: Vec<BackendGroup>,
        monitor_group: Option<BackendGroup>,
        backend_registry: HashMap<String, Backend>,
        validate_point_tags: bool,
    ) -> Self {
        RelayCore {
            primary_group,
            duplicate_groups,
            monitor_group,
            backend_registry,
            validate_point_tags,
            counters: RelayCounters::default(),
        }
    }

    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    pub fn record_tcp_bytes(&self, n: usize) {
        self.counters.bytes_recv_tcp.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_udp_bytes(&self, n: usize) {
        self.counters.bytes_recv_udp.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Handle one newline-delimited line (no trailing `\n`). Fans the line
    /// out to the primary group plus each duplicate group, in that fixed
    /// order; the monitor group is never a target of client-provided lines.
    pub fn handle_line(&self, line: &[u8]) -> LineOutcome {
        if line == b"status" {
            return LineOutcome::StatusCommand;
        }

        let bytes = Bytes::copy_from_slice(line);
        let pdu = match Pdu::parse(bytes) {
            Ok(pdu) => pdu,
            Err(_) => {
                self.counters.malformed_lines.fetch_add(1, Ordering::Relaxed);
                return LineOutcome::Malformed;
            }
        };

        let parsed: Parsed = match validate::validate(&pdu, self.validate_point_tags) {
            Ok(p) => p,
            Err(_) => {
                self.counters.malformed_lines.fetch_add(1, Ordering::Relaxed);
                return LineOutcome::Malformed;
            }
        };

        let key_hash = hash_key(pdu.key());
        self.primary_group.route(&pdu, &parsed, key_hash);
        for dup in &self.duplicate_groups {
            dup.route(&pdu, &parsed, key_hash);
        }

        LineOutcome::Routed
    }

    /// Human-readable counter dump for the `status` TCP command: one
    /// `"{scope} {name} {kind} {value}\n"` line per counter, terminated by
    /// an empty line.
    pub fn status_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "global bytes_recv_tcp counter {}\n",
            self.counters.bytes_recv_tcp.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "global bytes_recv_udp counter {}\n",
            self.counters.bytes_recv_udp.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "global total_connections counter {}\n",
            self.counters.total_connections.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "global malformed_lines counter {}\n",
            self.counters.malformed_lines.load(Ordering::Relaxed)
        ));

        self.append_group_status(&mut out, "group_0", &self.primary_group);
        for (i, group) in self.duplicate_groups.iter().enumerate() {
            self.append_group_status(&mut out, &format!("group_{}", i + 1), group);
        }

        for (key, backend) in &self.backend_registry {
            let escaped = escape_backend_key(key);
            out.push_str(&format!(
                "backend_{} bytes_sent counter {}\n",
                escaped,
                backend.counters().bytes_sent.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "backend_{} relayed_lines counter {}\n",
                escaped,
                backend.counters().relayed_lines.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "backend_{} dropped_lines counter {}\n",
                escaped,
                backend.counters().dropped_lines.load(Ordering::Relaxed)
            ));
        }

        out.push('\n');
        out
    }

    fn append_group_status(&self, out: &mut String, name: &str, group: &BackendGroup) {
        out.push_str(&format!(
            "{} relayed_lines counter {}\n",
            name,
            group.counters().relayed_lines.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "{} filtered_lines counter {}\n",
            name,
            group.counters().filtered_lines.load(Ordering::Relaxed)
        ));
    }

    /// Called on the self-stats tick: synthesize `global.*`, `group_N.*` and
    /// `backend_*.*` lines and route each through the monitor group.
    pub fn flush_self_stats(&self) {
        let monitor = match &self.monitor_group {
            Some(m) => m,
            None => return,
        };

        for line in self.self_stats_lines() {
            monitor.route_synthesized(line.as_bytes());
        }
    }

    fn self_stats_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!(
            "global.bytes_recv_tcp:{}|g",
            self.counters.bytes_recv_tcp.load(Ordering::Relaxed)
        ));
        lines.push(format!(
            "global.bytes_recv_udp:{}|g",
            self.counters.bytes_recv_udp.load(Ordering::Relaxed)
        ));
        lines.push(format!(
            "global.malformed_lines:{}|g",
            self.counters.malformed_lines.load(Ordering::Relaxed)
        ));

        lines.push(format!(
            "group_0.relayed_lines:{}|g",
            self.primary_group.counters().relayed_lines.load(Ordering::Relaxed)
        ));
        for (i, group) in self.duplicate_groups.iter().enumerate() {
            lines.push(format!(
                "group_{}.relayed_lines:{}|g",
                i + 1,
                group.counters().relayed_lines.load(Ordering::Relaxed)
            ));
        }

        for (key, backend) in &self.backend_registry {
            let escaped = escape_backend_key(key);
            lines.push(format!(
                "backend_{}.bytes_sent:{}|g",
                escaped,
                backend.counters().bytes_sent.load(Ordering::Relaxed)
            ));
            lines.push(format!(
                "backend_{}.dropped_lines:{}|g",
                escaped,
                backend.counters().dropped_lines.load(Ordering::Relaxed)
            ));
        }
        lines
    }

    /// Called on a coarse supervisor tick (finer than any one group's
    /// sampler window). For each group with a sampler, flushes it at most
    /// once per its own `window_seconds` and sweeps its TTL at most once per
    /// its own `expiry_period_seconds`, so groups with different sampler
    /// configurations run on independent cadences from a single timer.
    pub fn tick_samplers(&self, now: u64) {
        for group in std::iter::once(&self.primary_group).chain(self.duplicate_groups.iter()) {
            let sampler = match group.sampler() {
                Some(s) => s,
                None => continue,
            };
            if sampler.due_for_flush(now) {
                // Flush before update_flags: a bucket whose traffic just
                // dropped to/below threshold this window is still
                // `sampling` right now, and its accumulated sum/count for
                // this window must go out before update_flags exits it.
                let mut emitted = Vec::new();
                sampler.flush(|line| emitted.push(line));
                sampler.update_flags();
                // `route_synthesized` hashes and sends straight to the
                // ring, bypassing this same group's ingress filter and
                // sampler. Routing a flushed summary back through
                // `route()` would hand it right back to the sampler that
                // just emitted it, folding it into the next window instead
                // of ever reaching a backend.
                for line in emitted {
                    group.route_synthesized(line.as_bytes());
                }
            }
            if sampler.due_for_ttl_sweep(now) {
                sampler.sweep_ttl();
            }
        }
    }
}

/// Escape a canonical `host:port:proto` backend key for use as a statsd
/// metric name segment: `.`/`:` in the `host:port` portion become `_`, then
/// `.{proto}` is appended as a literal suffix.
fn escape_backend_key(key: &str) -> String {
    let (host_port, proto) = match key.rsplit_once(':') {
        Some(pair) => pair,
        None => return key.to_string(),
    };
    let escaped: String = host_port
        .chars()
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    format!("{}.{}", escaped, proto)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::Ring;

    fn empty_core() -> RelayCore {
        let ring: Ring<Backend> = Ring::new();
        let primary = BackendGroup::new(ring, None, None, None, None);
        RelayCore::new(primary, vec![], None, HashMap::new(), true)
    }

    #[test]
    fn status_command_is_recognized() {
        let core = empty_core();
        assert_eq!(core.handle_line(b"status"), LineOutcome::StatusCommand);
    }

    #[test]
    fn malformed_line_increments_counter() {
        let core = empty_core();
        assert_eq!(core.handle_line(b"not-a-valid-line"), LineOutcome::Malformed);
        assert_eq!(core.counters().malformed_lines.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn well_formed_line_routes_and_does_not_count_as_malformed() {
        let core = empty_core();
        assert_eq!(core.handle_line(b"foo.bar:1|c"), LineOutcome::Routed);
        assert_eq!(core.counters().malformed_lines.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn status_text_contains_global_counters() {
        let core = empty_core();
        core.record_tcp_bytes(42);
        let text = core.status_text();
        assert!(text.contains("global bytes_recv_tcp counter 42"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn escape_backend_key_replaces_dots_and_colons_and_appends_proto() {
        assert_eq!(escape_backend_key("10.0.0.1:8125:tcp"), "10_0_0_1_8125.tcp");
    }

    #[tokio::test]
    async fn reserved_point_tag_is_malformed_when_enabled() {
        let core = empty_core();
        assert_eq!(
            core.handle_line(b"requests.__host=web01.count:1|c"),
            LineOutcome::Malformed
        );
    }
}
