//! Backend group: one consistent-hash ring plus optional key
//! prefix/suffix rewriting, an optional ingress filter, and an optional
//! sampler. Implements the `route()` fan-out step.

use bytes::Bytes;

use crate::backend::{Backend, SendError};
use crate::filter::Filter;
use crate::hash::Ring;
use crate::proto::Pdu;
use crate::sampler::{SampleResult, Sampler};
use crate::validate::Parsed;

/// Outbound lines are rewritten/truncated in a scratch buffer bounded by the
/// UDP datagram cap, matching the egress truncation rule.
const MAX_LINE_LEN: usize = 65_536;

#[derive(Debug, Default)]
pub struct GroupCounters {
    pub relayed_lines: std::sync::atomic::AtomicU64,
    pub filtered_lines: std::sync::atomic::AtomicU64,
}

pub struct BackendGroup {
    ring: Ring<Backend>,
    prefix: Option<Vec<u8>>,
    suffix: Option<Vec<u8>>,
    ingress_filter: Option<Filter>,
    sampler: Option<Sampler>,
    counters: GroupCounters,
}

impl BackendGroup {
    pub fn new(
        ring: Ring<Backend>,
        prefix: Option<String>,
        suffix: Option<String>,
        ingress_filter: Option<Filter>,
        sampler: Option<Sampler>,
    ) -> Self {
        BackendGroup {
            ring,
            prefix: prefix.map(|p| p.into_bytes()),
            suffix: suffix.map(|s| s.into_bytes()),
            ingress_filter,
            sampler,
            counters: GroupCounters::default(),
        }
    }

    pub fn counters(&self) -> &GroupCounters {
        &self.counters
    }

    pub fn ring(&self) -> &Ring<Backend> {
        &self.ring
    }

    pub fn sampler(&self) -> Option<&Sampler> {
        self.sampler.as_ref()
    }

    /// Route one line through this group: filter, hash, optionally rewrite,
    /// optionally intercept via the sampler, enqueue on the chosen backend.
    pub fn route(&self, pdu: &Pdu, parsed: &Parsed, key_hash: u32) {
        if let Some(filter) = &self.ingress_filter {
            if !filter.exec(pdu.key()) {
                self.counters
                    .filtered_lines
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        }

        if let Some(sampler) = &self.sampler {
            if parsed.metric_type.is_samplable() {
                let rate = parsed.presampling_value;
                let result = match parsed.metric_type {
                    crate::proto::MetricType::Counter => sampler.consider_counter(pdu.key(), parsed.value, rate),
                    crate::proto::MetricType::Gauge => sampler.consider_gauge(pdu.key(), parsed.value, rate),
                    crate::proto::MetricType::Timer => sampler.consider_timer(pdu.key(), parsed.value, rate),
                    _ => SampleResult::NotSampling,
                };
                if result == SampleResult::Sampling {
                    // Folded into the rolling summary; nothing forwarded now.
                    self.counters
                        .relayed_lines
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
            }
        }

        let backend = match self.ring.choose(key_hash) {
            Some(b) => b,
            None => return,
        };

        let rewritten;
        let out: &[u8] = if self.prefix.is_some() || self.suffix.is_some() {
            let prefix = self.prefix.as_deref().unwrap_or(b"");
            let suffix = self.suffix.as_deref().unwrap_or(b"");
            rewritten = pdu.with_prefix_suffix(prefix, suffix);
            let bytes = rewritten.as_bytes();
            if bytes.len() > MAX_LINE_LEN {
                &bytes[..MAX_LINE_LEN]
            } else {
                bytes
            }
        } else {
            pdu.as_bytes()
        };

        self.send_line(backend, out);
    }

    /// Route an already-synthesized line (self-stats), hashing its key here.
    pub fn route_synthesized(&self, line: &[u8]) {
        let bytes = Bytes::copy_from_slice(line);
        let pdu = match Pdu::parse(bytes) {
            Ok(p) => p,
            Err(_) => return,
        };
        let hash = crate::hash::hash_key(pdu.key());
        let backend = match self.ring.choose(hash) {
            Some(b) => b,
            None => return,
        };
        self.send_line(backend, pdu.as_bytes());
    }

    fn send_line(&self, backend: &Backend, out: &[u8]) {
        let mut line = Vec::with_capacity(out.len() + 1);
        line.extend_from_slice(out);
        line.push(b'\n');

        self.counters
            .relayed_lines
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match backend.sendall(&line) {
            Ok(()) => {}
            Err(SendError::QueueFull) | Err(SendError::Terminated) => {
                // Backend already bumped its own dropped_lines/failing state.
            }
        }
    }
}
