//! Statsd protocol data unit: a zero-copy view over an incoming line plus an
//! owned, parsed representation.
//!
//! `Pdu` stores byte offsets into the underlying `Bytes` rather than
//! allocating sub-slices, so a line can be routed to several backend groups
//! without repeated copies; only `with_prefix_suffix` (used when a group
//! rewrites the key) allocates a new buffer.

use std::convert::TryFrom;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing ':' separating key from value")]
    MissingKeyValueSeparator,
    #[error("empty key")]
    EmptyKey,
    #[error("missing '|' separating value from type")]
    MissingTypeSeparator,
    #[error("value is not a finite number")]
    InvalidValue,
    #[error("unknown metric type")]
    InvalidType,
    #[error("sample rate missing after '|@'")]
    MissingSampleRate,
    #[error("sample rate is not a finite number in (0, 1]")]
    InvalidSampleRate,
    #[error("unsupported trailing extension field")]
    UnsupportedExtensionField,
}

/// The seven wire type tags named in the DATA MODEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Timer,
    Kv,
    Gauge,
    DirectGauge,
    Histogram,
    Set,
}

impl MetricType {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            MetricType::Counter => b"c",
            MetricType::Timer => b"ms",
            MetricType::Kv => b"kv",
            MetricType::Gauge => b"g",
            MetricType::DirectGauge => b"G",
            MetricType::Histogram => b"h",
            MetricType::Set => b"s",
        }
    }

    /// Counters, timers and gauges are the three types the sampler can
    /// intercept; `kv`, direct gauges, histograms and sets pass through a
    /// group's sampler untouched.
    pub fn is_samplable(&self) -> bool {
        matches!(self, MetricType::Counter | MetricType::Timer | MetricType::Gauge)
    }
}

impl TryFrom<&[u8]> for MetricType {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value {
            b"c" => Ok(MetricType::Counter),
            b"ms" => Ok(MetricType::Timer),
            b"kv" => Ok(MetricType::Kv),
            b"g" => Ok(MetricType::Gauge),
            b"G" => Ok(MetricType::DirectGauge),
            b"h" => Ok(MetricType::Histogram),
            b"s" => Ok(MetricType::Set),
            _ => Err(ParseError::InvalidType),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::str::from_utf8(self.as_bytes()).unwrap())
    }
}

/// A protocol data unit: an incoming, newline-stripped statsd line, with
/// field offsets captured but no value parsing or allocation performed. Used
/// for the fast path (hashing, filtering, rewriting) where the numeric value
/// is never inspected.
#[derive(Debug, Clone)]
pub struct Pdu {
    underlying: Bytes,
    key_end: usize,    // index of the ':' separating key from value
    value_end: usize,  // index of the '|' separating value from type
    type_end: usize,   // end of the type token (next '|' or end of line)
    rate: Option<(usize, usize)>,
}

impl Pdu {
    pub fn key(&self) -> &[u8] {
        &self.underlying[0..self.key_end]
    }

    pub fn value(&self) -> &[u8] {
        &self.underlying[self.key_end + 1..self.value_end]
    }

    pub fn metric_type_bytes(&self) -> &[u8] {
        &self.underlying[self.value_end + 1..self.type_end]
    }

    pub fn rate(&self) -> Option<&[u8]> {
        self.rate.map(|(s, e)| &self.underlying[s..e])
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.underlying.as_ref()
    }

    pub fn len(&self) -> usize {
        self.underlying.len()
    }

    pub fn is_empty(&self) -> bool {
        self.underlying.is_empty()
    }

    /// Parse field offsets from a raw line. This performs only structural
    /// recognition — the line validator owns semantic rejection of
    /// values/types/rates; the exact same offsets are reused by both UDP
    /// and TCP framing so parsing never depends on how the line arrived.
    ///
    /// The key/value separator is the *last* `:` in the line, so keys that
    /// embed a literal `:` (e.g. `host:port` segments folded into a metric
    /// name) are tolerated.
    pub fn parse(line: Bytes) -> Result<Self, ParseError> {
        let length = line.len();
        let key_end = match memrchr(b':', &line) {
            Some(i) => i,
            None => return Err(ParseError::MissingKeyValueSeparator),
        };
        if key_end == 0 {
            return Err(ParseError::EmptyKey);
        }

        let rest = &line[key_end + 1..];
        let value_end_rel = memchr(b'|', rest).ok_or(ParseError::MissingTypeSeparator)?;
        let value_end = key_end + 1 + value_end_rel;

        let mut type_end = length;
        let mut rate: Option<(usize, usize)> = None;
        let mut scan = value_end + 1;
        loop {
            match memchr(b'|', &line[scan..]) {
                None => break,
                Some(rel) => {
                    let bar = scan + rel;
                    if type_end == length {
                        type_end = bar;
                    }
                    if bar + 1 >= length {
                        return Err(ParseError::MissingSampleRate);
                    }
                    match line[bar + 1] {
                        b'@' => {
                            if rate.is_some() {
                                return Err(ParseError::UnsupportedExtensionField);
                            }
                            rate = Some((bar + 2, length));
                        }
                        _ => return Err(ParseError::UnsupportedExtensionField),
                    }
                    scan = bar + 1;
                }
            }
        }

        Ok(Pdu {
            underlying: line,
            key_end,
            value_end,
            type_end,
            rate,
        })
    }

    /// Return a copy of this PDU with `prefix`/`suffix` wrapped around the
    /// key, leaving the rest of the line (`:value|type[|@rate]`) untouched.
    /// Used by groups configured with a prefix/suffix rewrite.
    pub fn with_prefix_suffix(&self, prefix: &[u8], suffix: &[u8]) -> Self {
        if prefix.is_empty() && suffix.is_empty() {
            return self.clone();
        }
        let offset = prefix.len() + suffix.len();
        let mut buf = BytesMut::with_capacity(self.len() + offset);
        buf.put(prefix);
        buf.put(self.key());
        buf.put(suffix);
        buf.put(&self.underlying[self.key_end..]);

        Pdu {
            underlying: buf.freeze(),
            key_end: self.key_end + offset,
            value_end: self.value_end + offset,
            type_end: self.type_end + offset,
            rate: self.rate.map(|(s, e)| (s + offset, e + offset)),
        }
    }
}

/// Find the last occurrence of `needle` in `hay`.
fn memrchr(needle: u8, hay: &[u8]) -> Option<usize> {
    hay.iter().rposition(|&b| b == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_counter() {
        let pdu = Pdu::parse(Bytes::from_static(b"foo.bar:3|c")).unwrap();
        assert_eq!(pdu.key(), b"foo.bar");
        assert_eq!(pdu.value(), b"3");
        assert_eq!(pdu.metric_type_bytes(), b"c");
        assert!(pdu.rate().is_none());
    }

    #[test]
    fn tolerates_colon_in_key() {
        let pdu = Pdu::parse(Bytes::from_static(b"host:box1.count:42|c")).unwrap();
        assert_eq!(pdu.key(), b"host:box1.count");
        assert_eq!(pdu.value(), b"42");
    }

    #[test]
    fn parses_rate() {
        let pdu = Pdu::parse(Bytes::from_static(b"foo.bar:3|c|@0.5")).unwrap();
        assert_eq!(pdu.metric_type_bytes(), b"c");
        assert_eq!(pdu.rate().unwrap(), b"0.5");
    }

    #[test]
    fn missing_colon_is_error() {
        assert_eq!(
            Pdu::parse(Bytes::from_static(b"foobar|c")).unwrap_err(),
            ParseError::MissingKeyValueSeparator
        );
    }

    #[test]
    fn empty_key_is_error() {
        assert_eq!(
            Pdu::parse(Bytes::from_static(b":3|c")).unwrap_err(),
            ParseError::EmptyKey
        );
    }

    #[test]
    fn missing_rate_after_at_is_error() {
        assert_eq!(
            Pdu::parse(Bytes::from_static(b"foo:3|c|@")).unwrap_err(),
            ParseError::MissingSampleRate
        );
    }

    #[test]
    fn unsupported_extension_is_error() {
        assert_eq!(
            Pdu::parse(Bytes::from_static(b"foo:3|c|#tag:v")).unwrap_err(),
            ParseError::UnsupportedExtensionField
        );
    }

    #[test]
    fn prefix_suffix_rewrite() {
        let pdu = Pdu::parse(Bytes::from_static(b"foo:1|c")).unwrap();
        let rewritten = pdu.with_prefix_suffix(b"x.", b".y");
        assert_eq!(rewritten.key(), b"x.foo.y");
        assert_eq!(rewritten.value(), b"1");
        assert_eq!(rewritten.as_bytes(), b"x.foo.y:1|c");
    }

    #[test]
    fn metric_type_roundtrip() {
        for (bytes, ty) in [
            (&b"c"[..], MetricType::Counter),
            (b"ms", MetricType::Timer),
            (b"kv", MetricType::Kv),
            (b"g", MetricType::Gauge),
            (b"G", MetricType::DirectGauge),
            (b"h", MetricType::Histogram),
            (b"s", MetricType::Set),
        ] {
            let parsed = MetricType::try_from(bytes).unwrap();
            assert_eq!(parsed, ty);
            assert_eq!(parsed.as_bytes(), bytes);
        }
    }
}
