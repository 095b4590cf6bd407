//! Line-level semantic validation: value parsing, type recognition, sample
//! rate range, and reserved point-tag rejection.
//!
//! This sits above `proto::Pdu`'s purely structural parse and owns the
//! decisions the original C `validate_statsd` made: reject non-finite
//! values, reject unknown types, reject a `|@` with nothing (or a
//! non-positive number) after it, and optionally reject point tags that
//! collide with a reserved name.

use std::convert::TryFrom;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use thiserror::Error;

use crate::proto::{MetricType, ParseError, Pdu};

/// Point tags use the `key=value` convention folded into the metric name,
/// e.g. `requests.__host=web01.count`. These ten names are reserved because
/// the relay itself (or downstream systems) assign them meaning.
const RESERVED_TAG_NAMES: &[&str] = &[
    "asg", "az", "backend", "canary", "host", "period", "region", "shard", "source", "window",
];

static POINT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__([A-Za-z0-9_]+)=").expect("static point-tag pattern is valid"));

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("structural parse error: {0}")]
    Structural(#[from] ParseError),
    #[error("value is not a finite number")]
    InvalidValue,
    #[error("sample rate must be a finite number greater than zero")]
    InvalidSampleRate,
    #[error("line uses reserved point tag '{0}'")]
    ReservedTagName(String),
}

/// The outcome of validating a line, mirroring the original
/// `validate_parsed_result_t`: the numeric value, the recognized type, and
/// the pre-sampling rate (defaulting to 1.0 when no `|@rate` is present).
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub value: f64,
    pub metric_type: MetricType,
    pub presampling_value: f64,
}

/// Validate a structurally-parsed PDU's value, type and sample rate, and
/// optionally reject lines using a reserved point-tag name.
pub fn validate(pdu: &Pdu, validate_point_tags: bool) -> Result<Parsed, ValidationError> {
    let value: f64 = parse_finite(pdu.value()).ok_or(ValidationError::InvalidValue)?;

    let metric_type = MetricType::try_from(pdu.metric_type_bytes())?;

    let presampling_value = match pdu.rate() {
        None => 1.0,
        Some(raw) => {
            let rate = parse_finite(raw).ok_or(ValidationError::InvalidSampleRate)?;
            if rate <= 0.0 || rate > 1.0 {
                return Err(ValidationError::InvalidSampleRate);
            }
            rate
        }
    };

    if validate_point_tags {
        if let Some(name) = reserved_tag_in_key(pdu.key()) {
            return Err(ValidationError::ReservedTagName(name));
        }
    }

    Ok(Parsed {
        value,
        metric_type,
        presampling_value,
    })
}

fn parse_finite(raw: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(raw).ok()?;
    let v: f64 = s.parse().ok()?;
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

/// Scan a key for `__name=` point tags and return the first one, if any,
/// that case-insensitively matches a reserved name.
fn reserved_tag_in_key(key: &[u8]) -> Option<String> {
    for cap in POINT_TAG_RE.captures_iter(key) {
        let name = cap.get(1)?.as_bytes();
        for reserved in RESERVED_TAG_NAMES {
            if name.eq_ignore_ascii_case(reserved.as_bytes()) {
                return Some(reserved.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn pdu(line: &'static [u8]) -> Pdu {
        Pdu::parse(Bytes::from_static(line)).unwrap()
    }

    #[test]
    fn accepts_plain_counter() {
        let p = validate(&pdu(b"foo.bar:3|c"), true).unwrap();
        assert_eq!(p.value, 3.0);
        assert_eq!(p.metric_type, MetricType::Counter);
        assert_eq!(p.presampling_value, 1.0);
    }

    #[test]
    fn accepts_sample_rate() {
        let p = validate(&pdu(b"foo.bar:3|c|@0.1"), true).unwrap();
        assert_eq!(p.presampling_value, 0.1);
    }

    #[test]
    fn rejects_non_numeric_value() {
        assert_eq!(
            validate(&pdu(b"foo.bar:notanumber|c"), true).unwrap_err(),
            ValidationError::InvalidValue
        );
    }

    #[test]
    fn rejects_nan_value() {
        assert_eq!(
            validate(&pdu(b"foo.bar:nan|c"), true).unwrap_err(),
            ValidationError::InvalidValue
        );
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(
            validate(&pdu(b"foo.bar:3|zz"), true).unwrap_err(),
            ValidationError::Structural(ParseError::InvalidType)
        ));
    }

    #[test]
    fn rejects_zero_sample_rate() {
        assert_eq!(
            validate(&pdu(b"foo.bar:3|c|@0"), true).unwrap_err(),
            ValidationError::InvalidSampleRate
        );
    }

    #[test]
    fn rejects_negative_sample_rate() {
        assert_eq!(
            validate(&pdu(b"foo.bar:3|c|@-1.0"), true).unwrap_err(),
            ValidationError::InvalidSampleRate
        );
    }

    #[test]
    fn rejects_sample_rate_above_one() {
        assert_eq!(
            validate(&pdu(b"foo.bar:3|c|@1.5"), true).unwrap_err(),
            ValidationError::InvalidSampleRate
        );
    }

    #[test]
    fn accepts_sample_rate_of_exactly_one() {
        let p = validate(&pdu(b"foo.bar:3|c|@1.0"), true).unwrap();
        assert_eq!(p.presampling_value, 1.0);
    }

    #[test]
    fn rejects_reserved_point_tag_case_insensitive() {
        assert_eq!(
            validate(&pdu(b"requests.__HOST=web01.count:1|c"), true).unwrap_err(),
            ValidationError::ReservedTagName("host".to_string())
        );
    }

    #[test]
    fn allows_reserved_point_tag_when_validation_disabled() {
        let p = validate(&pdu(b"requests.__host=web01.count:1|c"), false).unwrap();
        assert_eq!(p.value, 1.0);
    }

    #[test]
    fn allows_non_reserved_point_tag() {
        let p = validate(&pdu(b"requests.__env=prod.count:1|c"), true).unwrap();
        assert_eq!(p.value, 1.0);
    }

    #[test]
    fn all_seven_types_recognized() {
        for (line, ty) in [
            (&b"k:1|c"[..], MetricType::Counter),
            (b"k:1|ms", MetricType::Timer),
            (b"k:1|kv", MetricType::Kv),
            (b"k:1|g", MetricType::Gauge),
            (b"k:1|G", MetricType::DirectGauge),
            (b"k:1|h", MetricType::Histogram),
            (b"k:1|s", MetricType::Set),
        ] {
            let p = validate(&pdu(line), true).unwrap();
            assert_eq!(p.metric_type, ty);
        }
    }
}
