//! Configuration: a JSON value object deserialized with `serde_json`, mapping
//! directly onto the core's view of the world (servers, named backend
//! groups, routes between them): named backends plus a `route` list per
//! server, where a route target is either "statsd backend" or "monitor"
//! (self-stats).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::convert::{AsRef, TryFrom, TryInto};
use std::fmt;
use thiserror::Error;

use crate::backend::{Proto, DEFAULT_SEND_QUEUE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteType {
    /// Route into a regular, hash-sharded backend group.
    Statsd,
    /// Route into the self-stats monitor group (only ever targeted by the
    /// relay's own synthesized self-stats lines, never by client input).
    Monitor,
}

impl TryFrom<&str> for RouteType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "statsd" => Ok(RouteType::Statsd),
            "monitor" => Ok(RouteType::Monitor),
            _ => Err(Error::UnknownRouteType(value.to_string())),
        }
    }
}

impl From<&RouteType> for &str {
    fn from(t: &RouteType) -> Self {
        match t {
            RouteType::Statsd => "statsd",
            RouteType::Monitor => "monitor",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &str = self.into();
        write!(f, "{}", s)
    }
}

/// One entry of a server's `route` list: `"statsd:backend_name"` or
/// `"monitor:backend_name"`. The first `Statsd` route is the primary group;
/// any further `Statsd` routes are duplicate groups, fanned out to in list
/// order after the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub route_type: RouteType,
    pub route_to: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route_type, self.route_to)
    }
}

impl<'de> Deserialize<'de> for Route {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: &str = Deserialize::deserialize(deserializer)?;
        let parts: Vec<&str> = s.split(':').collect();
        if let [ty, to] = &parts[..] {
            Ok(Route {
                route_type: (*ty).try_into().map_err(serde::de::Error::custom)?,
                route_to: (*to).into(),
            })
        } else {
            Err(Error::MalformedRoute(s.to_string())).map_err(serde::de::Error::custom)
        }
    }
}

impl Serialize for Route {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}:{}", self.route_type, self.route_to).as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_send_queue() -> usize {
    DEFAULT_SEND_QUEUE
}

fn default_reconnect_threshold() -> f64 {
    1.0
}

fn default_reservoir_size() -> u32 {
    50
}

fn default_expiry_period_seconds() -> u64 {
    60
}

/// A backend group's optional sampler, mapping onto `sampler::Sampler::new`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SamplingConfig {
    pub threshold: u32,
    pub window_seconds: u32,
    #[serde(default = "default_reservoir_size")]
    pub reservoir_size: u32,
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default = "default_expiry_period_seconds")]
    pub expiry_period_seconds: u64,
}

/// A named backend group: a shard map (the ring) plus the optional
/// rewriting/filtering/sampling behaviors.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatsdBackendConfig {
    #[serde(default)]
    pub shard_map: Vec<String>,
    pub suffix: Option<String>,
    pub prefix: Option<String>,
    pub input_filter: Option<String>,
    #[serde(default = "default_max_send_queue")]
    pub max_send_queue: usize,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: f64,
    #[serde(default = "default_true")]
    pub tcp_cork: bool,
    pub sampling: Option<SamplingConfig>,
}

/// Parse one `shard_map` entry: `host:port` or `host:port:proto`
/// (`proto` defaults to `tcp`).
pub fn parse_shard_entry(entry: &str) -> Result<(String, u16, Proto), Error> {
    let parts: Vec<&str> = entry.split(':').collect();
    let (host, port, proto) = match parts.as_slice() {
        [host, port] => (*host, *port, Proto::Tcp),
        [host, port, "tcp"] => (*host, *port, Proto::Tcp),
        [host, port, "udp"] => (*host, *port, Proto::Udp),
        _ => return Err(Error::MalformedShardEntry(entry.to_string())),
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::MalformedShardEntry(entry.to_string()))?;
    Ok((host.to_string(), port, proto))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatsdServerConfig {
    pub bind: String,
    #[serde(default)]
    pub validate_point_tags: bool,
    pub route: Vec<Route>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatsdConfig {
    pub servers: HashMap<String, StatsdServerConfig>,
    pub backends: HashMap<String, StatsdBackendConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub admin: Option<AdminConfig>,
    pub statsd: StatsdConfig,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("malformed route {0}")]
    MalformedRoute(String),
    #[error("invalid route type {0}")]
    UnknownRouteType(String),
    #[error("invalid routing destination {0}")]
    UnknownRoutingDestination(Route),
    #[error("malformed shard map entry '{0}', expected host:port or host:port:proto")]
    MalformedShardEntry(String),
    #[error("backend '{0}' has max_send_queue=0")]
    ZeroSendQueue(String),
}

fn check_config_route(config: &Config) -> Result<(), Error> {
    for statsd in config.statsd.servers.values() {
        for route in statsd.route.iter() {
            config
                .statsd
                .backends
                .get(route.route_to.as_str())
                .ok_or_else(|| Error::UnknownRoutingDestination(route.clone()))?;
        }
    }
    Ok(())
}

fn check_config_shard_maps(config: &Config) -> Result<(), Error> {
    for backend in config.statsd.backends.values() {
        for entry in &backend.shard_map {
            parse_shard_entry(entry)?;
        }
    }
    Ok(())
}

/// Compile every backend's `input_filter` once at load time. A bad pattern
/// is fatal and aborts config load, rather than being discovered lazily on
/// the first line that would have hit the filter.
fn check_config_filters(config: &Config) -> anyhow::Result<()> {
    for backend in config.statsd.backends.values() {
        if let Some(pattern) = &backend.input_filter {
            crate::filter::Filter::new(pattern)?;
        }
    }
    Ok(())
}

fn check_config_send_queues(config: &Config) -> Result<(), Error> {
    for (name, backend) in config.statsd.backends.iter() {
        if backend.max_send_queue == 0 {
            return Err(Error::ZeroSendQueue(name.clone()));
        }
    }
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    check_config_route(config)?;
    check_config_shard_maps(config)?;
    check_config_send_queues(config)?;
    check_config_filters(config)?;
    Ok(())
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let input = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(input.as_ref())?;
    check_config(&config)?;
    Ok(config)
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_example_config() {
        let config = r#"
        {
            "statsd": {
                "servers": {
                    "default":
                        {
                            "bind": "127.0.0.1:8125",
                            "route": ["statsd:test1", "statsd:duplicate", "monitor:selfstats"]
                        }
                },
                "backends": {
                    "test1":
                       {
                            "prefix": "test-1.",
                            "shard_map": [
                                "127.0.0.1:8200"
                            ],
                            "suffix": ".suffix"
                        },
                    "duplicate":
                        {
                            "input_filter": "^dontmatchme",
                            "shard_map": ["127.0.0.1:8201", "127.0.0.1:8202:udp"],
                            "sampling": {
                                "threshold": 100,
                                "window_seconds": 10
                            }
                        },
                    "selfstats":
                        {
                            "shard_map": ["127.0.0.1:8300"]
                        }
                }
            }
        }
        "#;
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(config.as_bytes()).unwrap();
        let config = load(tf.path().to_str().unwrap()).unwrap();

        let default_server = config.statsd.servers.get("default").unwrap();
        assert_eq!(default_server.bind, "127.0.0.1:8125".to_string());
        assert_eq!(default_server.route.len(), 3);
        assert_eq!(default_server.route[2].route_type, RouteType::Monitor);

        let duplicate = config.statsd.backends.get("duplicate").unwrap();
        assert_eq!(duplicate.shard_map.len(), 2);
        assert_eq!(duplicate.sampling.as_ref().unwrap().threshold, 100);
        assert_eq!(duplicate.sampling.as_ref().unwrap().reservoir_size, 50);
    }

    #[test]
    fn rejects_unknown_routing_destination() {
        let config = r#"
        {
            "statsd": {
                "servers": { "default": { "bind": "127.0.0.1:8125", "route": ["statsd:missing"] } },
                "backends": {}
            }
        }
        "#;
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(config.as_bytes()).unwrap();
        assert!(load(tf.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_invalid_input_filter_pattern() {
        let config = r#"
        {
            "statsd": {
                "servers": { "default": { "bind": "127.0.0.1:8125", "route": ["statsd:bad"] } },
                "backends": { "bad": { "shard_map": ["127.0.0.1:8200"], "input_filter": "(unclosed" } }
            }
        }
        "#;
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(config.as_bytes()).unwrap();
        assert!(load(tf.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_zero_max_send_queue() {
        let config = r#"
        {
            "statsd": {
                "servers": { "default": { "bind": "127.0.0.1:8125", "route": ["statsd:bad"] } },
                "backends": { "bad": { "shard_map": ["127.0.0.1:8200"], "max_send_queue": 0 } }
            }
        }
        "#;
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(config.as_bytes()).unwrap();
        assert!(load(tf.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn parses_shard_entries() {
        assert_eq!(
            parse_shard_entry("host:1234").unwrap(),
            ("host".to_string(), 1234, Proto::Tcp)
        );
        assert_eq!(
            parse_shard_entry("host:1234:udp").unwrap(),
            ("host".to_string(), 1234, Proto::Udp)
        );
        assert!(parse_shard_entry("not-valid").is_err());
    }
}
