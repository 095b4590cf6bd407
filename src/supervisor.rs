//! Supervisor glue: turns a loaded `config::Config` into running listeners.
//!
//! Builds the process-wide backend registry, the per-group rings/filters/
//! samplers, and one `RelayCore` per configured server, then spawns the TCP
//! and UDP listener tasks (every server binds both protocols on the same
//! address) plus the periodic self-stats/sampler tick.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use stream_cancel::{Trigger, Tripwire};

use crate::backend::{Backend, BackendConfig, Proto};
use crate::config::{self, Config, RouteType, StatsdBackendConfig};
use crate::filter::Filter;
use crate::group::BackendGroup;
use crate::hash::Ring;
use crate::listener;
use crate::relay::RelayCore;
use crate::sampler::Sampler;
use crate::stats;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Quiet-wait between tripping shutdown and giving up on outstanding tasks,
/// matching the ~5s wait in the hot-restart/SIGTERM sequence.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Get-or-spawn a backend by its canonical `host:port:proto` key, so two
/// groups whose shard maps name the same destination share one connection.
fn get_or_create_backend(
    registry: &mut HashMap<String, Backend>,
    host: String,
    port: u16,
    proto: Proto,
    backend_config: &BackendConfig,
    scope: &stats::Scope,
) -> Backend {
    let key = format!("{}:{}:{}", host, port, proto);
    if let Some(existing) = registry.get(&key) {
        return existing.clone();
    }
    let escaped_key = key.replace(|c: char| c == ':' || c == '.', "_");
    let backend_scope = scope.scope("backend").scope(&escaped_key);
    let backend = Backend::spawn(host, port, proto, backend_config.clone(), backend_scope);
    registry.insert(key, backend.clone());
    backend
}

fn build_ring(
    cfg: &StatsdBackendConfig,
    registry: &mut HashMap<String, Backend>,
    scope: &stats::Scope,
) -> anyhow::Result<Ring<Backend>> {
    let backend_config = BackendConfig {
        max_send_queue: cfg.max_send_queue,
        auto_reconnect: cfg.auto_reconnect,
        reconnect_threshold: cfg.reconnect_threshold,
    };

    let mut ring = Ring::new();
    for entry in &cfg.shard_map {
        let (host, port, proto) = config::parse_shard_entry(entry)?;
        ring.push(get_or_create_backend(registry, host, port, proto, &backend_config, scope));
    }
    Ok(ring)
}

fn build_group(
    cfg: &StatsdBackendConfig,
    registry: &mut HashMap<String, Backend>,
    scope: &stats::Scope,
) -> anyhow::Result<BackendGroup> {
    let ring = build_ring(cfg, registry, scope)?;
    let filter = cfg.input_filter.as_deref().map(Filter::new).transpose()?;
    let sampler = cfg.sampling.as_ref().map(|s| {
        Sampler::new(
            s.threshold,
            s.window_seconds,
            s.reservoir_size,
            s.ttl_seconds,
            s.expiry_period_seconds,
        )
    });
    Ok(BackendGroup::new(ring, cfg.prefix.clone(), cfg.suffix.clone(), filter, sampler))
}

/// Resolve one server's route list into a primary group, its duplicates, and
/// an optional monitor group, building every backend group along the way.
/// The first `statsd` route is the primary; later `statsd` routes are
/// duplicates, fanned out after it in list order.
/// A second `monitor` route is a config mistake; it's logged and ignored
/// rather than treated as fatal, since self-stats are a nicety, not the data
/// plane.
fn build_relay_core(
    server_name: &str,
    server_config: &config::StatsdServerConfig,
    config: &Config,
    registry: &mut HashMap<String, Backend>,
    scope: &stats::Scope,
) -> anyhow::Result<RelayCore> {
    let mut primary: Option<BackendGroup> = None;
    let mut duplicates = Vec::new();
    let mut monitor: Option<BackendGroup> = None;

    for route in &server_config.route {
        let backend_cfg = config
            .statsd
            .backends
            .get(route.route_to.as_str())
            .ok_or_else(|| anyhow::anyhow!("server '{}' routes to unknown backend '{}'", server_name, route.route_to))?;
        let group = build_group(backend_cfg, registry, scope)?;
        match route.route_type {
            RouteType::Statsd => {
                if primary.is_none() {
                    primary = Some(group);
                } else {
                    duplicates.push(group);
                }
            }
            RouteType::Monitor => {
                if monitor.is_some() {
                    warn!("server '{}' has more than one monitor route; keeping the first", server_name);
                } else {
                    monitor = Some(group);
                }
            }
        }
    }

    let primary = primary.unwrap_or_else(|| BackendGroup::new(Ring::new(), None, None, None, None));
    let registry_snapshot = registry.clone();
    Ok(RelayCore::new(
        primary,
        duplicates,
        monitor,
        registry_snapshot,
        server_config.validate_point_tags,
    ))
}

/// Descriptors inherited from a parent process across a SIGUSR2 hot restart,
/// keyed by server name: `(tcp_fd, udp_fd)`, either of which may be absent if
/// that protocol's handoff env var didn't name this server.
pub type InheritedFds = HashMap<String, (Option<RawFd>, Option<RawFd>)>;

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Spawn the recurring self-stats flush and sampler tick for one server's
/// relay core. Both run off a single 1-second timer; `tick_samplers` is
/// internally due-gated per group, so groups with longer windows simply
/// no-op on most ticks.
fn spawn_ticks(relay: Arc<RelayCore>, tripwire: Tripwire) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = tripwire.clone() => return,
                _ = interval.tick() => {
                    relay.flush_self_stats();
                    relay.tick_samplers(unix_now());
                }
            }
        }
    })
}

/// A running instance: every listener, tick and backend task spawned from
/// one config, plus the shared trigger that tells all of them to stop.
pub struct Supervisor {
    trigger: Trigger,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    server_names: Vec<String>,
    listener_fds: HashMap<String, (RawFd, RawFd)>,
}

impl Supervisor {
    /// Build and spawn everything named in `config`. Each server's TCP and
    /// UDP sockets are bound synchronously here (rather than inside their
    /// accept/receive loops) so their raw descriptors can be recorded before
    /// the sockets are handed off to a task; `inherited` supplies descriptors
    /// carried over a SIGUSR2 hot restart in place of a fresh bind, keyed by
    /// server name.
    pub fn spawn(config: &Config, collector: &stats::Collector, inherited: &InheritedFds) -> anyhow::Result<Supervisor> {
        let (trigger, tripwire) = Tripwire::new();
        let mut registry: HashMap<String, Backend> = HashMap::new();
        let mut tasks = Vec::new();
        let mut server_names = Vec::new();
        let mut listener_fds = HashMap::new();

        let root_scope = collector.scope("statsrelay").scope("statsd_server");

        for (server_name, server_config) in config.statsd.servers.iter() {
            let scope = root_scope.scope(server_name);
            let relay = Arc::new(build_relay_core(server_name, server_config, config, &mut registry, &scope)?);

            let bind = server_config.bind.clone();
            let (inherited_tcp, inherited_udp) = inherited.get(server_name).copied().unwrap_or((None, None));

            let tcp_listener = listener::bind_tcp(&bind, inherited_tcp)
                .map_err(|e| anyhow::anyhow!("server '{}' failed to bind tcp {}: {}", server_name, bind, e))?;
            let udp_socket = listener::bind_udp(&bind, inherited_udp)
                .map_err(|e| anyhow::anyhow!("server '{}' failed to bind udp {}: {}", server_name, bind, e))?;
            listener_fds.insert(server_name.clone(), (tcp_listener.as_raw_fd(), udp_socket.as_raw_fd()));

            let tcp_core = relay.clone();
            let tcp_scope = scope.scope("tcp");
            let tcp_bind = bind.clone();
            let tcp_tripwire = tripwire.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = listener::run_tcp(tcp_core, tcp_scope, tcp_listener, tcp_bind, tcp_tripwire).await {
                    warn!("tcp listener failed: {}", e);
                }
            }));

            let udp_core = relay.clone();
            let udp_scope = scope.scope("udp");
            let udp_bind = bind.clone();
            let udp_tripwire = tripwire.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = listener::run_udp(udp_core, udp_scope, udp_socket, udp_bind, udp_tripwire).await {
                    warn!("udp listener failed: {}", e);
                }
            }));

            tasks.push(spawn_ticks(relay, tripwire.clone()));
            server_names.push(server_name.clone());
        }

        info!("supervisor started {} server(s): {:?}", server_names.len(), server_names);

        Ok(Supervisor {
            trigger,
            tasks,
            server_names,
            listener_fds,
        })
    }

    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    /// Raw `(tcp_fd, udp_fd)` per server, for a caller preparing a SIGUSR2
    /// hot-restart handoff to a freshly exec'd process.
    pub fn listener_fds(&self) -> &HashMap<String, (RawFd, RawFd)> {
        &self.listener_fds
    }

    /// Trip the shared cancellation signal (stop accepting, close sessions
    /// with a goodbye line) and wait up to `SHUTDOWN_GRACE` for the spawned
    /// tasks to notice and exit on their own, mirroring the hot-restart/
    /// SIGTERM sequence's `stop_accepting` -> `shutdown_sessions` -> quiet
    /// wait -> `destroy` steps, collapsed since every listener here shares a
    /// single tripwire rather than being stepped individually.
    pub async fn shutdown(self) {
        self.trigger.cancel();
        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        for task in self.tasks {
            tokio::select! {
                _ = task => {}
                _ = &mut deadline => {
                    warn!("shutdown grace period elapsed with tasks still running");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(json.as_bytes()).unwrap();
        tf
    }

    #[tokio::test]
    async fn spawn_starts_one_listener_pair_per_server() {
        let json = r#"
        {
            "statsd": {
                "servers": {
                    "default": { "bind": "127.0.0.1:0", "route": ["statsd:only"] }
                },
                "backends": {
                    "only": { "shard_map": ["127.0.0.1:9"] }
                }
            }
        }
        "#;
        let tf = write_config(json);
        let config = config::load(tf.path().to_str().unwrap()).unwrap();
        let collector = stats::Collector::default();
        let supervisor = Supervisor::spawn(&config, &collector, &InheritedFds::new()).unwrap();
        assert_eq!(supervisor.server_names(), &["default".to_string()]);
        assert!(supervisor.listener_fds().contains_key("default"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_rejects_unknown_backend_reference() {
        // `config::load` already rejects this at the JSON level, so build a
        // `Config` value directly to exercise `Supervisor::spawn`'s own check.
        let json = r#"
        {
            "statsd": {
                "servers": { "default": { "bind": "127.0.0.1:0", "route": ["statsd:known"] } },
                "backends": { "known": { "shard_map": ["127.0.0.1:9"] } }
            }
        }
        "#;
        let tf = write_config(json);
        let mut config = config::load(tf.path().to_str().unwrap()).unwrap();
        config
            .statsd
            .servers
            .get_mut("default")
            .unwrap()
            .route
            .push(config::Route {
                route_type: config::RouteType::Statsd,
                route_to: "missing".to_string(),
            });
        let collector = stats::Collector::default();
        assert!(Supervisor::spawn(&config, &collector, &InheritedFds::new()).is_err());
    }
}
