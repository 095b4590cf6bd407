extern crate jemallocator;

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use anyhow::Context;
use env_logger::Env;
use log::{debug, error, info, warn};
use structopt::StructOpt;
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};

use statsrelay::config::Config;
use statsrelay::supervisor::{InheritedFds, Supervisor};
use statsrelay::{admin, config, pidfile, stats};

const TCP_SD_ENV: &str = "STATSRELAY_LISTENER_TCP_SD";
const UDP_SD_ENV: &str = "STATSRELAY_LISTENER_UDP_SD";

#[derive(StructOpt, Debug)]
#[structopt(name = "statsrelay", about = "Statsd relay")]
struct Options {
    /// Path to the JSON configuration file.
    #[structopt(short = "c", long = "config", default_value = "/etc/statsrelay.json")]
    config: String,

    /// Load and validate the config at PATH, then exit without starting.
    #[structopt(short = "t", long = "check-config")]
    check_config: Option<String>,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Accepted for compatibility; this build always logs to stderr.
    #[structopt(short = "S", long = "no-syslog")]
    no_syslog: bool,

    #[structopt(short = "l", long = "log-level", default_value = "info")]
    log_level: String,

    /// Write the process id to PATH on startup and remove it on clean exit.
    #[structopt(short = "p", long = "pid")]
    pid: Option<String>,

    #[structopt(long = "threaded")]
    threaded: bool,
}

/// Parse a `name=fd` comma-separated handoff env var into a `name -> fd` map.
fn parse_sd_env(value: &str) -> HashMap<String, RawFd> {
    let mut out = HashMap::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((name, fd)) = entry.split_once('=') {
            if let Ok(fd) = fd.parse::<RawFd>() {
                out.insert(name.to_string(), fd);
            } else {
                warn!("ignoring malformed descriptor entry '{}' in hot-restart handoff", entry);
            }
        }
    }
    out
}

fn inherited_fds_from_env() -> InheritedFds {
    let tcp = std::env::var(TCP_SD_ENV).map(|v| parse_sd_env(&v)).unwrap_or_default();
    let udp = std::env::var(UDP_SD_ENV).map(|v| parse_sd_env(&v)).unwrap_or_default();

    let mut merged: InheritedFds = HashMap::new();
    for (name, fd) in tcp {
        merged.entry(name).or_insert((None, None)).0 = Some(fd);
    }
    for (name, fd) in udp {
        merged.entry(name).or_insert((None, None)).1 = Some(fd);
    }
    if !merged.is_empty() {
        info!("inherited {} listener(s) from a hot restart", merged.len());
    }
    merged
}

/// Clear `FD_CLOEXEC` on `fd` so it survives into a child spawned with
/// `std::process::Command`. Safe to leave cleared: this process is about to
/// hand off and exit, so there's no other child that could pick up a leaked
/// descriptor by accident.
fn clear_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}

/// Handle SIGUSR2: spawn a replacement process, handing it our bound
/// listener descriptors via `STATSRELAY_LISTENER_TCP_SD`/`_UDP_SD`, matching
/// argv and environment otherwise. The caller is responsible for shutting
/// this instance down afterward; the two processes briefly overlap, the new
/// one serving from the inherited sockets while this one drains in-flight
/// sessions.
fn spawn_hot_restart_child(supervisor: &Supervisor) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolving current executable path")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut tcp_entries = Vec::new();
    let mut udp_entries = Vec::new();
    for (name, (tcp_fd, udp_fd)) in supervisor.listener_fds() {
        clear_cloexec(*tcp_fd);
        clear_cloexec(*udp_fd);
        tcp_entries.push(format!("{}={}", name, tcp_fd));
        udp_entries.push(format!("{}={}", name, udp_fd));
    }

    let mut command = std::process::Command::new(exe);
    command.args(&args);
    command.env(TCP_SD_ENV, tcp_entries.join(","));
    command.env(UDP_SD_ENV, udp_entries.join(","));

    let child = command.spawn().context("spawning hot-restart replacement process")?;
    info!("spawned hot-restart replacement process, pid {}", child.id());
    Ok(())
}

/// Drives one running instance until a shutdown-triggering signal arrives.
async fn run(config: Config, collector: stats::Collector, inherited: InheritedFds) {
    let supervisor = match Supervisor::spawn(&config, &collector, &inherited) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to start supervisor: {:#}", e);
            return;
        }
    };

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install sigterm handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install sigint handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("failed to install sigusr2 handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received sigterm, shutting down gracefully"),
        _ = sigint.recv() => info!("received sigint, shutting down immediately"),
        _ = sigusr2.recv() => {
            info!("received sigusr2, starting hot restart");
            if let Err(e) = spawn_hot_restart_child(&supervisor) {
                error!("hot restart failed: {:#}", e);
            }
        }
    }

    supervisor.shutdown().await;
}

fn main() -> anyhow::Result<()> {
    let opts = Options::from_args();

    let default_level = if opts.verbose { "debug" } else { opts.log_level.as_str() };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();
    if opts.no_syslog {
        debug!("--no-syslog set; this build only ever logs to stderr");
    }

    info!(
        "statsrelay loading - {} - {}",
        statsrelay::built_info::PKG_VERSION,
        statsrelay::built_info::GIT_COMMIT_HASH.unwrap_or("unknown")
    );

    if let Some(check_path) = &opts.check_config {
        return match config::load(check_path) {
            Ok(_) => {
                info!("configuration at {} is valid", check_path);
                Ok(())
            }
            Err(e) => {
                eprintln!("configuration error: {:#}", e);
                std::process::exit(1);
            }
        };
    }

    let config = config::load(opts.config.as_ref()).with_context(|| format!("can't load config file from {}", opts.config))?;
    info!("loaded config file {}", opts.config);
    debug!("servers defined: {:?}", config.statsd.servers.keys().collect::<Vec<_>>());

    if let Some(pid_path) = &opts.pid {
        pidfile::write_pid(pid_path).with_context(|| format!("can't write pid file {}", pid_path))?;
    }

    let inherited = inherited_fds_from_env();

    let collector = stats::Collector::default();
    if let Some(admin_cfg) = &config.admin {
        admin::spawn_admin_server(admin_cfg.port, collector.clone());
        info!("spawned admin server on port {}", admin_cfg.port);
    }

    let mut builder = if opts.threaded {
        runtime::Builder::new_multi_thread()
    } else {
        runtime::Builder::new_current_thread()
    };
    let runtime = builder.enable_all().build()?;
    info!("tokio runtime built, threaded: {}", opts.threaded);

    runtime.block_on(run(config, collector, inherited));
    drop(runtime);

    if let Some(pid_path) = &opts.pid {
        if let Err(e) = pidfile::remove_pid(pid_path) {
            warn!("failed to remove pid file {}: {}", pid_path, e);
        }
    }

    info!("runtime terminated");
    Ok(())
}
