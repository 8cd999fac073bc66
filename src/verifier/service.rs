//! Coordinator runtime: wires the registration server, heartbeat
//! verifier, and sweeper over one shared state cache and runs them until
//! Ctrl+C.

use crate::metrics::{run_metrics_server, Metrics};
use crate::store::{StateStore, StoreError};
use crate::verifier::cache::SwarmState;
use crate::verifier::heartbeat::run_heartbeat_listener;
use crate::verifier::registry::run_registry;
use crate::verifier::sweeper::run_sweeper;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::{signal, time};

/// Grace period granted to the service loops on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Coordinator-side configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interface both listeners bind.
    pub bind_ip: IpAddr,
    /// Registration port.
    pub tcp_port: u16,
    /// Heartbeat port.
    pub udp_port: u16,
    /// Seconds of silence before a node is declared DEAD.
    pub dead_timeout: f64,
    /// Emit interval the fleet is deployed with; used only to validate
    /// `dead_timeout` against the one-skip tolerance.
    pub emit_interval: f64,
    /// Optional sink for `NODE_DEAD` notifications.
    pub notify_addr: Option<SocketAddr>,
    /// Optional `/metrics` listener address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 5007,
            udp_port: 5008,
            dead_timeout: 7.0,
            emit_interval: 1.0,
            notify_addr: None,
            metrics_addr: None,
        }
    }
}

impl CoordinatorConfig {
    /// Rejects configurations whose timeout would declare DEAD a node
    /// that merely used its one allowed skip.
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.dead_timeout <= 2.0 * self.emit_interval {
            return Err(CoordError::Config(format!(
                "dead timeout {}s must exceed twice the emit interval {}s",
                self.dead_timeout, self.emit_interval
            )));
        }
        Ok(())
    }
}

/// Errors surfaced by the Coordinator runtime.
#[derive(Debug)]
pub enum CoordError {
    /// Invalid configuration.
    Config(String),
    /// Socket setup failure.
    Io(String),
    /// Store failure during startup preload.
    Store(String),
}

impl std::fmt::Display for CoordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Store(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for CoordError {}

impl From<StoreError> for CoordError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Starts the verifier stack and runs until Ctrl+C.
///
/// Preloads the cache from the store, binds the registration and
/// heartbeat sockets, spawns the three service loops (plus the optional
/// metrics listener), and on shutdown flips a shared watch flag so every
/// loop drains within a bounded grace period.
pub async fn run_coordinator(
    cfg: CoordinatorConfig,
    store: Arc<dyn StateStore>,
) -> Result<(), CoordError> {
    cfg.validate()?;
    let state = Arc::new(SwarmState::new(store));
    let preloaded = state.preload()?;
    println!("PULSE|mod=COORD|evt=PRELOAD|nodes={preloaded}");

    let tcp_addr = SocketAddr::new(cfg.bind_ip, cfg.tcp_port);
    let udp_addr = SocketAddr::new(cfg.bind_ip, cfg.udp_port);
    let listener = TcpListener::bind(tcp_addr)
        .await
        .map_err(|err| CoordError::Io(format!("failed to bind TCP {tcp_addr}: {err}")))?;
    let socket = UdpSocket::bind(udp_addr)
        .await
        .map_err(|err| CoordError::Io(format!("failed to bind UDP {udp_addr}: {err}")))?;

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = cfg.metrics_addr {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = run_metrics_server(addr, metrics).await {
                eprintln!("metrics server error: {err}");
            }
        });
        println!("PULSE|mod=METRICS|evt=LISTEN|addr={addr}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_registry(
        listener,
        state.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_heartbeat_listener(
        socket,
        state.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_sweeper(
        state.clone(),
        cfg.dead_timeout,
        cfg.notify_addr,
        metrics.clone(),
        shutdown_rx,
    )));

    println!(
        "PULSE|mod=COORD|evt=LISTEN|tcp={tcp_addr}|udp={udp_addr}|dead_timeout_s={}",
        cfg.dead_timeout
    );

    signal::ctrl_c()
        .await
        .map_err(|err| CoordError::Io(err.to_string()))?;
    println!("PULSE|mod=COORD|evt=SHUTDOWN");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = time::timeout(SHUTDOWN_GRACE, task).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn timeout_inside_skip_tolerance_is_rejected() {
        let cfg = CoordinatorConfig {
            dead_timeout: 2.0,
            emit_interval: 1.0,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CoordError::Config(_))));
    }
}
