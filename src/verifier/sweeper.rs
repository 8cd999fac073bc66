//! Liveness sweeper.
//!
//! Once per second, nodes silent past the dead timeout flip to DEAD and a
//! best-effort `NODE_DEAD|<node_id>` datagram goes to the configured sink.
//! The notification is advisory: send failures are logged and swallowed,
//! and nothing is retried.

use crate::clock::epoch_now;
use crate::metrics::Metrics;
use crate::verifier::cache::SwarmState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

/// Interval between sweeper passes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Runs sweep ticks until shutdown flips.
pub async fn run_sweeper(
    state: Arc<SwarmState>,
    dead_timeout: f64,
    notify_addr: Option<SocketAddr>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let notify_socket = match notify_addr {
        Some(_) => match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => Some(socket),
            Err(err) => {
                eprintln!("PULSE|mod=SWEEP|evt=NOTIFY_BIND_ERROR|err={err}");
                None
            }
        },
        None => None,
    };

    let mut ticker = time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                sweep_tick(
                    &state,
                    epoch_now(),
                    dead_timeout,
                    notify_addr,
                    notify_socket.as_ref(),
                    &metrics,
                )
                .await;
            }
        }
    }
}

/// One sweeper pass at time `now`.
pub(crate) async fn sweep_tick(
    state: &SwarmState,
    now: f64,
    dead_timeout: f64,
    notify_addr: Option<SocketAddr>,
    notify_socket: Option<&UdpSocket>,
    metrics: &Metrics,
) {
    let outcome = state.sweep(now, dead_timeout);
    for _ in 0..outcome.store_errors {
        metrics.inc_store_errors();
    }
    if outcome.store_errors > 0 {
        eprintln!(
            "PULSE|mod=SWEEP|evt=STORE_ERROR|pending={}",
            outcome.store_errors
        );
    }
    for node_id in outcome.dead {
        metrics.inc_nodes_dead();
        let silent = state
            .get(&node_id)
            .map(|s| now - s.last_ts)
            .unwrap_or(0.0);
        println!("PULSE|mod=SWEEP|evt=DEAD|node={node_id}|silent_s={silent:.1}");
        if let (Some(addr), Some(socket)) = (notify_addr, notify_socket) {
            let message = format!("NODE_DEAD|{node_id}");
            if let Err(err) = socket.send_to(message.as_bytes(), addr).await {
                eprintln!("PULSE|mod=SWEEP|evt=NOTIFY_ERROR|node={node_id}|err={err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HashChain;
    use crate::proto::HeartbeatFrame;
    use crate::store::{MemoryStore, NodeStatus};
    use crate::verifier::heartbeat::verify_datagram;

    const NODE: &str = "SN000001";

    #[tokio::test]
    async fn silent_node_goes_dead_and_notifies() {
        let chain = HashChain::generate(5).unwrap();
        let state = SwarmState::new(Arc::new(MemoryStore::new()));
        state.register(NODE, chain.anchor(), 0.0).unwrap();
        let datagram = HeartbeatFrame::encode(NODE, 100.0, 1, chain.reveal(1).unwrap());
        verify_datagram(&datagram, &state, 100.0);

        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let metrics = Metrics::new();

        // dead_timeout_s + 1 past the last beat.
        sweep_tick(
            &state,
            108.0,
            7.0,
            Some(sink_addr),
            Some(&sender),
            &metrics,
        )
        .await;

        assert_eq!(state.get(NODE).unwrap().status, NodeStatus::Dead);
        assert_eq!(metrics.nodes_dead(), 1);

        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sink.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"NODE_DEAD|SN000001");
    }

    #[tokio::test]
    async fn fresh_node_survives_the_tick() {
        let chain = HashChain::generate(5).unwrap();
        let state = SwarmState::new(Arc::new(MemoryStore::new()));
        state.register(NODE, chain.anchor(), 0.0).unwrap();
        let datagram = HeartbeatFrame::encode(NODE, 100.0, 1, chain.reveal(1).unwrap());
        verify_datagram(&datagram, &state, 100.0);

        let metrics = Metrics::new();
        sweep_tick(&state, 104.0, 7.0, None, None, &metrics).await;
        assert_eq!(state.get(NODE).unwrap().status, NodeStatus::Alive);
        assert_eq!(metrics.nodes_dead(), 0);
    }

    #[tokio::test]
    async fn dead_is_reported_once() {
        let chain = HashChain::generate(5).unwrap();
        let state = SwarmState::new(Arc::new(MemoryStore::new()));
        state.register(NODE, chain.anchor(), 0.0).unwrap();
        let datagram = HeartbeatFrame::encode(NODE, 100.0, 1, chain.reveal(1).unwrap());
        verify_datagram(&datagram, &state, 100.0);

        let metrics = Metrics::new();
        sweep_tick(&state, 110.0, 7.0, None, None, &metrics).await;
        sweep_tick(&state, 120.0, 7.0, None, None, &metrics).await;
        assert_eq!(metrics.nodes_dead(), 1);
    }
}
