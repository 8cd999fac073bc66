//! Drop/accept counters for the verifier stack.
//!
//! Counters are plain relaxed atomics rendered as Prometheus text.  The
//! optional listener answers `GET /metrics` on a configured address; it is
//! advisory plumbing and never gates packet processing.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Counter set shared across the registration server, heartbeat verifier,
/// and sweeper.
#[derive(Debug, Default)]
pub struct Metrics {
    beats_accepted_total: AtomicU64,
    beats_malformed_total: AtomicU64,
    beats_unknown_node_total: AtomicU64,
    beats_auth_mismatch_total: AtomicU64,
    beats_chain_mismatch_total: AtomicU64,
    beats_replay_total: AtomicU64,
    beats_skip_total: AtomicU64,
    store_errors_total: AtomicU64,
    registrations_total: AtomicU64,
    registrations_rejected_total: AtomicU64,
    nodes_dead_total: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        /// Increments the counter.
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        /// Current counter value.
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_beats_accepted, beats_accepted, beats_accepted_total);
    counter!(inc_beats_malformed, beats_malformed, beats_malformed_total);
    counter!(inc_beats_unknown_node, beats_unknown_node, beats_unknown_node_total);
    counter!(inc_beats_auth_mismatch, beats_auth_mismatch, beats_auth_mismatch_total);
    counter!(inc_beats_chain_mismatch, beats_chain_mismatch, beats_chain_mismatch_total);
    counter!(inc_beats_replay, beats_replay, beats_replay_total);
    counter!(inc_beats_skip, beats_skip, beats_skip_total);
    counter!(inc_store_errors, store_errors, store_errors_total);
    counter!(inc_registrations, registrations, registrations_total);
    counter!(
        inc_registrations_rejected,
        registrations_rejected,
        registrations_rejected_total
    );
    counter!(inc_nodes_dead, nodes_dead, nodes_dead_total);

    /// Renders all counters as Prometheus exposition text.
    pub fn render(&self) -> String {
        let pairs = [
            ("beats_accepted_total", self.beats_accepted()),
            ("beats_malformed_total", self.beats_malformed()),
            ("beats_unknown_node_total", self.beats_unknown_node()),
            ("beats_auth_mismatch_total", self.beats_auth_mismatch()),
            ("beats_chain_mismatch_total", self.beats_chain_mismatch()),
            ("beats_replay_total", self.beats_replay()),
            ("beats_skip_total", self.beats_skip()),
            ("store_errors_total", self.store_errors()),
            ("registrations_total", self.registrations()),
            ("registrations_rejected_total", self.registrations_rejected()),
            ("nodes_dead_total", self.nodes_dead()),
        ];
        let mut out = String::new();
        for (name, value) in pairs {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

/// Serves `GET /metrics` until the listener errors or the task is dropped.
pub async fn run_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (mut stream, _) = listener.accept().await?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = respond_with_metrics(&mut stream, metrics).await {
                eprintln!("metrics connection error: {err}");
            }
        });
    }
}

async fn respond_with_metrics(
    stream: &mut tokio::net::TcpStream,
    metrics: Arc<Metrics>,
) -> io::Result<()> {
    let mut buf = [0u8; 1024];
    let mut read = 0usize;
    loop {
        if read == buf.len() {
            break;
        }
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
        if read >= 4 && &buf[read - 4..read] == b"\r\n\r\n" {
            break;
        }
    }

    let request = std::str::from_utf8(&buf[..read]).unwrap_or("");
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/metrics");

    if path != "/" && path != "/metrics" {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return stream.shutdown().await;
    }

    let body = metrics.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reflects_increments() {
        let metrics = Metrics::new();
        metrics.inc_beats_accepted();
        metrics.inc_beats_accepted();
        metrics.inc_beats_replay();
        let text = metrics.render();
        assert!(text.contains("beats_accepted_total 2"));
        assert!(text.contains("beats_replay_total 1"));
        assert!(text.contains("nodes_dead_total 0"));
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_counters() {
        let metrics = Arc::new(Metrics::new());
        metrics.inc_registrations();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Drive one connection through the response path directly.
        let server = {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                respond_with_metrics(&mut stream, metrics).await.unwrap();
            })
        };
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        server.await.unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("200 OK"));
        assert!(text.contains("registrations_total 1"));
    }
}
