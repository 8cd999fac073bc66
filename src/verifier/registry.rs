//! TCP anchor registration server.
//!
//! Connection-per-request: a node connects, sends `node_id|anchor_hex`,
//! and waits for `ACK` or `NACK` on the same connection.  Each connection
//! is handled by its own task and holds no state beyond the upsert it
//! performs through [`SwarmState::register`].

use crate::clock::epoch_now;
use crate::metrics::Metrics;
use crate::proto::{parse_registration, ACK, NACK};
use crate::verifier::cache::SwarmState;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

/// Read deadline for one registration request.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest registration request accepted.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Accept loop: one task per connection until shutdown flips.
pub async fn run_registry(
    listener: TcpListener,
    state: Arc<SwarmState>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        eprintln!("PULSE|mod=REG|evt=ACCEPT_ERROR|err={err}");
                        continue;
                    }
                };
                let state = state.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_registration(stream, &state, &metrics).await {
                        eprintln!("PULSE|mod=REG|evt=CONN_ERROR|peer={peer}|err={err}");
                    }
                });
            }
        }
    }
}

/// Reads one request, registers the node, and replies `ACK`/`NACK`.
async fn handle_registration(
    mut stream: TcpStream,
    state: &SwarmState,
    metrics: &Metrics,
) -> std::io::Result<()> {
    let deadline = Instant::now() + READ_TIMEOUT;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];

    // The client keeps the connection open awaiting the reply, so there is
    // no EOF to read to; accumulate until the request parses, the peer
    // closes, or the deadline passes.
    let parsed = loop {
        match parse_registration(&buf) {
            Ok(parsed) => break Some(parsed),
            Err(_) if buf.len() >= MAX_REQUEST_BYTES => break None,
            Err(_) => {}
        }
        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break parse_registration(&buf).ok(),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => return Err(err),
            Err(_) => break parse_registration(&buf).ok(),
        }
    };

    let Some((node_id, anchor)) = parsed else {
        metrics.inc_registrations_rejected();
        eprintln!(
            "PULSE|mod=REG|evt=REJECT|reason={}",
            match parse_registration(&buf) {
                Err(err) => err.to_string(),
                Ok(_) => "oversized request".to_string(),
            }
        );
        stream.write_all(NACK).await?;
        return stream.shutdown().await;
    };

    match state.register(&node_id, &anchor, epoch_now()) {
        Ok(()) => {
            metrics.inc_registrations();
            println!(
                "PULSE|mod=REG|evt=ACCEPT|node={node_id}|anchor={}",
                &hex::encode(anchor)[..16]
            );
            stream.write_all(ACK).await?;
        }
        Err(err) => {
            metrics.inc_registrations_rejected();
            eprintln!("PULSE|mod=REG|evt=STORE_ERROR|node={node_id}|err={err}");
            stream.write_all(NACK).await?;
        }
    }
    stream.shutdown().await
}
