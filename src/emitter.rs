//! Node-side heartbeat emitter.
//!
//! Lifecycle: bootstrap a chain (load the on-disk artifacts or generate
//! fresh ones), register the anchor with the Coordinator over TCP, then
//! emit one beat per interval from a single cooperative loop until the
//! chain is spent or a stop signal lands.  A chain is consumed once; a
//! node that outlives its chain must re-register with a fresh one.

use crate::chain::{ChainError, HashChain, CHAIN_FILE};
use crate::clock::epoch_now;
use crate::proto::{encode_registration, HeartbeatFrame, ACK};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time;

/// Network deadline for the registration exchange.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Emitter configuration.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// This node's identifier.
    pub node_id: String,
    /// Coordinator address.
    pub coordinator: IpAddr,
    /// Coordinator registration port.
    pub tcp_port: u16,
    /// Coordinator heartbeat port.
    pub udp_port: u16,
    /// Sleep between beats.
    pub interval: Duration,
    /// Directory holding the chain artifacts.
    pub chain_dir: PathBuf,
    /// Beats per freshly generated chain.
    pub chain_length: usize,
    /// Print chain points at generation.
    pub debug: bool,
}

/// Errors surfaced by the emitter.
#[derive(Debug)]
pub enum EmitterError {
    /// Chain generation or loading failed.
    Chain(ChainError),
    /// The Coordinator did not acknowledge the anchor.
    Registration(String),
    /// Socket setup failure.
    Io(String),
}

impl std::fmt::Display for EmitterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chain(err) => write!(f, "{err}"),
            Self::Registration(msg) => write!(f, "registration failed: {msg}"),
            Self::Io(msg) => write!(f, "emitter I/O error: {msg}"),
        }
    }
}

impl std::error::Error for EmitterError {}

impl From<ChainError> for EmitterError {
    fn from(err: ChainError) -> Self {
        Self::Chain(err)
    }
}

/// How an emit loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterOutcome {
    /// Every beat was spent; the node must re-register to continue.
    ChainExhausted,
    /// A stop signal or send error ended the loop early.
    Stopped,
}

/// Loads the chain artifacts from `dir`, generating a fresh chain if none
/// exist yet.
pub fn bootstrap_chain(dir: &Path, length: usize, debug: bool) -> Result<HashChain, ChainError> {
    let chain_file = dir.join(CHAIN_FILE);
    if chain_file.exists() {
        let chain = HashChain::load(&chain_file)?;
        println!(
            "PULSE|mod=EMIT|evt=CHAIN_LOADED|length={}|anchor={}",
            chain.length(),
            &hex::encode(chain.anchor())[..16]
        );
        return Ok(chain);
    }
    let chain = HashChain::generate(length)?;
    chain.write_artifacts(dir)?;
    println!(
        "PULSE|mod=EMIT|evt=CHAIN_GENERATED|length={}|anchor={}",
        chain.length(),
        &hex::encode(chain.anchor())[..16]
    );
    if debug {
        let n = chain.length();
        // reveal(n - k) is x_k; show the seed end of the chain plus the anchor.
        for k in 0..=n.min(5) {
            if let Some(point) = chain.reveal(n - k) {
                println!("PULSE|mod=EMIT|evt=CHAIN_POINT|k={k}|x={}", hex::encode(point));
            }
        }
        if n > 5 {
            println!(
                "PULSE|mod=EMIT|evt=CHAIN_POINT|k={n}|x={}",
                hex::encode(chain.anchor())
            );
        }
    }
    Ok(chain)
}

/// Registers the anchor over TCP and waits for the literal `ACK`.
///
/// `NACK`, a short read, or a timeout all fail registration; the caller
/// treats that as fatal.
pub async fn register_anchor(
    cfg: &EmitterConfig,
    anchor: &crate::chain::ChainDigest,
) -> Result<(), EmitterError> {
    let addr = SocketAddr::new(cfg.coordinator, cfg.tcp_port);
    let mut stream = time::timeout(REGISTRATION_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| EmitterError::Registration(format!("connect to {addr} timed out")))?
        .map_err(|err| EmitterError::Registration(format!("connect to {addr}: {err}")))?;

    let request = encode_registration(&cfg.node_id, anchor);
    stream
        .write_all(&request)
        .await
        .map_err(|err| EmitterError::Registration(err.to_string()))?;

    let mut reply = [0u8; 8];
    let n = time::timeout(REGISTRATION_TIMEOUT, stream.read(&mut reply))
        .await
        .map_err(|_| EmitterError::Registration("reply timed out".to_string()))?
        .map_err(|err| EmitterError::Registration(err.to_string()))?;

    let reply = reply[..n]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect::<Vec<u8>>();
    if reply != ACK {
        return Err(EmitterError::Registration(format!(
            "unexpected reply {:?}",
            String::from_utf8_lossy(&reply)
        )));
    }
    println!("PULSE|mod=EMIT|evt=REGISTERED|node={}|coordinator={addr}", cfg.node_id);
    Ok(())
}

/// Bootstraps, registers, and runs the emit loop to completion.
///
/// Beats carry indices `1 ..= N-1`; reaching `N` is chain exhaustion and
/// ends the loop cleanly.  The loop never re-emits an index, stops on the
/// shutdown signal, and logs-and-stops on a send error.  The socket is
/// dropped on return.
pub async fn run_emitter(
    cfg: &EmitterConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<EmitterOutcome, EmitterError> {
    let chain = bootstrap_chain(&cfg.chain_dir, cfg.chain_length, cfg.debug)?;
    register_anchor(cfg, chain.anchor()).await?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|err| EmitterError::Io(err.to_string()))?;
    let target = SocketAddr::new(cfg.coordinator, cfg.udp_port);
    let n = chain.length();

    for i in 1..n {
        if *shutdown.borrow() {
            return Ok(EmitterOutcome::Stopped);
        }
        let Some(w) = chain.reveal(i) else {
            break;
        };
        let datagram = HeartbeatFrame::encode(&cfg.node_id, epoch_now(), i as u64, w);
        if let Err(err) = socket.send_to(&datagram, target).await {
            eprintln!(
                "PULSE|mod=EMIT|evt=SEND_ERROR|node={}|i={i}|err={err}",
                cfg.node_id
            );
            return Ok(EmitterOutcome::Stopped);
        }
        println!(
            "PULSE|mod=EMIT|evt=BEAT|node={}|i={i}|of={}",
            cfg.node_id,
            n - 1
        );
        tokio::select! {
            _ = time::sleep(cfg.interval) => {}
            _ = shutdown.changed() => return Ok(EmitterOutcome::Stopped),
        }
    }

    println!("PULSE|mod=EMIT|evt=EXHAUSTED|node={}|beats={}", cfg.node_id, n - 1);
    Ok(EmitterOutcome::ChainExhausted)
}
