//! CLI for the swarm_pulse liveness-attestation stack.
//!
//! `sentinel coordinate` runs the Coordinator-side verifier (TCP anchor
//! registration, UDP heartbeat verification, liveness sweeper);
//! `sentinel emit` runs a node-side emitter; `sentinel chain` manages
//! chain artifacts; `sentinel status` prints a node's stored state.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_pulse::emitter::{bootstrap_chain, run_emitter, EmitterConfig, EmitterOutcome};
use swarm_pulse::chain::{HashChain, ANCHOR_FILE, CHAIN_FILE, SEED_FILE};
use swarm_pulse::store::{FileStore, StateStore};
use swarm_pulse::verifier::{run_coordinator, CoordinatorConfig};
use tokio::signal;
use tokio::sync::watch;

const DEFAULT_STORE_DIR: &str = "./pulse_store";
const DEFAULT_CHAIN_DIR: &str = "./pulse_keys";

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_coordinate_help() {
    println!("Usage: sentinel coordinate [flags]");
    println!("  --bind <ip>             interface to bind (default 0.0.0.0)");
    println!("  --tcp-port <port>       registration port (default 5007)");
    println!("  --udp-port <port>       heartbeat port (default 5008)");
    println!("  --dead-timeout <secs>   silence before DEAD (default 7)");
    println!("  --emit-interval <secs>  fleet emit interval hint (default 1.0)");
    println!("  --notify <addr>         UDP sink for NODE_DEAD events");
    println!("  --store-dir <dir>       state directory (default {DEFAULT_STORE_DIR})");
    println!("  --metrics <addr>        serve GET /metrics on addr");
}

fn print_emit_help() {
    println!("Usage: sentinel emit --node-id <id> --coordinator <ip> [flags]");
    println!("  --tcp-port <port>       registration port (default 5007)");
    println!("  --udp-port <port>       heartbeat port (default 5008)");
    println!("  --interval <secs>       sleep between beats (default 1.0)");
    println!("  --chain-dir <dir>       chain artifacts (default {DEFAULT_CHAIN_DIR})");
    println!("  --length <n>            beats per fresh chain (default 100)");
    println!("  --debug                 print chain points at generation");
}

fn print_chain_help() {
    println!("Usage: sentinel chain <generate|reset> ...");
    println!("  generate --dir <dir> [--length <n>] [--debug]");
    println!("  reset --dir <dir>");
}

fn main() {
    let mut args = std::env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("coordinate") => cmd_coordinate(args.collect()),
        Some("emit") => cmd_emit(args.collect()),
        Some("chain") => {
            let sub = args.next().unwrap_or_else(|| {
                eprintln!("Usage: sentinel chain <generate|reset> ...");
                std::process::exit(1);
            });
            handle_chain(&sub, args.collect());
        }
        Some("status") => cmd_status(args.collect()),
        _ => {
            eprintln!("Usage: sentinel <coordinate|emit|chain|status> ...");
            std::process::exit(1);
        }
    }
}

fn handle_chain(sub: &str, tail: Vec<String>) {
    match sub {
        "-h" | "--help" => print_chain_help(),
        "generate" => cmd_chain_generate(tail),
        "reset" => cmd_chain_reset(tail),
        _ => {
            eprintln!("Unknown chain subcommand: {sub}");
            std::process::exit(1);
        }
    }
}

fn cmd_coordinate(args: Vec<String>) {
    let mut cfg = CoordinatorConfig::default();
    let mut store_dir = PathBuf::from(DEFAULT_STORE_DIR);
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_coordinate_help();
                return;
            }
            "--bind" => {
                let value = iter.next().unwrap_or_else(|| fatal("--bind expects a value"));
                cfg.bind_ip = value
                    .parse::<IpAddr>()
                    .unwrap_or_else(|_| fatal("invalid --bind address"));
            }
            "--tcp-port" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--tcp-port expects a value"));
                cfg.tcp_port = value.parse().unwrap_or_else(|_| fatal("invalid --tcp-port"));
            }
            "--udp-port" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--udp-port expects a value"));
                cfg.udp_port = value.parse().unwrap_or_else(|_| fatal("invalid --udp-port"));
            }
            "--dead-timeout" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--dead-timeout expects a value"));
                cfg.dead_timeout = value
                    .parse()
                    .unwrap_or_else(|_| fatal("invalid --dead-timeout"));
            }
            "--emit-interval" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--emit-interval expects a value"));
                cfg.emit_interval = value
                    .parse()
                    .unwrap_or_else(|_| fatal("invalid --emit-interval"));
            }
            "--notify" => {
                let value = iter.next().unwrap_or_else(|| fatal("--notify expects a value"));
                cfg.notify_addr = Some(
                    value
                        .parse::<SocketAddr>()
                        .unwrap_or_else(|_| fatal("invalid --notify address")),
                );
            }
            "--store-dir" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--store-dir expects a value"));
                store_dir = PathBuf::from(value);
            }
            "--metrics" => {
                let value = iter.next().unwrap_or_else(|| fatal("--metrics expects a value"));
                cfg.metrics_addr = Some(
                    value
                        .parse::<SocketAddr>()
                        .unwrap_or_else(|_| fatal("invalid --metrics address")),
                );
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }

    let store = FileStore::open(&store_dir)
        .unwrap_or_else(|err| fatal(&format!("failed to open store {}: {err}", store_dir.display())));
    let store: Arc<dyn StateStore> = Arc::new(store);

    let runtime = tokio::runtime::Runtime::new()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));
    if let Err(err) = runtime.block_on(run_coordinator(cfg, store)) {
        fatal(&format!("coordinator failed: {err}"));
    }
}

fn cmd_emit(args: Vec<String>) {
    let mut node_id: Option<String> = None;
    let mut coordinator: Option<IpAddr> = None;
    let mut tcp_port: u16 = 5007;
    let mut udp_port: u16 = 5008;
    let mut interval = 1.0f64;
    let mut chain_dir = PathBuf::from(DEFAULT_CHAIN_DIR);
    let mut chain_length = 100usize;
    let mut debug = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_emit_help();
                return;
            }
            "--node-id" => {
                node_id = Some(iter.next().unwrap_or_else(|| fatal("--node-id expects a value")));
            }
            "--coordinator" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--coordinator expects a value"));
                coordinator = Some(
                    value
                        .parse()
                        .unwrap_or_else(|_| fatal("invalid --coordinator address")),
                );
            }
            "--tcp-port" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--tcp-port expects a value"));
                tcp_port = value.parse().unwrap_or_else(|_| fatal("invalid --tcp-port"));
            }
            "--udp-port" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--udp-port expects a value"));
                udp_port = value.parse().unwrap_or_else(|_| fatal("invalid --udp-port"));
            }
            "--interval" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--interval expects a value"));
                interval = value.parse().unwrap_or_else(|_| fatal("invalid --interval"));
                if interval <= 0.0 {
                    fatal("--interval must be positive");
                }
            }
            "--chain-dir" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--chain-dir expects a value"));
                chain_dir = PathBuf::from(value);
            }
            "--length" => {
                let value = iter.next().unwrap_or_else(|| fatal("--length expects a value"));
                chain_length = value.parse().unwrap_or_else(|_| fatal("invalid --length"));
            }
            "--debug" => debug = true,
            other => fatal(&format!("unknown argument: {other}")),
        }
    }

    let cfg = EmitterConfig {
        node_id: node_id.unwrap_or_else(|| fatal("--node-id is required")),
        coordinator: coordinator.unwrap_or_else(|| fatal("--coordinator is required")),
        tcp_port,
        udp_port,
        interval: Duration::from_secs_f64(interval),
        chain_dir,
        chain_length,
        debug,
    };
    if cfg.node_id.contains('|') {
        fatal("--node-id must not contain '|'");
    }

    let runtime = tokio::runtime::Runtime::new()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));
    let outcome = runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        });
        run_emitter(&cfg, shutdown_rx).await
    });

    match outcome {
        Ok(EmitterOutcome::ChainExhausted) | Ok(EmitterOutcome::Stopped) => {}
        Err(swarm_pulse::emitter::EmitterError::Registration(msg)) => {
            eprintln!("registration failed: {msg}");
            std::process::exit(2);
        }
        Err(err) => fatal(&format!("emitter failed: {err}")),
    }
}

fn cmd_chain_generate(args: Vec<String>) {
    let mut dir: Option<PathBuf> = None;
    let mut length = 100usize;
    let mut debug = false;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dir" => {
                dir = Some(PathBuf::from(
                    iter.next().unwrap_or_else(|| fatal("--dir expects a value")),
                ));
            }
            "--length" => {
                let value = iter.next().unwrap_or_else(|| fatal("--length expects a value"));
                length = value.parse().unwrap_or_else(|_| fatal("invalid --length"));
            }
            "--debug" => debug = true,
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let dir = dir.unwrap_or_else(|| fatal("--dir is required"));
    match bootstrap_chain(&dir, length, debug) {
        Ok(chain) => println!(
            "chain ready: {} beats, anchor {}",
            chain.length(),
            hex_anchor(&chain)
        ),
        Err(err) => fatal(&format!("chain generation failed: {err}")),
    }
}

fn cmd_chain_reset(args: Vec<String>) {
    let mut dir: Option<PathBuf> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dir" => {
                dir = Some(PathBuf::from(
                    iter.next().unwrap_or_else(|| fatal("--dir expects a value")),
                ));
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let dir = dir.unwrap_or_else(|| fatal("--dir is required"));
    for name in [SEED_FILE, CHAIN_FILE, ANCHOR_FILE] {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => println!("removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => fatal(&format!("failed to remove {}: {err}", path.display())),
        }
    }
}

fn cmd_status(args: Vec<String>) {
    let mut node_id: Option<String> = None;
    let mut store_dir = PathBuf::from(DEFAULT_STORE_DIR);
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--store-dir" => {
                store_dir = PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--store-dir expects a value")),
                );
            }
            other if node_id.is_none() && !other.starts_with('-') => {
                node_id = Some(other.to_string());
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let node_id = node_id.unwrap_or_else(|| fatal("Usage: sentinel status <node_id> [--store-dir <dir>]"));

    let store = FileStore::open(&store_dir)
        .unwrap_or_else(|err| fatal(&format!("failed to open store {}: {err}", store_dir.display())));

    println!("node: {node_id}");
    match store.get_anchor(&node_id) {
        Ok(Some(record)) => {
            println!("anchor: {}", hex::encode(record.anchor));
            println!("registered_at: {:.3}", record.created_at);
        }
        Ok(None) => println!("anchor: -"),
        Err(err) => fatal(&format!("store read failed: {err}")),
    }
    match store.get_hb(&node_id) {
        Ok(Some(hb)) => {
            println!("status: {}", hb.status);
            println!("last_i: {}", hb.last_i);
            println!("last_ts: {:.3}", hb.last_ts);
        }
        Ok(None) => println!("status: -"),
        Err(err) => fatal(&format!("store read failed: {err}")),
    }
}

fn hex_anchor(chain: &HashChain) -> String {
    hex::encode(chain.anchor())
}
