// server: notification feed server over the reliable UDP transport.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nf_proto::address::{parse_ipv4, parse_udp_port};
use nf_proto::Address;
use nf_transport::{DatagramEndpoint, ReliableTransport, WorkerRegistry};
use server::{Pipeline, ProfileStore, ServerConfig};

/// Teardown window granted to the transport for outstanding retransmits:
/// 10 bumps of 50ms.
const DISCONNECT_INTERVAL_NANOS: u64 = 50 * 1_000_000;
const DISCONNECT_BUMPS: u32 = 10;

#[derive(Parser)]
#[command(name = "server", about = "Notification feed server", disable_version_flag = true)]
struct Args {
    /// IPv4 address to bind, e.g. 0.0.0.0
    bind_ip: String,
    /// UDP port to bind.
    bind_port: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });
    let bind_ip = parse_ipv4(&args.bind_ip).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    let bind_port = parse_udp_port(&args.bind_port).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    let bind_address = Address::new(bind_ip, bind_port);

    let config = ServerConfig::from_env();
    let store = Arc::new(ProfileStore::new(config.data_file.clone()));
    store.load().await;

    info!(address = %bind_address, "binding server socket");
    let udp = match DatagramEndpoint::bind(bind_address).await {
        Ok(udp) => udp,
        Err(err) => {
            eprintln!("FATAL: failed to bind {bind_address}: {err}");
            std::process::exit(1);
        }
    };
    let transport = ReliableTransport::start(udp, nf_transport::Config::default());

    let registry = WorkerRegistry::new();
    Pipeline::start(&registry, transport.clone(), store.clone());

    info!("press Ctrl-C or close stdin to shut down");
    shutdown_signal().await;
    info!("shutting down");

    // Disconnect the pipeline's input first so its workers wind down
    // while the transport spends its window flushing retransmissions.
    transport.stop_receiving();
    transport
        .disconnect_timeout(DISCONNECT_INTERVAL_NANOS, DISCONNECT_BUMPS)
        .await;
    store.shutdown();
    registry.join_all().await;
    info!("server shut down cleanly");
}

/// Resolves on SIGINT, SIGTERM, or stdin reaching end-of-file.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stdin_eof = tokio::task::spawn_blocking(|| {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
        _ = stdin_eof => info!("stdin reached end of file"),
    }
}
