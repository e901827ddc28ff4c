// client: connect to a feed server and print notifications as they land.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use client::{ClientError, ClientSession};
use nf_proto::address::{parse_ipv4, parse_udp_port};
use nf_proto::{Address, Username};

#[derive(Parser)]
#[command(name = "client", about = "Notification feed client", disable_version_flag = true)]
struct Args {
    /// Handle to connect as, e.g. @helloworld
    username: String,
    /// Server IPv4 address.
    server_ip: String,
    /// Server UDP port.
    server_port: String,
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
    let username = Username::new(args.username.as_str()).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    let server_ip = parse_ipv4(&args.server_ip).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    let server_port = parse_udp_port(&args.server_port).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    let server = Address::new(server_ip, server_port);

    let session = match ClientSession::connect(username, server, nf_transport::Config::default())
        .await
    {
        Ok(session) => session,
        Err(err) => {
            eprintln!("FATAL: could not connect to {server}: {err}");
            std::process::exit(1);
        }
    };
    info!(username = %session.username(), %server, "connected; printing notifications");

    loop {
        tokio::select! {
            delivery = session.next_delivery() => match delivery {
                Ok(delivery) => {
                    println!(
                        "[{}] {}: {}",
                        delivery.sent_at, delivery.sender, delivery.message
                    );
                }
                Err(ClientError::ConnectionLost) => {
                    eprintln!("connection to the server was lost");
                    std::process::exit(1);
                }
                Err(err) => {
                    eprintln!("delivery stream failed: {err}");
                    std::process::exit(1);
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("disconnecting");
    if let Err(err) = session.disconnect().await {
        eprintln!("disconnect failed: {err}");
        std::process::exit(1);
    }
}
