// Subscriber client main entry point.
use anyhow::{Result, bail};
use clap::Parser;
use fanout_transport::{Dialer, Pinger, PingerConfig, tls};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod client;

use client::{SubscriberClient, SubscriberClientConfig};

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Demo subscriber: prints every message the broker fans out")]
struct Args {
    /// Path to the directory containing TLS certificates (expects ca.pem)
    #[arg(long = "cert-path", default_value = "certs")]
    cert_path: PathBuf,

    /// Broker subscriber port
    #[arg(long = "server-port", default_value_t = 5001)]
    server_port: u16,

    /// Max number of bytes per message
    #[arg(long = "max-message-bytes", default_value_t = 1000)]
    max_message_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider().install_default().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if args.max_message_bytes < 1 {
        bail!("--max-message-bytes < 1");
    }
    if !args.cert_path.is_dir() {
        bail!(
            "cannot stat the TLS certs dir at {}, change the working dir to the project root or pass --cert-path",
            args.cert_path.display()
        );
    }

    let client_config = tls::build_client_config(&args.cert_path)?;
    let dialer = Dialer::new(client_config)?;

    let server_addr = SocketAddr::new("127.0.0.1".parse()?, args.server_port);
    let subscriber = SubscriberClient::new(
        SubscriberClientConfig {
            server_addr,
            max_message_bytes: args.max_message_bytes,
        },
        Pinger::new(PingerConfig::default()),
    );

    subscriber.run(&dialer).await
}
