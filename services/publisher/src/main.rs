// Publisher client main entry point.
use anyhow::{Result, bail};
use clap::Parser;
use fanout_transport::{Dialer, Pinger, PingerConfig, tls};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod client;
mod sender;

use client::{PublisherClient, PublisherClientConfig};
use sender::{HelloMessageProvider, MessageSender};

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Demo publisher: says hello while the broker reports subscribers")]
struct Args {
    /// Path to the directory containing TLS certificates (expects ca.pem)
    #[arg(long = "cert-path", default_value = "certs")]
    cert_path: PathBuf,

    /// Broker publisher port
    #[arg(long = "server-port", default_value_t = 5000)]
    server_port: u16,

    /// Max number of bytes per message
    #[arg(long = "max-message-bytes", default_value_t = 1000)]
    max_message_bytes: usize,

    /// Wait between messages, in milliseconds
    #[arg(long = "send-interval-ms", default_value_t = 1000)]
    send_interval_ms: u64,

    /// Identifier included in produced messages
    #[arg(long, default_value_t = Uuid::new_v4().to_string())]
    id: String,
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
    if args.send_interval_ms < 1 {
        bail!("--send-interval-ms < 1");
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
    let publisher = PublisherClient::new(
        PublisherClientConfig {
            server_addr,
            max_message_bytes: args.max_message_bytes,
        },
        Pinger::new(PingerConfig::default()),
    );
    let sender = MessageSender::new(
        HelloMessageProvider::new(args.id),
        Duration::from_millis(args.send_interval_ms),
    );

    publisher.run(&dialer, sender).await
}
