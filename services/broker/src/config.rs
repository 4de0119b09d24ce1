// Broker runtime configuration sourced from the command line.
use anyhow::{Result, bail};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

const BIND_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Parser, Debug, Clone)]
#[command(name = "broker")]
#[command(about = "QUIC pub/sub broker: fans publisher messages out to every subscriber")]
pub struct BrokerConfig {
    /// Path to the TLS certificate (PEM)
    #[arg(long, default_value = "certs/cert.pem")]
    pub cert: PathBuf,

    /// Path to the TLS private key (PEM)
    #[arg(long, default_value = "certs/private.key")]
    pub key: PathBuf,

    /// Port to listen on for publisher connections
    #[arg(long = "pub-in-port", default_value_t = 5000)]
    pub pub_in_port: u16,

    /// Port to listen on for subscriber connections
    #[arg(long = "sub-in-port", default_value_t = 5001)]
    pub sub_in_port: u16,

    /// Max number of simultaneous sessions
    #[arg(long = "max-connections", default_value_t = 10_000)]
    pub max_connections: usize,

    /// Max number of bytes per message
    #[arg(long = "max-message-bytes", default_value_t = 1000)]
    pub max_message_bytes: usize,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections < 1 {
            bail!("--max-connections < 1, serving connections is impossible");
        }
        if self.max_message_bytes < 1 {
            bail!("--max-message-bytes < 1");
        }
        if !self.cert.is_file() {
            bail!(
                "cannot stat the TLS certificate at {}, change the working dir to the project root or pass --cert",
                self.cert.display()
            );
        }
        if !self.key.is_file() {
            bail!(
                "cannot stat the TLS private key at {}, change the working dir to the project root or pass --key",
                self.key.display()
            );
        }
        Ok(())
    }

    pub fn publisher_bind(&self) -> SocketAddr {
        SocketAddr::new(BIND_HOST, self.pub_in_port)
    }

    pub fn subscriber_bind(&self) -> SocketAddr {
        SocketAddr::new(BIND_HOST, self.sub_in_port)
    }
}
