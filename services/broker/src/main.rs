// Broker service main entry point.
use anyhow::{Context, Result};
use broker::config::BrokerConfig;
use broker::publishers::{PublisherAcceptor, PublisherAcceptorConfig};
use broker::subscribers::SubscriberAcceptor;
use clap::Parser;
use fanout_broker::{Observer, PublisherPool, SubscriberPool};
use fanout_transport::{Listener, Pinger, PingerConfig, tls};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider().install_default().ok();

    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BrokerConfig::parse();
    config.validate()?;

    let server_config =
        tls::build_server_config(&config.cert, &config.key).context("build TLS server config")?;

    let publisher_pool = Arc::new(PublisherPool::new());
    let subscriber_pool = Arc::new(SubscriberPool::new());
    let observer = Arc::new(Observer::new(publisher_pool, subscriber_pool));
    let pinger = Pinger::new(PingerConfig::default());
    // One pool bounds in-flight sessions across both listeners.
    let sessions = Arc::new(Semaphore::new(config.max_connections));

    let cancel = CancellationToken::new();

    let publisher_listener = Arc::new(
        Listener::bind(config.publisher_bind(), server_config.clone())
            .context("bind publisher listener")?,
    );
    tracing::info!(addr = %publisher_listener.local_addr()?, "publisher listener started");

    let subscriber_listener = Arc::new(
        Listener::bind(config.subscriber_bind(), server_config)
            .context("bind subscriber listener")?,
    );
    tracing::info!(addr = %subscriber_listener.local_addr()?, "subscriber listener started");

    let publisher_task = {
        let acceptor = PublisherAcceptor::new(
            PublisherAcceptorConfig {
                max_message_bytes: config.max_message_bytes,
            },
            Arc::clone(&sessions),
            Arc::clone(&observer),
            pinger,
        );
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = acceptor.accept_publishers(cancel, publisher_listener).await {
                tracing::warn!(error = %err, "publisher accept loop exited");
            }
        })
    };

    let subscriber_task = {
        let acceptor = SubscriberAcceptor::new(sessions, observer, pinger);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = acceptor.accept_subscribers(cancel, subscriber_listener).await {
                tracing::warn!(error = %err, "subscriber accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    cancel.cancel();
    let _ = publisher_task.await;
    let _ = subscriber_task.await;
    tracing::info!("broker stopped");
    Ok(())
}
