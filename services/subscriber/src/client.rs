// Subscriber client session: dials the broker, receives fanned-out
// messages, and keeps the session alive with pings.
use anyhow::{Context, Result, anyhow};
use fanout_transport::ping::send_pings_when_ready;
use fanout_transport::{Dialer, PingStream, Pinger};
use quinn::RecvStream;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SubscriberClientConfig {
    pub server_addr: SocketAddr,
    pub max_message_bytes: usize,
}

pub struct SubscriberClient {
    config: SubscriberClientConfig,
    pinger: Pinger,
}

impl SubscriberClient {
    pub fn new(config: SubscriberClientConfig, pinger: Pinger) -> Self {
        Self { config, pinger }
    }

    /// Connect and run until the session ends. Stream acquisitions run in
    /// parallel; readiness order against the broker is unspecified.
    pub async fn run(&self, dialer: &Dialer) -> Result<()> {
        tracing::info!("connecting to the server");
        let connection = Arc::new(
            dialer
                .dial(self.config.server_addr, "localhost")
                .await
                .context("connect to the server")?,
        );
        tracing::info!("connected to the server");

        let session = CancellationToken::new();

        let (message_tx, message_rx) = oneshot::channel::<RecvStream>();
        let (ping_tx, ping_rx) = oneshot::channel::<PingStream>();

        // Messages from the server.
        {
            let connection = Arc::clone(&connection);
            let session = session.clone();
            tokio::spawn(async move {
                match connection.incoming_recv_stream().await {
                    Ok(stream) => {
                        tracing::info!("message stream ready");
                        let _ = message_tx.send(stream);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept message stream");
                        session.cancel();
                    }
                }
            });
        }
        // Ping stream.
        {
            let connection = Arc::clone(&connection);
            let session = session.clone();
            tokio::spawn(async move {
                match connection.open_ping_stream().await {
                    Ok(stream) => {
                        tracing::info!("ping stream ready");
                        let _ = ping_tx.send(stream);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "open ping stream");
                        session.cancel();
                    }
                }
            });
        }

        // Ping the server so both sides can detect the other's death.
        tokio::spawn(send_pings_when_ready(session.clone(), self.pinger, ping_rx));

        // Receive and print messages.
        {
            let session = session.clone();
            let max_message_bytes = self.config.max_message_bytes;
            tokio::spawn(async move {
                let Ok(mut stream) = message_rx.await else {
                    return;
                };
                tracing::info!("receiving messages");
                if let Err(err) = listen_for_messages(&session, &mut stream, max_message_bytes).await
                {
                    tracing::error!(error = %err, "listen for messages");
                    session.cancel();
                }
            });
        }

        session.cancelled().await;
        tracing::info!("shutting down");
        Ok(())
    }
}

/// Read and log messages until the session ends. A server timeout ends the
/// loop cleanly; a finished stream is an error that tears the session down.
async fn listen_for_messages<R: AsyncRead + Unpin>(
    cancel: &CancellationToken,
    stream: &mut R,
    max_message_bytes: usize,
) -> Result<()> {
    let mut buf = vec![0u8; max_message_bytes];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("stopping receiving messages, session cancelled");
                return Ok(());
            }
            read = stream.read(&mut buf) => read,
        };
        match read {
            Ok(0) => return Err(anyhow!("message stream finished by the server")),
            Ok(read) => {
                tracing::info!(msg = %String::from_utf8_lossy(&buf[..read]), "received message");
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                tracing::info!("server timeout, stopping listening for messages");
                return Ok(());
            }
            Err(err) => return Err(err).context("read message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_stream_is_an_error() {
        let cancel = CancellationToken::new();
        let mut stream: &[u8] = b"one last message";
        let err = listen_for_messages(&cancel, &mut stream, 1000)
            .await
            .expect_err("end of stream tears the session down");
        assert!(err.to_string().contains("finished"));
    }

    #[tokio::test]
    async fn cancellation_stops_listening_cleanly() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream: &[u8] = &[];
        listen_for_messages(&cancel, &mut stream, 1000)
            .await
            .expect("cancelled listener returns Ok");
    }
}
