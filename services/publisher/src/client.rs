// Publisher client session: dials the broker, wires the stream topology in
// parallel, and gates message production on subscriber-presence events.
use anyhow::{Context, Result};
use fanout_transport::ping::send_pings_when_ready;
use fanout_transport::{Dialer, PingStream, Pinger, ReceiveError, receive_event};
use fanout_wire::Event;
use quinn::{RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::sender::{MessageProvider, MessageSender, QuicMessageRecipient};

#[derive(Debug, Clone)]
pub struct PublisherClientConfig {
    pub server_addr: SocketAddr,
    pub max_message_bytes: usize,
}

pub struct PublisherClient {
    config: PublisherClientConfig,
    pinger: Pinger,
}

impl PublisherClient {
    pub fn new(config: PublisherClientConfig, pinger: Pinger) -> Self {
        Self { config, pinger }
    }

    /// Connect and run until the session ends. The stream setup mirrors the
    /// broker's publisher side: accept the event stream, open the message
    /// stream, open the ping stream, each in its own task so readiness
    /// order does not matter.
    pub async fn run<P: MessageProvider + 'static>(
        &self,
        dialer: &Dialer,
        sender: MessageSender<P>,
    ) -> Result<()> {
        tracing::info!("connecting to the server");
        let connection = Arc::new(
            dialer
                .dial(self.config.server_addr, "localhost")
                .await
                .context("connect to the server")?,
        );
        tracing::info!("connected to the server");

        let session = CancellationToken::new();
        // Latest subscriber-presence state; false until the broker says otherwise.
        let (gate_tx, gate_rx) = watch::channel(false);
        let (fail_tx, mut fail_rx) = mpsc::channel::<anyhow::Error>(1);

        let (event_tx, event_rx) = oneshot::channel::<RecvStream>();
        let (message_tx, message_rx) = oneshot::channel::<SendStream>();
        let (ping_tx, ping_rx) = oneshot::channel::<PingStream>();

        // Events from the server.
        {
            let connection = Arc::clone(&connection);
            let session = session.clone();
            tokio::spawn(async move {
                match connection.incoming_recv_stream().await {
                    Ok(stream) => {
                        tracing::info!("event stream ready");
                        let _ = event_tx.send(stream);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept event stream");
                        session.cancel();
                    }
                }
            });
        }
        // Messages to the server.
        {
            let connection = Arc::clone(&connection);
            let session = session.clone();
            tokio::spawn(async move {
                match connection.open_send_stream().await {
                    Ok(stream) => {
                        tracing::info!("message sending stream ready");
                        let _ = message_tx.send(stream);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "open message stream");
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

        // Listen for events and toggle the gate.
        {
            let session = session.clone();
            let max_message_bytes = self.config.max_message_bytes;
            tokio::spawn(async move {
                let Ok(mut stream) = event_rx.await else {
                    return;
                };
                tracing::info!("listening for events");
                if let Err(err) =
                    listen_for_events(&session, &mut stream, max_message_bytes, &gate_tx).await
                {
                    tracing::error!(error = %err, "listen for events");
                    session.cancel();
                }
            });
        }

        // Produce messages while the gate is open.
        {
            let session = session.clone();
            tokio::spawn(async move {
                let Ok(stream) = message_rx.await else {
                    return;
                };
                tracing::info!("message stream ready, starting the send loop");
                let mut recipient = QuicMessageRecipient::new(stream);
                sender
                    .start_loop(&session, &mut recipient, gate_rx, fail_tx)
                    .await;
            });
        }

        // Ping the server so both sides can detect the other's death.
        tokio::spawn(send_pings_when_ready(session.clone(), self.pinger, ping_rx));

        // Monitor for message sending failures.
        {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = session.cancelled() => {}
                    reported = fail_rx.recv() => {
                        if let Some(err) = reported {
                            tracing::error!(error = %err, "failure sending a message");
                            session.cancel();
                        }
                    }
                }
            });
        }

        session.cancelled().await;
        tracing::info!("shutting down");
        Ok(())
    }
}

/// Receive events until the session ends. A corrupt record is logged and
/// skipped; a server timeout ends the loop cleanly; anything else is an
/// error the caller turns into session teardown.
async fn listen_for_events<R: tokio::io::AsyncRead + Unpin>(
    cancel: &CancellationToken,
    stream: &mut R,
    max_message_bytes: usize,
    gate: &watch::Sender<bool>,
) -> Result<()> {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("stopping receiving events, session cancelled");
                return Ok(());
            }
            received = receive_event(stream, max_message_bytes) => received,
        };
        match received {
            Ok(event) => {
                tracing::info!(event = ?event, "got event from the server");
                let _ = gate.send(matches!(event, Event::ExistsSubscriber));
            }
            Err(ReceiveError::Unmarshal { data, source }) => {
                tracing::info!(
                    event_body = %String::from_utf8_lossy(&data),
                    error = %source,
                    "got corrupt event, ignoring"
                );
            }
            Err(ReceiveError::Timeout) => {
                tracing::info!("server timeout, stopping listening for events");
                return Ok(());
            }
            Err(other) => return Err(other).context("receive event"),
        }
    }
}
