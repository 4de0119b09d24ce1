// Publisher-side acceptor: listener loop, per-connection stream
// orchestration, and the message receive loop.
use anyhow::{Context, Result, anyhow};
use fanout_broker::{Observer, Peer};
use fanout_transport::ping::accept_pings_when_ready;
use fanout_transport::{Listener, PeerConnection, PingStream, Pinger};
use quinn::{RecvStream, SendStream};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use crate::conn::PublisherConn;

#[derive(Debug, Clone)]
pub struct PublisherAcceptorConfig {
    /// Max bytes consumed by a single message-stream read.
    pub max_message_bytes: usize,
}

/// Accepts publisher connections and runs one session per connection.
pub struct PublisherAcceptor {
    config: PublisherAcceptorConfig,
    sessions: Arc<Semaphore>,
    observer: Arc<Observer>,
    pinger: Pinger,
}

impl PublisherAcceptor {
    pub fn new(
        config: PublisherAcceptorConfig,
        sessions: Arc<Semaphore>,
        observer: Arc<Observer>,
        pinger: Pinger,
    ) -> Self {
        Self {
            config,
            sessions,
            observer,
            pinger,
        }
    }

    /// Listener loop. Runs until `cancel` fires or accepting fails; peer
    /// failures inside a session never end the loop.
    pub async fn accept_publishers(
        &self,
        cancel: CancellationToken,
        listener: Arc<Listener>,
    ) -> Result<()> {
        loop {
            tracing::info!("waiting for publisher connections");
            let connection = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("stopping accepting publisher connections, context cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => accepted.context("accept publisher connection")?,
            };
            tracing::info!(peer = %connection.remote_addr(), "got a publisher connection");

            match Arc::clone(&self.sessions).try_acquire_owned() {
                Ok(permit) => self.process_connection(connection, permit),
                // Saturation drops this connection but keeps the listener up.
                Err(_) => {
                    tracing::error!(
                        peer = %connection.remote_addr(),
                        "session limit reached, dropping publisher connection"
                    );
                }
            }
        }
    }

    /// Set up one publisher session. The session runs under a fresh token
    /// detached from the listener: one session ending never cancels
    /// siblings, and stopping the listener leaves in-flight sessions alive.
    ///
    /// The three stream acquisitions block, and their ordering against the
    /// peer's own open/accept calls is unspecified by the transport, so
    /// each runs in its own task and hands the ready stream through a
    /// single-use channel that downstream tasks park on.
    fn process_connection(&self, connection: PeerConnection, permit: OwnedSemaphorePermit) {
        let session = CancellationToken::new();
        let connection = Arc::new(connection);

        let (event_tx, event_rx) = oneshot::channel::<SendStream>();
        let (message_tx, message_rx) = oneshot::channel::<RecvStream>();
        let (ping_tx, ping_rx) = oneshot::channel::<PingStream>();

        // Outbound control stream, broker -> publisher.
        {
            let connection = Arc::clone(&connection);
            let session = session.clone();
            tokio::spawn(async move {
                match connection.open_send_stream().await {
                    Ok(stream) => {
                        tracing::info!("event sending stream ready");
                        let _ = event_tx.send(stream);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "open event stream");
                        session.cancel();
                    }
                }
            });
        }
        // Inbound message stream, publisher -> broker.
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
        // Dedicated ping stream.
        {
            let connection = Arc::clone(&connection);
            let session = session.clone();
            tokio::spawn(async move {
                match connection.incoming_ping_stream().await {
                    Ok(stream) => {
                        tracing::info!("ping stream ready");
                        let _ = ping_tx.send(stream);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept ping stream");
                        session.cancel();
                    }
                }
            });
        }

        // The watcher needs whatever adapter was constructed by the time the
        // session ends; a closed channel would lose that, so hand it over
        // through shared state instead.
        let registered: Arc<Mutex<Option<Arc<PublisherConn>>>> = Arc::new(Mutex::new(None));

        // Register the publisher with the observer once its stream is up.
        {
            let session = session.clone();
            let observer = Arc::clone(&self.observer);
            let registered = Arc::clone(&registered);
            tokio::spawn(async move {
                let Ok(stream) = event_rx.await else {
                    // Acquisition failed and already cancelled the session.
                    return;
                };
                let publisher = Arc::new(PublisherConn::new(stream));
                tracing::info!(publisher_id = %publisher.id(), "publisher created");
                *registered.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(Arc::clone(&publisher));
                if let Err(err) = observer.on_publisher_connected(publisher).await {
                    tracing::error!(error = %err, "failure in publisher registration");
                    session.cancel();
                }
            });
        }

        // Receive messages and fan them out.
        {
            let session = session.clone();
            let observer = Arc::clone(&self.observer);
            let max_message_bytes = self.config.max_message_bytes;
            tokio::spawn(async move {
                let Ok(stream) = message_rx.await else {
                    return;
                };
                tracing::debug!("message stream available");
                if let Err(err) =
                    receive_messages(&session, &observer, stream, max_message_bytes).await
                {
                    tracing::error!(error = %err, "receive messages");
                    session.cancel();
                }
            });
        }

        // Answer the publisher's pings; a missed deadline ends the session.
        tokio::spawn(accept_pings_when_ready(
            session.clone(),
            self.pinger,
            ping_rx,
            "publisher timed out",
        ));

        // Watcher: unpool the publisher once the session ends, then release
        // the session slot.
        {
            let observer = Arc::clone(&self.observer);
            tokio::spawn(async move {
                session.cancelled().await;
                let publisher = registered
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(publisher) = publisher {
                    observer.on_publisher_disconnected(publisher.as_ref());
                }
                drop(permit);
            });
        }
    }
}

/// Read publisher payloads until the session ends. The publisher may stay
/// idle between messages indefinitely; liveness is the pinger's job, so
/// reads carry no deadline.
async fn receive_messages(
    cancel: &CancellationToken,
    observer: &Observer,
    mut stream: RecvStream,
    max_message_bytes: usize,
) -> Result<()> {
    let mut buf = vec![0u8; max_message_bytes];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("stopping receiving messages, session cancelled");
                return Ok(());
            }
            read = stream.read(&mut buf) => read.context("read message")?,
        };
        // Trim to what this read produced; there is no message framing.
        let Some(read) = read else {
            return Err(anyhow!("message stream finished by peer"));
        };
        observer.on_publisher_message(&buf[..read]).await;
    }
}
