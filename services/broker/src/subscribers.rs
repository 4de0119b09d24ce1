// Subscriber-side acceptor. Same shape as the publisher side with two
// streams instead of three: the outbound message stream and the ping pair.
use anyhow::{Context, Result};
use fanout_broker::{Observer, Peer};
use fanout_transport::ping::accept_pings_when_ready;
use fanout_transport::{Listener, PeerConnection, PingStream, Pinger};
use quinn::SendStream;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use crate::conn::SubscriberConn;

/// Accepts subscriber connections and runs one session per connection.
pub struct SubscriberAcceptor {
    sessions: Arc<Semaphore>,
    observer: Arc<Observer>,
    pinger: Pinger,
}

impl SubscriberAcceptor {
    pub fn new(sessions: Arc<Semaphore>, observer: Arc<Observer>, pinger: Pinger) -> Self {
        Self {
            sessions,
            observer,
            pinger,
        }
    }

    /// Listener loop. Runs until `cancel` fires or accepting fails.
    pub async fn accept_subscribers(
        &self,
        cancel: CancellationToken,
        listener: Arc<Listener>,
    ) -> Result<()> {
        loop {
            tracing::info!("waiting for a subscriber connection");
            let connection = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("stopping accepting subscriber connections, context cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => accepted.context("accept subscriber connection")?,
            };
            tracing::info!(peer = %connection.remote_addr(), "got a subscriber connection");

            match Arc::clone(&self.sessions).try_acquire_owned() {
                Ok(permit) => self.process_connection(connection, permit),
                Err(_) => {
                    tracing::error!(
                        peer = %connection.remote_addr(),
                        "session limit reached, dropping subscriber connection"
                    );
                }
            }
        }
    }

    /// Set up one subscriber session under a fresh detached token; stream
    /// acquisitions run in parallel and rendezvous over single-use channels.
    fn process_connection(&self, connection: PeerConnection, permit: OwnedSemaphorePermit) {
        let session = CancellationToken::new();
        let connection = Arc::new(connection);

        let (message_tx, message_rx) = oneshot::channel::<SendStream>();
        let (ping_tx, ping_rx) = oneshot::channel::<PingStream>();

        // Outbound message stream, broker -> subscriber.
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

        let registered: Arc<Mutex<Option<Arc<SubscriberConn>>>> = Arc::new(Mutex::new(None));

        // Register the subscriber with the observer once its stream is up.
        // A registration failure is logged softer than on the publisher
        // side; subscribers are more numerous and less critical.
        {
            let session = session.clone();
            let observer = Arc::clone(&self.observer);
            let registered = Arc::clone(&registered);
            tokio::spawn(async move {
                let Ok(stream) = message_rx.await else {
                    return;
                };
                let subscriber = Arc::new(SubscriberConn::new(stream));
                tracing::info!(subscriber_id = %subscriber.id(), "subscriber created");
                *registered.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(Arc::clone(&subscriber));
                if let Err(err) = observer.on_subscriber_connected(subscriber).await {
                    tracing::warn!(error = %err, "subscriber registration");
                    session.cancel();
                }
            });
        }

        // Answer the subscriber's pings; a missed deadline ends the session.
        tokio::spawn(accept_pings_when_ready(
            session.clone(),
            self.pinger,
            ping_rx,
            "subscriber timed out",
        ));

        // Watcher: unpool the subscriber once the session ends.
        {
            let observer = Arc::clone(&self.observer);
            tokio::spawn(async move {
                session.cancelled().await;
                let subscriber = registered
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(subscriber) = subscriber {
                    observer.on_subscriber_disconnected(subscriber.as_ref()).await;
                }
                drop(permit);
            });
        }
    }
}
