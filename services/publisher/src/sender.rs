// Gated message production: a timer loop that only emits while the broker
// reports at least one subscriber.
use anyhow::{Context, Result};
use async_trait::async_trait;
use fanout_transport::write_full;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Supplies message bodies to [`MessageSender`].
pub trait MessageProvider: Send + Sync {
    fn message(&self) -> Result<Vec<u8>>;
}

/// Says hello with this publisher's identifier and the current UTC time.
pub struct HelloMessageProvider {
    identifier: String,
}

impl HelloMessageProvider {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

impl MessageProvider for HelloMessageProvider {
    fn message(&self) -> Result<Vec<u8>> {
        let message = format!(
            "Hello from publisher {} at {}",
            self.identifier,
            chrono::Local::now().format("%H:%M:%S")
        );
        Ok(message.into_bytes())
    }
}

/// Destination for produced messages.
#[async_trait]
pub trait MessageRecipient: Send {
    async fn send(&mut self, message: &[u8]) -> Result<()>;
}

/// Recipient backed by the publisher's uni message stream to the broker.
pub struct QuicMessageRecipient {
    stream: quinn::SendStream,
}

impl QuicMessageRecipient {
    pub fn new(stream: quinn::SendStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl MessageRecipient for QuicMessageRecipient {
    async fn send(&mut self, message: &[u8]) -> Result<()> {
        write_full(&mut self.stream, message)
            .await
            .context("write message")
    }
}

/// Timer loop that sends one message per interval while the gate reads
/// true. The gate carries the latest subscriber-presence state, not a
/// queue of transitions.
pub struct MessageSender<P> {
    provider: P,
    send_interval: Duration,
}

impl<P: MessageProvider> MessageSender<P> {
    pub fn new(provider: P, send_interval: Duration) -> Self {
        Self {
            provider,
            send_interval,
        }
    }

    /// Runs until `cancel` fires. A provider error is reported and the loop
    /// keeps going; a send error is reported and ends the loop (the stream
    /// is gone).
    pub async fn start_loop<R: MessageRecipient>(
        &self,
        cancel: &CancellationToken,
        recipient: &mut R,
        gate: watch::Receiver<bool>,
        fail_tx: mpsc::Sender<anyhow::Error>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("stopping sending messages, session cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.send_interval) => {
                    if !*gate.borrow() {
                        continue;
                    }
                    let message = match self.provider.message() {
                        Ok(message) => message,
                        Err(err) => {
                            let _ = fail_tx.send(err.context("get message from provider")).await;
                            continue;
                        }
                    };
                    if let Err(err) = recipient.send(&message).await {
                        let _ = fail_tx.send(err.context("send message to recipient")).await;
                        return;
                    }
                }
            }
        }
    }
}
