// QUIC-backed peer adapters. Each adapter owns one send-only stream and a
// freshly generated peer id; the pools hold shared non-owning handles.
use anyhow::{Context, Result};
use async_trait::async_trait;
use fanout_broker::{Peer, Publisher, Subscriber};
use fanout_transport::write_full;
use fanout_wire::Event;
use quinn::SendStream;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Publisher adapter; owns the broker -> publisher control stream.
pub struct PublisherConn {
    id: Uuid,
    send_stream: Mutex<SendStream>,
}

impl PublisherConn {
    pub fn new(send_stream: SendStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            send_stream: Mutex::new(send_stream),
        }
    }

    async fn send_event(&self, event: Event) -> Result<()> {
        let encoded = event.encode().context("encode event")?;
        // The stream mutex keeps concurrent observer paths from interleaving
        // two records byte-wise.
        let mut stream = self.send_stream.lock().await;
        write_full(&mut stream, &encoded).await.context("write event")?;
        Ok(())
    }
}

impl Peer for PublisherConn {
    fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl Publisher for PublisherConn {
    async fn notify_exists_subscriber(&self) -> Result<()> {
        self.send_event(Event::ExistsSubscriber).await
    }

    async fn notify_no_subscribers(&self) -> Result<()> {
        self.send_event(Event::NoSubscribers).await
    }
}

/// Subscriber adapter; owns the broker -> subscriber message stream.
pub struct SubscriberConn {
    id: Uuid,
    send_stream: Mutex<SendStream>,
}

impl SubscriberConn {
    pub fn new(send_stream: SendStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            send_stream: Mutex::new(send_stream),
        }
    }
}

impl Peer for SubscriberConn {
    fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl Subscriber for SubscriberConn {
    async fn send_message(&self, message: &[u8]) -> Result<()> {
        let mut stream = self.send_stream.lock().await;
        write_full(&mut stream, message).await.context("write message")?;
        Ok(())
    }
}
