// Peer membership and dispatch at the center of the broker.
// Connection handling lives in the broker service; this crate only knows
// about peers through the capability traits below.
use async_trait::async_trait;
use uuid::Uuid;

mod observer;
mod pool;

pub use observer::Observer;
pub use pool::{PeerPool, PublisherPool, SubscriberPool};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// A peer with this id is already pooled; the existing entry wins.
    #[error("peer '{0}' exists, not overriding")]
    DuplicatePeer(Uuid),
}

/// Anything that can be held in a peer pool.
pub trait Peer: Send + Sync {
    /// Stable unique identifier for this connection.
    fn id(&self) -> Uuid;
}

/// Capability set of a connected publisher.
///
/// Implementations own the publisher's control stream; sends on one adapter
/// are serialized internally so records never interleave on the wire.
#[async_trait]
pub trait Publisher: Peer {
    /// Inform the publisher that at least one subscriber is connected.
    async fn notify_exists_subscriber(&self) -> anyhow::Result<()>;

    /// Inform the publisher that no subscribers are connected.
    async fn notify_no_subscribers(&self) -> anyhow::Result<()>;
}

/// Capability set of a connected subscriber.
#[async_trait]
pub trait Subscriber: Peer {
    /// Deliver one publisher payload to this subscriber.
    async fn send_message(&self, message: &[u8]) -> anyhow::Result<()>;
}
