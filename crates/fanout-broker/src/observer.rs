// Central dispatcher between the two peer pools. All pool mutations go
// through here so membership changes on one side can be translated into
// control notifications on the other.
use crate::{Peer, Publisher, PublisherPool, Subscriber, SubscriberPool};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Links pool membership changes to control notifications and routes
/// published payloads to every connected subscriber.
///
/// Calls are not serialized against each other; two message dispatches may
/// race, and no ordering holds across distinct peers. Per-peer ordering
/// follows from each adapter serializing its own stream writes.
pub struct Observer {
    publisher_pool: Arc<PublisherPool>,
    subscriber_pool: Arc<SubscriberPool>,
}

impl Observer {
    pub fn new(publisher_pool: Arc<PublisherPool>, subscriber_pool: Arc<SubscriberPool>) -> Self {
        Self {
            publisher_pool,
            subscriber_pool,
        }
    }

    /// Pool the publisher and immediately tell it whether subscribers exist.
    /// Both a duplicate id and a failed notification are propagated; the
    /// caller treats either as fatal for the publisher's session.
    pub async fn on_publisher_connected(&self, publisher: Arc<dyn Publisher>) -> Result<()> {
        let id = publisher.id();
        self.publisher_pool
            .add(Arc::clone(&publisher))
            .context("add a publisher to the publisher pool")?;

        if self.subscriber_pool.is_empty() {
            tracing::debug!(publisher_id = %id, "no subscribers exist, notifying the new publisher");
            publisher
                .notify_no_subscribers()
                .await
                .context("notify no subscribers")?;
        } else {
            tracing::debug!(publisher_id = %id, "subscribers exist, notifying the new publisher");
            publisher
                .notify_exists_subscriber()
                .await
                .context("notify exists subscriber")?;
        }
        Ok(())
    }

    pub fn on_publisher_disconnected(&self, publisher: &dyn Publisher) {
        tracing::debug!(publisher_id = %publisher.id(), "publisher disconnected");
        self.publisher_pool.remove(publisher.id());
    }

    /// Fan one publisher payload out to every pooled subscriber. A failing
    /// subscriber is logged and skipped so it cannot starve the rest.
    pub async fn on_publisher_message(&self, message: &[u8]) {
        tracing::debug!("sending message from publisher to subscribers");
        for subscriber in self.subscriber_pool.get_all() {
            if let Err(err) = subscriber.send_message(message).await {
                tracing::warn!(subscriber_id = %subscriber.id(), error = %err, "send message to subscriber");
            }
        }
    }

    /// Pool the subscriber, then tell every publisher that subscribers
    /// exist. Per-publisher notification failures are logged and swallowed.
    pub async fn on_subscriber_connected(&self, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let id = subscriber.id();
        self.subscriber_pool
            .add(subscriber)
            .context("add a subscriber to the subscriber pool")?;
        tracing::debug!(subscriber_id = %id, "subscriber connected");

        for publisher in self.publisher_pool.get_all() {
            if let Err(err) = publisher.notify_exists_subscriber().await {
                tracing::warn!(publisher_id = %publisher.id(), error = %err, "notify exists subscriber");
            }
        }
        Ok(())
    }

    /// Unpool the subscriber; if it was the last one, tell every publisher
    /// to stop producing. Per-publisher failures are logged and swallowed.
    pub async fn on_subscriber_disconnected(&self, subscriber: &dyn Subscriber) {
        self.subscriber_pool.remove(subscriber.id());

        if self.subscriber_pool.is_empty() {
            tracing::debug!("last subscriber disconnected, notifying publishers");
            for publisher in self.publisher_pool.get_all() {
                if let Err(err) = publisher.notify_no_subscribers().await {
                    tracing::warn!(publisher_id = %publisher.id(), error = %err, "notify no subscribers");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Peer;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct MockPublisher {
        id: Uuid,
        exists_calls: AtomicU32,
        none_calls: AtomicU32,
        fail: bool,
        first_record: Mutex<Option<&'static str>>,
    }

    impl MockPublisher {
        fn pooled() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                ..Self::default()
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                fail: true,
                ..Self::default()
            })
        }

        fn record(&self, code: &'static str) {
            let mut first = self.first_record.lock().expect("lock");
            first.get_or_insert(code);
        }
    }

    impl Peer for MockPublisher {
        fn id(&self) -> Uuid {
            self.id
        }
    }

    #[async_trait]
    impl Publisher for MockPublisher {
        async fn notify_exists_subscriber(&self) -> anyhow::Result<()> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            self.record("exists_subscriber");
            if self.fail {
                anyhow::bail!("stream gone");
            }
            Ok(())
        }

        async fn notify_no_subscribers(&self) -> anyhow::Result<()> {
            self.none_calls.fetch_add(1, Ordering::SeqCst);
            self.record("no_subscribers");
            if self.fail {
                anyhow::bail!("stream gone");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSubscriber {
        id: Uuid,
        messages: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl MockSubscriber {
        fn pooled() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                ..Self::default()
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                fail: true,
                ..Self::default()
            })
        }
    }

    impl Peer for MockSubscriber {
        fn id(&self) -> Uuid {
            self.id
        }
    }

    #[async_trait]
    impl Subscriber for MockSubscriber {
        async fn send_message(&self, message: &[u8]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("stream gone");
            }
            self.messages.lock().expect("lock").push(message.to_vec());
            Ok(())
        }
    }

    fn observer() -> (Observer, Arc<PublisherPool>, Arc<SubscriberPool>) {
        let publisher_pool = Arc::new(PublisherPool::new());
        let subscriber_pool = Arc::new(SubscriberPool::new());
        (
            Observer::new(Arc::clone(&publisher_pool), Arc::clone(&subscriber_pool)),
            publisher_pool,
            subscriber_pool,
        )
    }

    #[tokio::test]
    async fn publisher_connecting_with_subscribers_present_gets_exists_first() {
        let (observer, _, subscriber_pool) = observer();
        subscriber_pool
            .add(MockSubscriber::pooled())
            .expect("add subscriber");

        let publisher = MockPublisher::pooled();
        observer
            .on_publisher_connected(Arc::clone(&publisher) as Arc<dyn Publisher>)
            .await
            .expect("connect");

        assert_eq!(publisher.exists_calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.none_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            *publisher.first_record.lock().expect("lock"),
            Some("exists_subscriber")
        );
    }

    #[tokio::test]
    async fn publisher_connecting_with_no_subscribers_gets_none_first() {
        let (observer, _, _) = observer();
        let publisher = MockPublisher::pooled();
        observer
            .on_publisher_connected(Arc::clone(&publisher) as Arc<dyn Publisher>)
            .await
            .expect("connect");

        assert_eq!(publisher.none_calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.exists_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_publisher_id_propagates_and_keeps_first() {
        let (observer, publisher_pool, _) = observer();
        let first = MockPublisher::pooled();
        let second = Arc::new(MockPublisher {
            id: first.id,
            ..MockPublisher::default()
        });

        observer
            .on_publisher_connected(Arc::clone(&first) as Arc<dyn Publisher>)
            .await
            .expect("first connect");
        observer
            .on_publisher_connected(second as Arc<dyn Publisher>)
            .await
            .expect_err("duplicate id must propagate");

        let all = publisher_pool.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), first.id());
    }

    #[tokio::test]
    async fn failed_connect_notification_propagates() {
        let (observer, _, subscriber_pool) = observer();
        subscriber_pool
            .add(MockSubscriber::pooled())
            .expect("add subscriber");

        let publisher = MockPublisher::failing();
        observer
            .on_publisher_connected(publisher as Arc<dyn Publisher>)
            .await
            .expect_err("notification failure is session-fatal");
    }

    #[tokio::test]
    async fn message_fans_out_to_every_subscriber() {
        let (observer, _, subscriber_pool) = observer();
        let first = MockSubscriber::pooled();
        let second = MockSubscriber::pooled();
        subscriber_pool
            .add(Arc::clone(&first) as Arc<dyn Subscriber>)
            .expect("add first");
        subscriber_pool
            .add(Arc::clone(&second) as Arc<dyn Subscriber>)
            .expect("add second");

        observer.on_publisher_message(b"foo").await;

        assert_eq!(*first.messages.lock().expect("lock"), vec![b"foo".to_vec()]);
        assert_eq!(*second.messages.lock().expect("lock"), vec![b"foo".to_vec()]);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_starve_the_rest() {
        let (observer, _, subscriber_pool) = observer();
        let healthy = MockSubscriber::pooled();
        subscriber_pool
            .add(MockSubscriber::failing() as Arc<dyn Subscriber>)
            .expect("add failing");
        subscriber_pool
            .add(Arc::clone(&healthy) as Arc<dyn Subscriber>)
            .expect("add healthy");

        observer.on_publisher_message(b"bar").await;

        assert_eq!(
            *healthy.messages.lock().expect("lock"),
            vec![b"bar".to_vec()]
        );
    }

    #[tokio::test]
    async fn subscriber_connect_notifies_all_publishers() {
        let (observer, publisher_pool, subscriber_pool) = observer();
        let healthy = MockPublisher::pooled();
        publisher_pool
            .add(MockPublisher::failing() as Arc<dyn Publisher>)
            .expect("add failing");
        publisher_pool
            .add(Arc::clone(&healthy) as Arc<dyn Publisher>)
            .expect("add healthy");

        observer
            .on_subscriber_connected(MockSubscriber::pooled() as Arc<dyn Subscriber>)
            .await
            .expect("publisher failures are swallowed");

        assert_eq!(healthy.exists_calls.load(Ordering::SeqCst), 1);
        assert!(!subscriber_pool.is_empty());
    }

    #[tokio::test]
    async fn last_subscriber_leaving_notifies_publishers_once() {
        let (observer, publisher_pool, subscriber_pool) = observer();
        let publisher = MockPublisher::pooled();
        publisher_pool
            .add(Arc::clone(&publisher) as Arc<dyn Publisher>)
            .expect("add publisher");

        let subscriber = MockSubscriber::pooled();
        subscriber_pool
            .add(Arc::clone(&subscriber) as Arc<dyn Subscriber>)
            .expect("add subscriber");

        observer.on_subscriber_disconnected(subscriber.as_ref()).await;

        assert!(subscriber_pool.is_empty());
        assert_eq!(publisher.none_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_last_subscriber_leaving_stays_quiet() {
        let (observer, publisher_pool, subscriber_pool) = observer();
        let publisher = MockPublisher::pooled();
        publisher_pool
            .add(Arc::clone(&publisher) as Arc<dyn Publisher>)
            .expect("add publisher");

        let leaving = MockSubscriber::pooled();
        subscriber_pool
            .add(Arc::clone(&leaving) as Arc<dyn Subscriber>)
            .expect("add leaving");
        subscriber_pool
            .add(MockSubscriber::pooled() as Arc<dyn Subscriber>)
            .expect("add staying");

        observer.on_subscriber_disconnected(leaving.as_ref()).await;

        assert_eq!(publisher.none_calls.load(Ordering::SeqCst), 0);
        assert!(!subscriber_pool.is_empty());
    }

    #[tokio::test]
    async fn publisher_disconnect_removes_from_pool() {
        let (observer, publisher_pool, _) = observer();
        let publisher = MockPublisher::pooled();
        publisher_pool
            .add(Arc::clone(&publisher) as Arc<dyn Publisher>)
            .expect("add publisher");

        observer.on_publisher_disconnected(publisher.as_ref());

        assert!(publisher_pool.get_all().is_empty());
    }
}
