//! Notification sources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use herald_common::types::Notification;

use crate::broker::{BrokerConsumer, BrokerMessage};
use crate::contracts::{
    NotificationSubscriber, NotificationsObserver, ObserverSubscription, Terminator,
};

/// Observer consuming one broker topic.
///
/// A failed consume session is logged and retried after `reconnect_interval`
/// unless cancellation arrives first.
pub struct BrokerNotificationsObserver {
    topic: String,
    consumer: Arc<dyn BrokerConsumer>,
    reconnect_interval: Duration,
    subscription: ObserverSubscription,
}

impl BrokerNotificationsObserver {
    pub fn new(
        topic: impl Into<String>,
        consumer: Arc<dyn BrokerConsumer>,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            consumer,
            reconnect_interval,
            subscription: ObserverSubscription::default(),
        }
    }

    fn handle_message(&self, message: BrokerMessage) {
        tracing::debug!(topic = %message.topic, id = %message.id, "Broker message received");
        match Notification::from_json(&message.payload) {
            Ok(notification) => self.subscription.deliver(notification),
            Err(e) => tracing::error!(
                topic = %message.topic,
                id = %message.id,
                error = %e,
                "Can't decode notification, skipping message"
            ),
        }
    }
}

#[async_trait]
impl NotificationsObserver for BrokerNotificationsObserver {
    fn subscribe(&self, subscriber: NotificationSubscriber, terminator: Terminator) {
        self.subscription.set(subscriber, terminator);
    }

    async fn start_listening(&self, cancel: CancellationToken) {
        let topics = [self.topic.clone()];
        let handler = |message: BrokerMessage| self.handle_message(message);

        loop {
            if let Err(e) = self.consumer.consume(&cancel, &topics, &handler).await {
                tracing::error!(topic = %self.topic, error = %e, "Error consuming messages");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(topic = %self.topic, "Terminating broker observer");
                    self.subscription.terminate();
                    return;
                }
                _ = tokio::time::sleep(self.reconnect_interval) => {
                    tracing::info!(
                        topic = %self.topic,
                        timeout_secs = self.reconnect_interval.as_secs(),
                        "Consume session ended, listening again"
                    );
                }
            }
        }
    }
}

/// Feeds a [`MemoryNotificationsObserver`].
#[derive(Clone)]
pub struct MemoryObserverHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl MemoryObserverHandle {
    /// Queue a notification. Fails once the observer has stopped.
    pub fn push(&self, notification: Notification) -> Result<(), Notification> {
        self.tx.send(notification).map_err(|e| e.0)
    }
}

/// In-process observer. Stops on cancellation or once every handle is gone.
pub struct MemoryNotificationsObserver {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    subscription: ObserverSubscription,
}

impl MemoryNotificationsObserver {
    pub fn new() -> (Self, MemoryObserverHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Self {
            rx: Mutex::new(Some(rx)),
            subscription: ObserverSubscription::default(),
        };
        (observer, MemoryObserverHandle { tx })
    }
}

#[async_trait]
impl NotificationsObserver for MemoryNotificationsObserver {
    fn subscribe(&self, subscriber: NotificationSubscriber, terminator: Terminator) {
        self.subscription.set(subscriber, terminator);
    }

    async fn start_listening(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            tracing::warn!("In-memory observer is already listening");
            self.subscription.terminate();
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(notification) => self.subscription.deliver(notification),
                    None => break,
                },
            }
        }

        tracing::info!("Terminating in-memory observer");
        self.subscription.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use herald_common::error::{AppError, AppResult};

    use super::*;
    use crate::broker::{BrokerProducer, MemoryBroker, MessageHandler};

    fn recording() -> (NotificationSubscriber, Arc<Mutex<Vec<Notification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |n: Notification| sink.lock().push(n)), seen)
    }

    fn counting_terminator() -> (Terminator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        (
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            calls,
        )
    }

    /// Consumer whose sessions always fail.
    struct FailingConsumer {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BrokerConsumer for FailingConsumer {
        async fn consume(
            &self,
            _cancel: &CancellationToken,
            _topics: &[String],
            _handler: &MessageHandler<'_>,
        ) -> AppResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Broker("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_broker_observer_decodes_and_skips_garbage() {
        let broker = MemoryBroker::new();
        broker
            .send(
                "notifications.email",
                br#"{"user_email":"a@b.c","subject":"S","body":"B"}"#,
            )
            .await
            .unwrap();
        broker.send("notifications.email", b"{broken").await.unwrap();
        broker
            .send("notifications.email", br#"{"user_email":"d@e.f","body":"2"}"#)
            .await
            .unwrap();

        let observer = BrokerNotificationsObserver::new(
            "notifications.email",
            Arc::new(broker.clone()),
            Duration::from_secs(6),
        );
        let (subscriber, seen) = recording();
        let (terminator, terminated) = counting_terminator();
        observer.subscribe(subscriber, terminator);

        let cancel = CancellationToken::new();
        let observer = Arc::new(observer);
        let listening = tokio::spawn({
            let observer = observer.clone();
            let cancel = cancel.clone();
            async move { observer.start_listening(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        listening.await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].user_email, "a@b.c");
        assert_eq!(seen[1].body, "2");
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_observer_retries_failed_sessions() {
        let consumer = Arc::new(FailingConsumer {
            attempts: AtomicUsize::new(0),
        });
        let observer = Arc::new(BrokerNotificationsObserver::new(
            "notifications.push",
            consumer.clone(),
            Duration::from_secs(6),
        ));
        let (subscriber, _) = recording();
        let (terminator, terminated) = counting_terminator();
        observer.subscribe(subscriber, terminator);

        let cancel = CancellationToken::new();
        let listening = tokio::spawn({
            let observer = observer.clone();
            let cancel = cancel.clone();
            async move { observer.start_listening(cancel).await }
        });

        // Attempts at t=0, 6, 12.
        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(terminated.load(Ordering::SeqCst), 0);

        cancel.cancel();
        listening.await.unwrap();
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_observer_stops_when_handles_drop() {
        let (observer, handle) = MemoryNotificationsObserver::new();
        let (subscriber, seen) = recording();
        let (terminator, terminated) = counting_terminator();
        observer.subscribe(subscriber, terminator);

        handle.push(Notification::new("a@b.c", "", "one")).unwrap();
        drop(handle);

        observer.start_listening(CancellationToken::new()).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_observer_second_listen_terminates() {
        let (observer, _handle) = MemoryNotificationsObserver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (terminator, terminated) = counting_terminator();
        observer.subscribe(recording().0, terminator);
        observer.start_listening(cancel.clone()).await;

        let (terminator, again) = counting_terminator();
        observer.subscribe(recording().0, terminator);
        observer.start_listening(cancel).await;

        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(again.load(Ordering::SeqCst), 1);
    }
}
