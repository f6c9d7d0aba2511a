//! Seams between a channel and its source, delivery action and dead-letter sink.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::Notification;

/// Called once per inbound notification. Must not block.
pub type NotificationSubscriber = Arc<dyn Fn(Notification) + Send + Sync>;

/// Called when an observer's listening loop exits.
pub type Terminator = Box<dyn FnOnce() + Send>;

/// Source side of a channel.
#[async_trait]
pub trait NotificationsObserver: Send + Sync {
    /// Register the callbacks used by [`start_listening`](Self::start_listening).
    fn subscribe(&self, subscriber: NotificationSubscriber, terminator: Terminator);

    /// Listen until `cancel` fires, then invoke the terminator exactly once.
    ///
    /// Transient source errors are logged and listening resumes.
    async fn start_listening(&self, cancel: CancellationToken);
}

/// Delivery action of a channel.
#[async_trait]
pub trait NotificationsProcessor: Send + Sync {
    async fn process(
        &self,
        cancel: &CancellationToken,
        notification: &Notification,
    ) -> AppResult<()>;
}

/// Recorder for notifications that exhausted their retries. Never retried.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn process(&self, notification: &Notification, error: &AppError) -> AppResult<()>;
}

/// Callback storage shared by the observer implementations.
#[derive(Default)]
pub struct ObserverSubscription {
    subscriber: Mutex<Option<NotificationSubscriber>>,
    terminator: Mutex<Option<Terminator>>,
}

impl ObserverSubscription {
    pub fn set(&self, subscriber: NotificationSubscriber, terminator: Terminator) {
        *self.subscriber.lock() = Some(subscriber);
        *self.terminator.lock() = Some(terminator);
    }

    /// Hand a notification to the subscriber, if any.
    pub fn deliver(&self, notification: Notification) {
        let subscriber = self.subscriber.lock().clone();
        match subscriber {
            Some(subscriber) => subscriber(notification),
            None => tracing::warn!(
                user_email = %notification.user_email,
                "Notification received before subscription, dropping"
            ),
        }
    }

    /// Invoke the terminator. Later calls are no-ops.
    pub fn terminate(&self) {
        let terminator = self.terminator.lock().take();
        if let Some(terminator) = terminator {
            terminator();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_terminator_fires_once() {
        let subscription = ObserverSubscription::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        subscription.set(
            Arc::new(|_: Notification| {}),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        subscription.terminate();
        subscription.terminate();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deliver_without_subscriber_is_dropped() {
        let subscription = ObserverSubscription::default();
        subscription.deliver(Notification::new("a@b.c", "", "lost"));
        subscription.terminate();
    }

    #[test]
    fn test_deliver_reaches_subscriber() {
        let subscription = ObserverSubscription::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        subscription.set(
            Arc::new(move |n: Notification| sink.lock().push(n.body)),
            Box::new(|| {}),
        );

        subscription.deliver(Notification::new("a@b.c", "", "first"));
        subscription.deliver(Notification::new("a@b.c", "", "second"));
        assert_eq!(*seen.lock(), vec!["first".to_string(), "second".to_string()]);
    }
}
