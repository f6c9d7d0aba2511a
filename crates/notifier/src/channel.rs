//! Retry engine of a single delivery channel.
//!
//! Each inbound notification gets its own task. Inside it the notification
//! moves through:
//!
//! - `Processing`: call the processor; success ends the chain.
//! - `Backoff`: on failure with `current_retry < ceiling`, wait for the retry
//!   interval racing cancellation. The timer winning bumps `current_retry` and
//!   goes back to `Processing`; cancellation winning drops the notification.
//! - `DeadLetter`: on failure with `current_retry >= ceiling`, tag the
//!   notification with the channel name and hand it to the dead-letter sink.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span};

use herald_common::config::AppConfig;
use herald_common::types::Notification;

use crate::contracts::{
    DeadLetterSink, NotificationSubscriber, NotificationsObserver, NotificationsProcessor,
};
use crate::service::ShutdownGroup;

/// Retry ceiling and pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub ceiling: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(ceiling: u32, interval: Duration) -> Self {
        Self { ceiling, interval }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.notifications_retry_count, config.retry_interval())
    }
}

/// One configured source → processor → dead-letter pipeline.
pub struct Channel {
    name: String,
    retry: RetryPolicy,
    observer: Arc<dyn NotificationsObserver>,
    processor: Arc<dyn NotificationsProcessor>,
    dead_letter: Arc<dyn DeadLetterSink>,
    in_flight: TaskTracker,
    span: Span,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        retry: RetryPolicy,
        observer: Arc<dyn NotificationsObserver>,
        processor: Arc<dyn NotificationsProcessor>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Arc<Self> {
        let name = name.into();
        let span = tracing::info_span!("channel", channel = %name);
        Arc::new(Self {
            name,
            retry,
            observer,
            processor,
            dead_letter,
            in_flight: TaskTracker::new(),
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of retry chains still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Subscribe to the observer and block on its listening loop.
    ///
    /// The observer's termination is forwarded to `shutdown`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, shutdown: ShutdownGroup) {
        let name = self.name.clone();
        self.observer.subscribe(
            self.subscriber(cancel.clone()),
            Box::new(move || shutdown.done(&name)),
        );

        tracing::info!(parent: &self.span, "Channel listening");
        self.observer.start_listening(cancel).await;
        tracing::info!(parent: &self.span, "Channel stopped listening");
    }

    fn subscriber(self: &Arc<Self>, cancel: CancellationToken) -> NotificationSubscriber {
        let channel: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |notification: Notification| {
            if let Some(channel) = channel.upgrade() {
                channel.dispatch(&cancel, notification);
            }
        })
    }

    /// Start a retry chain for `notification` on its own task.
    pub fn dispatch(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        notification: Notification,
    ) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        let cancel = cancel.child_token();
        let span = self.span.clone();
        self.in_flight
            .spawn(async move { channel.deliver(cancel, notification).await }.instrument(span))
    }

    async fn deliver(&self, cancel: CancellationToken, mut notification: Notification) {
        loop {
            tracing::info!(
                user_email = %notification.user_email,
                current_retry = notification.current_retry,
                "Start process notification"
            );

            let error = match self.processor.process(&cancel, &notification).await {
                Ok(()) => {
                    tracing::debug!(
                        user_email = %notification.user_email,
                        current_retry = notification.current_retry,
                        "Notification delivered"
                    );
                    return;
                }
                Err(e) => e,
            };

            tracing::error!(
                error = %error,
                user_email = %notification.user_email,
                current_retry = notification.current_retry,
                "Can't process notification"
            );

            if notification.current_retry >= self.retry.ceiling {
                notification.channel = self.name.clone();
                tracing::warn!(
                    error = %error,
                    user_email = %notification.user_email,
                    current_retry = notification.current_retry,
                    "Retries exhausted, handing notification to dead-letter sink"
                );
                if let Err(sink_error) = self.dead_letter.process(&notification, &error).await {
                    tracing::error!(
                        error = %sink_error,
                        user_email = %notification.user_email,
                        "Can't process dead notification"
                    );
                }
                return;
            }

            // Cancellation drops the notification without dead-lettering it.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(
                        error = %error,
                        user_email = %notification.user_email,
                        current_retry = notification.current_retry,
                        "Stop retry, channel is shutting down"
                    );
                    return;
                }
                _ = tokio::time::sleep(self.retry.interval) => {
                    notification.current_retry += 1;
                    tracing::info!(
                        user_email = %notification.user_email,
                        current_retry = notification.current_retry,
                        "Run retry"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use herald_common::error::{AppError, AppResult};

    use super::*;
    use crate::observers::MemoryNotificationsObserver;

    /// Fails the first `failures` calls, then succeeds.
    struct ScriptedProcessor {
        failures: u32,
        seen_retries: Mutex<Vec<u32>>,
    }

    impl ScriptedProcessor {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                seen_retries: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<u32> {
            self.seen_retries.lock().clone()
        }
    }

    #[async_trait]
    impl NotificationsProcessor for ScriptedProcessor {
        async fn process(
            &self,
            _cancel: &CancellationToken,
            notification: &Notification,
        ) -> AppResult<()> {
            let mut seen = self.seen_retries.lock();
            seen.push(notification.current_retry);
            if seen.len() as u32 <= self.failures {
                Err(AppError::Mail("relay unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<(Notification, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn process(&self, notification: &Notification, error: &AppError) -> AppResult<()> {
            self.received
                .lock()
                .push((notification.clone(), error.to_string()));
            if self.fail {
                Err(AppError::Broker("dead-letter topic unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn channel_with(
        ceiling: u32,
        processor: Arc<ScriptedProcessor>,
        sink: Arc<RecordingSink>,
    ) -> Arc<Channel> {
        let (observer, _handle) = MemoryNotificationsObserver::new();
        Channel::new(
            "email",
            RetryPolicy::new(ceiling, Duration::from_secs(3)),
            Arc::new(observer),
            processor,
            sink,
        )
    }

    fn notification() -> Notification {
        Notification::new("user@example.com", "Subject", "Body")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let processor = ScriptedProcessor::failing(0);
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(3, processor.clone(), sink.clone());

        channel
            .dispatch(&CancellationToken::new(), notification())
            .await
            .unwrap();

        assert_eq!(processor.calls(), vec![0]);
        assert!(sink.received.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_reach_dead_letter_sink() {
        let processor = ScriptedProcessor::failing(u32::MAX);
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(2, processor.clone(), sink.clone());

        channel
            .dispatch(&CancellationToken::new(), notification())
            .await
            .unwrap();

        // Initial attempt + 2 retries.
        assert_eq!(processor.calls(), vec![0, 1, 2]);
        let received = sink.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.current_retry, 2);
        assert_eq!(received[0].0.channel, "email");
        assert!(received[0].1.contains("relay unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ceiling_dead_letters_immediately() {
        let processor = ScriptedProcessor::failing(u32::MAX);
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(0, processor.clone(), sink.clone());

        channel
            .dispatch(&CancellationToken::new(), notification())
            .await
            .unwrap();

        assert_eq!(processor.calls(), vec![0]);
        assert_eq!(sink.received.lock()[0].0.current_retry, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let processor = ScriptedProcessor::failing(2);
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(3, processor.clone(), sink.clone());

        channel
            .dispatch(&CancellationToken::new(), notification())
            .await
            .unwrap();

        assert_eq!(processor.calls(), vec![0, 1, 2]);
        assert!(sink.received.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_for_the_interval() {
        let processor = ScriptedProcessor::failing(1);
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(3, processor.clone(), sink.clone());

        let started = tokio::time::Instant::now();
        channel
            .dispatch(&CancellationToken::new(), notification())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(processor.calls(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_drops_notification() {
        let processor = ScriptedProcessor::failing(u32::MAX);
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(3, processor.clone(), sink.clone());
        let cancel = CancellationToken::new();

        let chain = channel.dispatch(&cancel, notification());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(processor.calls(), vec![0]);

        cancel.cancel();
        chain.await.unwrap();

        assert_eq!(processor.calls(), vec![0]);
        assert!(sink.received.lock().is_empty());
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_failure_is_absorbed() {
        let processor = ScriptedProcessor::failing(u32::MAX);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let channel = channel_with(1, processor.clone(), sink.clone());

        channel
            .dispatch(&CancellationToken::new(), notification())
            .await
            .unwrap();

        assert_eq!(processor.calls(), vec![0, 1]);
        assert_eq!(sink.received.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_and_reports_termination() {
        let processor = ScriptedProcessor::failing(0);
        let sink = Arc::new(RecordingSink::default());
        let (observer, handle) = MemoryNotificationsObserver::new();
        let channel = Channel::new(
            "push",
            RetryPolicy::new(3, Duration::from_secs(1)),
            Arc::new(observer),
            processor.clone(),
            sink,
        );

        let cancel = CancellationToken::new();
        let (shutdown, mut stopped) = ShutdownGroup::new();
        let run = tokio::spawn(channel.clone().run(cancel.clone(), shutdown));

        handle.push(notification()).unwrap();
        handle.push(notification()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.calls().len(), 2);

        cancel.cancel();
        run.await.unwrap();
        assert_eq!(stopped.recv().await.as_deref(), Some("push"));
    }

    /// Sleeps on every call and tracks how many calls overlap.
    #[derive(Default)]
    struct SlowProcessor {
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl NotificationsProcessor for SlowProcessor {
        async fn process(
            &self,
            _cancel: &CancellationToken,
            _notification: &Notification,
        ) -> AppResult<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_processing_does_not_block_the_observer() {
        let processor = Arc::new(SlowProcessor::default());
        let (observer, handle) = MemoryNotificationsObserver::new();
        let channel = Channel::new(
            "email",
            RetryPolicy::new(3, Duration::from_secs(1)),
            Arc::new(observer),
            processor.clone(),
            Arc::new(RecordingSink::default()),
        );

        let cancel = CancellationToken::new();
        let (shutdown, _stopped) = ShutdownGroup::new();
        let run = tokio::spawn(channel.clone().run(cancel.clone(), shutdown));

        for _ in 0..3 {
            handle.push(notification()).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(processor.peak.load(Ordering::SeqCst), 3);
        assert_eq!(channel.in_flight(), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(processor.done.load(Ordering::SeqCst), 3);
        assert_eq!(channel.in_flight(), 0);

        cancel.cancel();
        run.await.unwrap();
    }
}
