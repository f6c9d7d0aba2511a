//! Per-user, cursor-tracked consumption of the durable notification log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::notification_log::{LogEntry, LogReader, NotificationLog};
use herald_common::types::{LOG_ORIGIN_ID, Notification};

/// Invoked once per notification read from a user's log.
pub type PushCallback = Arc<dyn Fn(Notification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with the user's email when their receiver stops.
pub type TerminationCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait StreamReceiver: Send + Sync {
    fn subscribe(&self, push: PushCallback, terminate: TerminationCallback);

    /// Stream `user_email`'s notifications to the push callback until
    /// `cancel` fires, then invoke the termination callback.
    async fn receive_notifications(&self, cancel: CancellationToken, user_email: String);
}

#[derive(Clone)]
struct Callbacks {
    push: PushCallback,
    terminate: TerminationCallback,
}

/// [`StreamReceiver`] over a [`NotificationLog`].
///
/// The cursor is persisted after each pushed entry, so a crash between the
/// push and the write replays that entry on the next session.
pub struct CursorStreamReceiver {
    log: Arc<dyn NotificationLog>,
    block: Duration,
    callbacks: Mutex<Option<Callbacks>>,
}

impl CursorStreamReceiver {
    /// `block` bounds each blocking read so cancellation is re-checked.
    pub fn new(log: Arc<dyn NotificationLog>, block: Duration) -> Self {
        Self {
            log,
            block,
            callbacks: Mutex::new(None),
        }
    }

    /// One read cycle: fetch entries after the cursor, push them in order and
    /// advance the cursor past each.
    async fn poll(
        &self,
        cancel: &CancellationToken,
        user_email: &str,
        reader: &mut dyn LogReader,
        push: &PushCallback,
    ) -> AppResult<()> {
        let cursor = self
            .log
            .read_cursor(user_email)
            .await?
            .unwrap_or_else(|| LOG_ORIGIN_ID.to_string());

        let entries = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            entries = reader.read_after(&cursor, self.block) => entries?,
        };

        for entry in entries {
            match decode(&entry) {
                Ok(notification) => push(notification).await,
                Err(e) => tracing::error!(
                    user_email,
                    entry_id = %entry.id,
                    error = %e,
                    "Can't decode notification from log, skipping entry"
                ),
            }
            self.log.write_cursor(user_email, &entry.id).await?;
        }

        Ok(())
    }
}

fn decode(entry: &LogEntry) -> AppResult<Notification> {
    let payload = entry
        .payload
        .as_deref()
        .ok_or_else(|| AppError::Decode("entry has no notification field".to_string()))?;
    Notification::from_json(payload.as_bytes()).map_err(|e| AppError::Decode(e.to_string()))
}

#[async_trait]
impl StreamReceiver for CursorStreamReceiver {
    fn subscribe(&self, push: PushCallback, terminate: TerminationCallback) {
        *self.callbacks.lock() = Some(Callbacks { push, terminate });
    }

    async fn receive_notifications(&self, cancel: CancellationToken, user_email: String) {
        let Some(callbacks) = self.callbacks.lock().clone() else {
            tracing::warn!(user_email = %user_email, "Receiver has no subscriber, not receiving");
            return;
        };

        tracing::info!(user_email = %user_email, "Start receiving notifications");
        let mut reader: Option<Box<dyn LogReader>> = None;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(user_email = %user_email, "Stop receiving notifications");
                (callbacks.terminate)(user_email).await;
                return;
            }

            let polled = match reader.as_mut() {
                Some(open) => {
                    self.poll(&cancel, &user_email, open.as_mut(), &callbacks.push)
                        .await
                }
                None => self
                    .log
                    .open_reader(&user_email)
                    .await
                    .map(|opened| reader = Some(opened)),
            };

            if let Err(e) = polled {
                tracing::error!(
                    user_email = %user_email,
                    error = %e,
                    "Error reading notifications"
                );
                // Reopen on the next cycle; wait no longer than one blocking read.
                reader = None;
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.block) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use herald_common::notification_log::MemoryNotificationLog;

    use super::*;

    const USER: &str = "user@example.com";

    type Pushed = Arc<Mutex<Vec<Notification>>>;
    type Terminated = Arc<Mutex<Vec<String>>>;

    fn subscribe(receiver: &dyn StreamReceiver) -> (Pushed, Terminated) {
        let pushed = Pushed::default();
        let terminated = Terminated::default();
        let (p, t) = (pushed.clone(), terminated.clone());
        receiver.subscribe(
            Arc::new(move |n: Notification| {
                p.lock().push(n);
                async {}.boxed()
            }),
            Arc::new(move |user: String| {
                t.lock().push(user);
                async {}.boxed()
            }),
        );
        (pushed, terminated)
    }

    fn envelope(body: &str) -> String {
        Notification::new(USER, "", body).to_json().unwrap()
    }

    async fn run_until_idle(receiver: Arc<CursorStreamReceiver>) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { receiver.receive_notifications(cancel, USER.to_string()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_pushes_entry_and_advances_cursor() {
        let log = MemoryNotificationLog::new();
        let id = log.append_entry(USER, Some(envelope("hello")));

        let receiver = Arc::new(CursorStreamReceiver::new(
            Arc::new(log.clone()),
            Duration::from_millis(10),
        ));
        let (pushed, terminated) = subscribe(receiver.as_ref());

        run_until_idle(receiver).await;

        let pushed = pushed.lock();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].body, "hello");
        assert_eq!(log.cursor(USER), Some(id));
        assert_eq!(*terminated.lock(), vec![USER.to_string()]);
    }

    #[tokio::test]
    async fn test_resumes_after_persisted_cursor() {
        let log = MemoryNotificationLog::new();
        let first = log.append_entry(USER, Some(envelope("seen")));
        log.append_entry(USER, Some(envelope("new")));
        log.write_cursor(USER, &first).await.unwrap();

        let receiver = Arc::new(CursorStreamReceiver::new(
            Arc::new(log.clone()),
            Duration::from_millis(10),
        ));
        let (pushed, _) = subscribe(receiver.as_ref());

        run_until_idle(receiver).await;

        let bodies: Vec<String> = pushed.lock().iter().map(|n| n.body.clone()).collect();
        assert_eq!(bodies, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_skipped_but_cursor_advances() {
        let log = MemoryNotificationLog::new();
        log.append_entry(USER, Some("{not json".to_string()));
        log.append_entry(USER, None);
        let last = log.append_entry(USER, Some(envelope("ok")));

        let receiver = Arc::new(CursorStreamReceiver::new(
            Arc::new(log.clone()),
            Duration::from_millis(10),
        ));
        let (pushed, _) = subscribe(receiver.as_ref());

        run_until_idle(receiver).await;

        assert_eq!(pushed.lock().len(), 1);
        assert_eq!(log.cursor(USER), Some(last));
    }

    #[tokio::test]
    async fn test_delivers_entries_appended_while_blocked() {
        let log = MemoryNotificationLog::new();
        let receiver = Arc::new(CursorStreamReceiver::new(
            Arc::new(log.clone()),
            Duration::from_secs(5),
        ));
        let (pushed, _) = subscribe(receiver.as_ref());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            async move { receiver.receive_notifications(cancel, USER.to_string()).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append_entry(USER, Some(envelope("late")));
        log.append_entry("someone@else.com", Some(envelope("not yours")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        task.await.unwrap();

        let bodies: Vec<String> = pushed.lock().iter().map(|n| n.body.clone()).collect();
        assert_eq!(bodies, vec!["late".to_string()]);
    }

    #[tokio::test]
    async fn test_cursor_is_written_after_push() {
        let log = MemoryNotificationLog::new();
        let first = log.append_entry(USER, Some(envelope("first")));
        let second = log.append_entry(USER, Some(envelope("second")));

        let receiver = Arc::new(CursorStreamReceiver::new(
            Arc::new(log.clone()),
            Duration::from_millis(10),
        ));
        let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
        let (record, observed) = (seen.clone(), log.clone());
        receiver.subscribe(
            Arc::new(move |n: Notification| {
                record.lock().push((n.body, observed.cursor(USER)));
                async {}.boxed()
            }),
            Arc::new(|_: String| async {}.boxed()),
        );

        run_until_idle(receiver).await;

        assert_eq!(
            *seen.lock(),
            vec![
                ("first".to_string(), None),
                ("second".to_string(), Some(first)),
            ]
        );
        assert_eq!(log.cursor(USER), Some(second));
    }

    /// Log whose reads fail a fixed number of times.
    struct FlakyLog {
        inner: MemoryNotificationLog,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl NotificationLog for FlakyLog {
        async fn append(&self, user_email: &str, payload: &str) -> AppResult<String> {
            self.inner.append(user_email, payload).await
        }

        async fn read_cursor(&self, user_email: &str) -> AppResult<Option<String>> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AppError::Connection("connection reset".to_string()));
            }
            self.inner.read_cursor(user_email).await
        }

        async fn write_cursor(&self, user_email: &str, entry_id: &str) -> AppResult<()> {
            self.inner.write_cursor(user_email, entry_id).await
        }

        async fn open_reader(&self, user_email: &str) -> AppResult<Box<dyn LogReader>> {
            self.inner.open_reader(user_email).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let inner = MemoryNotificationLog::new();
        inner.append_entry(USER, Some(envelope("eventually")));
        let log = Arc::new(FlakyLog {
            inner: inner.clone(),
            failures_left: AtomicUsize::new(2),
        });

        let receiver = Arc::new(CursorStreamReceiver::new(log, Duration::from_secs(1)));
        let (pushed, _) = subscribe(receiver.as_ref());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            async move { receiver.receive_notifications(cancel, USER.to_string()).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(pushed.lock().len(), 1);
        assert!(inner.cursor(USER).is_some());
    }

    #[tokio::test]
    async fn test_without_subscriber_returns_immediately() {
        let receiver = CursorStreamReceiver::new(
            Arc::new(MemoryNotificationLog::new()),
            Duration::from_millis(10),
        );
        receiver
            .receive_notifications(CancellationToken::new(), USER.to_string())
            .await;
    }
}
