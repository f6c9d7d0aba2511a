//! Live-session registry: one duplex connection per user.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use herald_common::types::Notification;

use crate::connection::{DuplexConnection, Frame, SERVER_CLOSE_REASON};
use crate::receiver::StreamReceiver;

const REPLACED_NOTICE: &str = "new attempt to connect to WS, terminating current connection";
const REJECTED_NOTICE: &str = "terminating current connection, try again";

/// Maps user emails to their live connection and feeds them from a
/// [`StreamReceiver`].
///
/// A second connection for an already-connected user terminates the existing
/// session and is itself refused with a notice. The refused connection gets no
/// receiver but still owns the registry slot until its transport is seen closed.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<dyn DuplexConnection>>>,
    receiver: Arc<dyn StreamReceiver>,
}

impl ConnectionRegistry {
    pub fn new(receiver: Arc<dyn StreamReceiver>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            receiver,
        })
    }

    /// Subscribe to the receiver's push and termination callbacks.
    pub fn run(self: &Arc<Self>) {
        let push_to: Weak<Self> = Arc::downgrade(self);
        let terminate_for: Weak<Self> = Arc::downgrade(self);

        self.receiver.subscribe(
            Arc::new(move |notification: Notification| {
                let registry = push_to.clone();
                async move {
                    if let Some(registry) = registry.upgrade() {
                        registry.handle_notification(notification).await;
                    }
                }
                .boxed()
            }),
            Arc::new(move |user_email: String| {
                let registry = terminate_for.clone();
                async move {
                    if let Some(registry) = registry.upgrade() {
                        registry.handle_connection_termination(&user_email).await;
                    }
                }
                .boxed()
            }),
        );
        tracing::info!("Live session registry subscribed to receiver");
    }

    /// Register `connection` for `user_email` and start its session task.
    ///
    /// The session ends when the connection is closed by either side or
    /// `cancel` fires.
    pub async fn handle_connection(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        user_email: &str,
        connection: Arc<dyn DuplexConnection>,
    ) -> JoinHandle<()> {
        let previous = self
            .connections
            .lock()
            .insert(user_email.to_string(), connection.clone());

        if let Some(previous) = previous {
            tracing::warn!(user_email, "User already connected, terminating both sessions");
            send(user_email, previous.as_ref(), Frame::timestamped(REPLACED_NOTICE)).await;
            terminate(user_email, previous.as_ref()).await;

            send(user_email, connection.as_ref(), Frame::timestamped(REJECTED_NOTICE)).await;
            send(user_email, connection.as_ref(), Frame::server_close()).await;
            if let Err(e) = connection.close().await {
                tracing::debug!(user_email, error = %e, "Error closing refused connection");
            }

            let registry = Arc::clone(self);
            let span = tracing::info_span!("refused", user_email = %user_email);
            return tokio::spawn(
                registry
                    .refused(cancel.child_token(), user_email.to_string(), connection)
                    .instrument(span),
            );
        }

        let registry = Arc::clone(self);
        let span = tracing::info_span!("session", user_email = %user_email);
        tokio::spawn(
            registry
                .session(cancel.child_token(), user_email.to_string(), connection)
                .instrument(span),
        )
    }

    /// Hold the slot for a refused connection until its transport is gone.
    async fn refused(
        self: Arc<Self>,
        cancel: CancellationToken,
        user_email: String,
        connection: Arc<dyn DuplexConnection>,
    ) {
        watch(&cancel, connection.as_ref()).await;

        let mut connections = self.connections.lock();
        if connections
            .get(&user_email)
            .is_some_and(|current| Arc::ptr_eq(current, &connection))
        {
            connections.remove(&user_email);
            tracing::info!("Refused connection released");
        }
    }

    /// Run the user's receiver and watch the connection until it closes.
    async fn session(
        self: Arc<Self>,
        cancel: CancellationToken,
        user_email: String,
        connection: Arc<dyn DuplexConnection>,
    ) {
        tracing::info!("New live connection");

        let receiver = self.receiver.clone();
        let receiving = tokio::spawn({
            let cancel = cancel.clone();
            let user_email = user_email.clone();
            async move { receiver.receive_notifications(cancel, user_email).await }
                .in_current_span()
        });

        watch(&cancel, connection.as_ref()).await;

        cancel.cancel();
        if let Err(e) = receiving.await {
            tracing::error!(error = %e, "Receiver task failed");
        }
        tracing::info!("Live connection closed");
    }

    /// Write `notification` to its user's connection, if any.
    pub async fn handle_notification(&self, notification: Notification) {
        let connection = self
            .connections
            .lock()
            .get(&notification.user_email)
            .cloned();

        match connection {
            Some(connection) => {
                send(
                    &notification.user_email,
                    connection.as_ref(),
                    Frame::timestamped(&notification.body),
                )
                .await
            }
            None => tracing::debug!(
                user_email = %notification.user_email,
                "User not connected, dropping notification"
            ),
        }
    }

    /// Remove and close the user's connection. No-op when absent.
    pub async fn handle_connection_termination(&self, user_email: &str) {
        let connection = self.connections.lock().remove(user_email);
        if let Some(connection) = connection {
            tracing::info!(user_email, "Terminating live connection");
            terminate(user_email, connection.as_ref()).await;
        }
    }

    pub fn is_connected(&self, user_email: &str) -> bool {
        self.connections.lock().contains_key(user_email)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

/// Read and discard frames until the peer closes, a read fails or `cancel` fires.
async fn watch(cancel: &CancellationToken, connection: &dyn DuplexConnection) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = connection.read_message() => match frame {
                Ok(Frame::Close(_)) => {
                    tracing::info!("Live connection closed by user");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::info!(error = %e, "Live connection read failed");
                    return;
                }
            },
        }
    }
}

/// Best-effort write; failures are logged.
async fn send(user_email: &str, connection: &dyn DuplexConnection, frame: Frame) {
    if let Err(e) = connection.write_message(frame).await {
        tracing::warn!(user_email, error = %e, "Can't write to live connection");
    }
}

async fn terminate(user_email: &str, connection: &dyn DuplexConnection) {
    send(user_email, connection, Frame::timestamped(SERVER_CLOSE_REASON)).await;
    send(user_email, connection, Frame::server_close()).await;
    if let Err(e) = connection.close().await {
        tracing::debug!(user_email, error = %e, "Error closing live connection");
    }
}
