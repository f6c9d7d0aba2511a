//! Runs a set of channels and waits for all of them to stop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;

/// Fan-in of channel terminations.
///
/// Each channel reports its name exactly once when its observer stops.
#[derive(Clone)]
pub struct ShutdownGroup {
    tx: mpsc::UnboundedSender<String>,
}

impl ShutdownGroup {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn done(&self, channel: &str) {
        if self.tx.send(channel.to_string()).is_err() {
            tracing::debug!(channel, "Shutdown group already closed");
        }
    }
}

/// Owns the configured channels.
pub struct DispatchService {
    channels: Vec<Arc<Channel>>,
}

impl DispatchService {
    pub fn new(channels: Vec<Arc<Channel>>) -> Self {
        Self { channels }
    }

    /// Start every channel and block until each has reported termination.
    ///
    /// Only the listening loops are awaited; retry chains that are still in
    /// backoff observe the same cancellation independently.
    pub async fn run(&self, cancel: CancellationToken) {
        let expected = self.channels.len();
        let (shutdown, mut stopped) = ShutdownGroup::new();

        tracing::info!(channels = expected, "Start notifications processing");
        for channel in &self.channels {
            tracing::info!(channel = channel.name(), "Start notifications channel");
            tokio::spawn(channel.clone().run(cancel.clone(), shutdown.clone()));
        }
        drop(shutdown);
        tracing::info!("Started notifications processing");

        let mut terminated = 0;
        while terminated < expected {
            match stopped.recv().await {
                Some(name) => {
                    terminated += 1;
                    tracing::info!(channel = %name, terminated, expected, "Channel terminated");
                }
                None => {
                    tracing::warn!(
                        terminated,
                        expected,
                        "Channels stopped without reporting termination"
                    );
                    break;
                }
            }
        }

        let in_flight: usize = self.channels.iter().map(|c| c.in_flight()).sum();
        tracing::info!(in_flight, "Terminated notifications processing");
    }
}
