//! Duplex connection abstraction over a live browser session.

use async_trait::async_trait;
use chrono::Local;

use herald_common::error::AppResult;

/// Close code for a normal, server-initiated closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Reason carried by every server-initiated close frame.
pub const SERVER_CLOSE_REASON: &str = "connection closed by server";

/// A protocol-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close frame with an optional `(code, reason)`.
    Close(Option<(u16, String)>),
}

impl Frame {
    /// Text frame prefixed with the local wall-clock time, e.g.
    /// `[2024-05-01 12:00:00] hello`.
    pub fn timestamped(message: &str) -> Self {
        Frame::Text(format!(
            "[{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        ))
    }

    pub fn server_close() -> Self {
        Frame::Close(Some((NORMAL_CLOSURE, SERVER_CLOSE_REASON.to_string())))
    }
}

/// One live duplex connection.
///
/// Reads and writes may run concurrently from different tasks.
#[async_trait]
pub trait DuplexConnection: Send + Sync {
    /// Wait for the next inbound frame. An error means the transport is gone.
    async fn read_message(&self) -> AppResult<Frame>;

    async fn write_message(&self, frame: Frame) -> AppResult<()>;

    async fn close(&self) -> AppResult<()>;
}
