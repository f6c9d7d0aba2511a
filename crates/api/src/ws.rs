//! [`DuplexConnection`] over an axum WebSocket.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use herald_common::error::{AppError, AppResult};
use herald_live::connection::{DuplexConnection, Frame};

/// WebSocket split into independently locked halves so the session's read
/// loop never blocks pushes.
pub struct WsConnection {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    receiver: Mutex<SplitStream<WebSocket>>,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(Bytes::from(data)),
        Frame::Ping(data) => Message::Ping(Bytes::from(data)),
        Frame::Pong(data) => Message::Pong(Bytes::from(data)),
        Frame::Close(close) => Message::Close(close.map(|(code, reason)| CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.to_string()),
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(close) => {
            Frame::Close(close.map(|frame| (frame.code, frame.reason.to_string())))
        }
    }
}

#[async_trait]
impl DuplexConnection for WsConnection {
    async fn read_message(&self) -> AppResult<Frame> {
        match self.receiver.lock().await.next().await {
            Some(Ok(message)) => Ok(from_message(message)),
            Some(Err(e)) => Err(AppError::Connection(e.to_string())),
            None => Err(AppError::Connection("websocket stream ended".to_string())),
        }
    }

    async fn write_message(&self, frame: Frame) -> AppResult<()> {
        self.sender
            .lock()
            .await
            .send(to_message(frame))
            .await
            .map_err(|e| AppError::Connection(e.to_string()))
    }

    async fn close(&self) -> AppResult<()> {
        self.sender
            .lock()
            .await
            .close()
            .await
            .map_err(|e| AppError::Connection(e.to_string()))
    }
}
