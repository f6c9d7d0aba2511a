//! Live notification sessions.
//!
//! [`ConnectionRegistry`](registry::ConnectionRegistry) keeps at most one
//! [`DuplexConnection`](connection::DuplexConnection) per user and writes to it
//! whatever the user's [`StreamReceiver`](receiver::StreamReceiver) reads from
//! the durable per-user log.

pub mod connection;
pub mod receiver;
pub mod registry;
