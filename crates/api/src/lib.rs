//! HTTP surface of the live notification service.
//!
//! - `GET /health`
//! - `GET /notifications/subscribe?userEmail=<email>` upgrades to a WebSocket
//!   that streams the user's notifications.

pub mod origin;
pub mod routes;
pub mod state;
pub mod ws;
