//! Reliable notification delivery.
//!
//! A [`Channel`](channel::Channel) wires one source
//! ([`NotificationsObserver`](contracts::NotificationsObserver)) to one delivery action
//! ([`NotificationsProcessor`](contracts::NotificationsProcessor)) and one terminal-failure
//! recorder ([`DeadLetterSink`](contracts::DeadLetterSink)), retrying failed deliveries a
//! bounded number of times with a fixed pause in between.
//! [`DispatchService`](service::DispatchService) runs several channels and waits for all of
//! them to stop.

pub mod broker;
pub mod channel;
pub mod contracts;
pub mod dead_letter;
pub mod mail;
pub mod observers;
pub mod processors;
pub mod service;
