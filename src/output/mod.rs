//! Broker sinks for outbound messages.
//!
//! The publish queue only talks to a [`BrokerSink`], so it can be drained
//! against the real MQTT client ([`mqtt::MqttSink`]) or a recording fake in
//! tests.

pub mod mqtt;

use crate::queue::OutboundMessage;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors from a single publish attempt.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Broker unavailable")]
    BrokerUnavailable,
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("MQTT client error: {0}")]
    Client(String),
}

/// Future returned by [`BrokerSink::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

/// Trait for delivering messages to a broker.
pub trait BrokerSink: Send {
    /// Whether a broker connection is currently established.
    fn is_available(&self) -> bool;

    /// Publish `message` with QoS 0 and the retain flag set.
    ///
    /// Resolves once the message has been handed to the client; there is no
    /// acknowledgement from the broker at this quality of service.
    fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> PublishFuture<'a>;
}

/// Sink used when no broker is configured: never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

impl BrokerSink for Offline {
    fn is_available(&self) -> bool {
        false
    }

    fn publish<'a>(&'a mut self, _message: &'a OutboundMessage) -> PublishFuture<'a> {
        Box::pin(async { Err(PublishError::BrokerUnavailable) })
    }
}
