//! Outbound message buffer between the scan pipeline and the broker.
//!
//! Messages are queued while a scan window is open and drained once the
//! window closes. Delivery is fire-and-forget (QoS 0, retained), so a
//! message published late simply supersedes an older retained one on the
//! broker. A message whose delivery fails is kept for one more drain and
//! then dropped with an error log entry.
//!
//! Discovery messages are sent once per device, so losing one must be
//! undone by the sender. The queue evicts state messages first and records
//! every discovery message it loses; see
//! [`PublishQueue::take_lost_announcements`].

use crate::mac_address::MacAddress;
use crate::output::BrokerSink;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// Default number of messages kept while the broker cannot be reached.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// First delivery plus at most one redelivery.
pub const MAX_DELIVERY_ATTEMPTS: u8 = 2;

/// A message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    /// Device whose discovery message this is
    pub announces: Option<MacAddress>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            announces: None,
        }
    }

    /// Mark the message as the discovery message for `address`.
    pub fn announcing(mut self, address: MacAddress) -> Self {
        self.announces = Some(address);
        self
    }

    /// Build a message with `payload` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(
        topic: String,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, serde_json::to_string(payload)?))
    }
}

#[derive(Debug)]
struct Envelope {
    sequence: u64,
    attempts: u8,
    message: OutboundMessage,
}

/// FIFO of outbound messages with bounded capacity.
#[derive(Debug)]
pub struct PublishQueue {
    pending: VecDeque<Envelope>,
    capacity: usize,
    next_sequence: u64,
    lost_announcements: Vec<MacAddress>,
}

impl Default for PublishQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl PublishQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            next_sequence: 0,
            lost_announcements: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Topics in queue order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|e| e.message.topic.as_str())
    }

    /// Queued messages in order.
    pub fn messages(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.pending.iter().map(|e| &e.message)
    }

    /// Devices whose discovery message was evicted or dropped since the
    /// last call.
    pub fn take_lost_announcements(&mut self) -> Vec<MacAddress> {
        std::mem::take(&mut self.lost_announcements)
    }

    /// Append `message` and return its sequence number.
    ///
    /// When the queue is full the oldest state message is evicted and logged.
    /// A discovery message is only evicted when nothing else is queued.
    pub fn enqueue(&mut self, message: OutboundMessage) -> u64 {
        if self.pending.len() >= self.capacity {
            let victim = self
                .pending
                .iter()
                .position(|e| e.message.announces.is_none())
                .unwrap_or(0);
            if let Some(evicted) = self.pending.remove(victim) {
                warn!(
                    sequence = evicted.sequence,
                    topic = %evicted.message.topic,
                    capacity = self.capacity,
                    "Publish queue full, dropping oldest message"
                );
                self.lose(evicted.message);
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(sequence, topic = %message.topic, "Queued message");
        self.pending.push_back(Envelope {
            sequence,
            attempts: 0,
            message,
        });
        sequence
    }

    /// Attempt every currently queued message once against `sink`.
    ///
    /// While the sink reports no connection nothing is attempted and the
    /// queue is left as is. Returns the number of messages delivered.
    pub async fn drain(&mut self, sink: &mut dyn BrokerSink) -> usize {
        if !sink.is_available() {
            warn!(pending = self.len(), "Broker unavailable, keeping messages queued");
            return 0;
        }

        let batch = std::mem::take(&mut self.pending);
        let mut delivered = 0;

        for mut envelope in batch {
            envelope.attempts += 1;
            match sink.publish(&envelope.message).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(
                        sequence = envelope.sequence,
                        topic = %envelope.message.topic,
                        "Published message"
                    );
                }
                Err(e) if envelope.attempts < MAX_DELIVERY_ATTEMPTS => {
                    warn!(
                        sequence = envelope.sequence,
                        topic = %envelope.message.topic,
                        "Failed to publish, will retry on next drain: {e}"
                    );
                    self.pending.push_back(envelope);
                }
                Err(e) => {
                    error!(
                        sequence = envelope.sequence,
                        topic = %envelope.message.topic,
                        attempts = envelope.attempts,
                        "Failed to publish, dropping message: {e}"
                    );
                    self.lose(envelope.message);
                }
            }
        }

        delivered
    }

    fn lose(&mut self, message: OutboundMessage) {
        if let Some(address) = message.announces {
            self.lost_announcements.push(address);
        }
    }
}
