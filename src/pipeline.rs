//! Per-advertisement processing: decode, record, announce, queue.

use crate::decoder::{DecodeError, decode_meter_data, meter_service_data};
use crate::discovery::DiscoveryAnnouncer;
use crate::mac_address::MacAddress;
use crate::output::BrokerSink;
use crate::queue::PublishQueue;
use crate::registry::{DeviceRegistry, Observation};
use crate::scanner::Advertisement;
use thiserror::Error;
use tracing::warn;

/// Reasons an advertisement produced no messages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// State owned by the scan loop: known devices, the announcer and the
/// outbound queue.
#[derive(Debug, Default)]
pub struct Pipeline {
    registry: DeviceRegistry,
    announcer: DiscoveryAnnouncer,
    queue: PublishQueue,
}

impl Pipeline {
    pub fn new(announcer: DiscoveryAnnouncer, queue: PublishQueue) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            announcer,
            queue,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }

    /// Drain the queue into `sink` and return the number delivered.
    ///
    /// Devices whose discovery message was dropped are announced again on
    /// their next advertisement.
    pub async fn drain(&mut self, sink: &mut dyn BrokerSink) -> usize {
        let delivered = self.queue.drain(sink).await;
        self.reannounce_lost();
        delivered
    }

    fn reannounce_lost(&mut self) {
        for address in self.queue.take_lost_announcements() {
            if self.registry.clear_announced(&address) {
                warn!("Discovery message for {address} was lost, announcing again");
            }
        }
    }

    /// Process one advertisement to completion.
    ///
    /// Every payload is built before any state changes, so on error the
    /// registry and queue are exactly as they were. For a device without a
    /// queued discovery message, the discovery message is queued ahead of the
    /// state message.
    pub fn handle(&mut self, advertisement: &Advertisement) -> Result<Observation, PipelineError> {
        let data = meter_service_data(advertisement).ok_or(DecodeError::MissingServiceData)?;
        let measurement = decode_meter_data(data)?;
        let address: MacAddress = advertisement.address;

        let discovery = if self.registry.is_announced(&address) {
            None
        } else {
            Some(
                self.announcer
                    .announce(&address, measurement.temperature_scale)?,
            )
        };
        let state = self.announcer.state(&address, &measurement)?;

        let observation = self.registry.observe(address, measurement);
        if let Some(discovery) = discovery {
            self.queue.enqueue(discovery);
            self.registry.mark_announced(&address);
        }
        self.queue.enqueue(state);
        self.reannounce_lost();

        Ok(observation)
    }
}
