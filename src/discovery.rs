//! Home Assistant MQTT discovery and state messages.
//!
//! Each meter is exposed as one temperature sensor entity:
//!
//! - `{prefix}/sensor/{ID}_T/config` - discovery message, sent once per device
//! - `{prefix}/sensor/{ID}_T/state` - latest reading as JSON
//!
//! where `{ID}` is the device address without separators and `{prefix}`
//! defaults to `homeassistant`.

use crate::alias::AliasMap;
use crate::mac_address::MacAddress;
use crate::measurement::{Measurement, TemperatureScale};
use crate::queue::OutboundMessage;
use serde::Serialize;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Template extracting the signed temperature from a state payload.
pub const TEMPERATURE_VALUE_TEMPLATE: &str =
    "{{ value_json.raw_values.temperature_sign * value_json.raw_values.temperature_value }}";

#[derive(Debug, Serialize)]
struct DiscoveryPayload<'a> {
    device_class: &'static str,
    name: String,
    state_topic: &'a str,
    unit_of_measurement: &'static str,
    unique_id: String,
    value_template: &'static str,
}

/// Builds the topics and payloads for one discovery prefix.
#[derive(Debug, Clone)]
pub struct DiscoveryAnnouncer {
    prefix: String,
    aliases: AliasMap,
}

impl Default for DiscoveryAnnouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_PREFIX.to_string(), AliasMap::new())
    }
}

impl DiscoveryAnnouncer {
    pub fn new(prefix: String, aliases: AliasMap) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            aliases,
        }
    }

    fn object_id(address: &MacAddress) -> String {
        format!("{}_T", address.compact())
    }

    pub fn config_topic(&self, address: &MacAddress) -> String {
        format!("{}/sensor/{}/config", self.prefix, Self::object_id(address))
    }

    pub fn state_topic(&self, address: &MacAddress) -> String {
        format!("{}/sensor/{}/state", self.prefix, Self::object_id(address))
    }

    /// Entity name: the alias when one is configured.
    pub fn name(&self, address: &MacAddress) -> String {
        self.aliases
            .get(address)
            .cloned()
            .unwrap_or_else(|| format!("{} Temperature", address.compact()))
    }

    /// Discovery message for a device seen for the first time.
    ///
    /// `scale` comes from the device's first reading and fixes the unit
    /// announced for the entity.
    pub fn announce(
        &self,
        address: &MacAddress,
        scale: TemperatureScale,
    ) -> Result<OutboundMessage, serde_json::Error> {
        let state_topic = self.state_topic(address);
        let payload = DiscoveryPayload {
            device_class: "temperature",
            name: self.name(address),
            state_topic: &state_topic,
            unit_of_measurement: scale.unit(),
            unique_id: Self::object_id(address),
            value_template: TEMPERATURE_VALUE_TEMPLATE,
        };
        OutboundMessage::json(self.config_topic(address), &payload)
            .map(|message| message.announcing(*address))
    }

    /// State message carrying `measurement`.
    pub fn state(
        &self,
        address: &MacAddress,
        measurement: &Measurement,
    ) -> Result<OutboundMessage, serde_json::Error> {
        OutboundMessage::json(self.state_topic(address), &measurement.state_payload())
    }
}
