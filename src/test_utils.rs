use crate::decoder::METER_SERVICE_DATA_UUID;
use crate::mac_address::MacAddress;
use crate::measurement::{Measurement, TemperatureScale};
use crate::output::{BrokerSink, PublishError, PublishFuture};
use crate::queue::OutboundMessage;
use crate::scanner::Advertisement;
use chrono::{DateTime, Local, TimeZone};
use std::collections::HashMap;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// 2024-05-01 12:34:56 local time.
pub fn fixed_time() -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap()
}

/// A zeroed, positive Celsius reading captured at [`fixed_time`].
///
/// Tests can override just the fields they care about.
pub fn base_measurement() -> Measurement {
    Measurement {
        battery_percent: 0,
        humidity_percent: 0,
        temperature_value: 0.0,
        temperature_sign: 1,
        temperature_scale: TemperatureScale::Celsius,
        temperature_alert: 0,
        humidity_alert: 0,
        captured_at: fixed_time(),
    }
}

/// An advertisement carrying `payload` under the meter service-data UUID.
pub fn advertisement(address: MacAddress, payload: &[u8]) -> Advertisement {
    Advertisement {
        address,
        service_data: HashMap::from([(METER_SERVICE_DATA_UUID, payload.to_vec())]),
    }
}

/// Broker sink that records what it was asked to publish.
#[derive(Debug)]
pub struct RecordingSink {
    pub available: bool,
    pub fail_topics: Vec<String>,
    pub published: Vec<OutboundMessage>,
    pub attempts: usize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            available: true,
            fail_topics: Vec::new(),
            published: Vec::new(),
            attempts: 0,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Make every publish to `topic` fail.
    pub fn failing_on(mut self, topic: &str) -> Self {
        self.fail_topics.push(topic.to_string());
        self
    }

    pub fn topics(&self) -> Vec<String> {
        self.published.iter().map(|m| m.topic.clone()).collect()
    }
}

impl BrokerSink for RecordingSink {
    fn is_available(&self) -> bool {
        self.available
    }

    fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> PublishFuture<'a> {
        Box::pin(async move {
            self.attempts += 1;
            if self.fail_topics.contains(&message.topic) {
                return Err(PublishError::BrokerUnavailable);
            }
            self.published.push(message.clone());
            Ok(())
        })
    }
}
