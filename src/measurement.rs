//! SwitchBot Meter measurement data structure.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// Timestamp layout used in state payloads (local time).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Temperature scale selected on the device display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemperatureScale {
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
}

impl TemperatureScale {
    /// Unit string announced to Home Assistant.
    pub fn unit(self) -> &'static str {
        match self {
            TemperatureScale::Celsius => "°C",
            TemperatureScale::Fahrenheit => "°F",
        }
    }
}

impl fmt::Display for TemperatureScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemperatureScale::Celsius => write!(f, "C"),
            TemperatureScale::Fahrenheit => write!(f, "F"),
        }
    }
}

/// A decoded reading from a SwitchBot Meter advertisement.
///
/// The temperature is kept in the three parts the device encodes:
/// `temperature_value` is the unsigned magnitude, already converted to
/// Fahrenheit when the device reports that scale, and `temperature_sign` is
/// applied afterwards. See [`crate::decoder::decode_meter_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Battery level in percent (0-100)
    pub battery_percent: u8,
    /// Relative humidity in percent (0-100)
    pub humidity_percent: u8,
    /// Unsigned temperature magnitude in `temperature_scale`
    pub temperature_value: f64,
    /// +1 or -1
    pub temperature_sign: i8,
    pub temperature_scale: TemperatureScale,
    /// Temperature alert state (0-3)
    pub temperature_alert: u8,
    /// Humidity alert state (0-3)
    pub humidity_alert: u8,
    /// When the advertisement was decoded
    pub captured_at: DateTime<Local>,
}

impl Measurement {
    /// Signed temperature in `temperature_scale`.
    pub fn temperature(&self) -> f64 {
        f64::from(self.temperature_sign) * self.temperature_value
    }

    pub fn human_readable(&self) -> HumanReadable {
        HumanReadable {
            temperature: format!("{:3.1}°{}", self.temperature(), self.temperature_scale),
            humidity: format!("{}%", self.humidity_percent),
            battery: format!("{}%", self.battery_percent),
        }
    }

    /// JSON body published on the device's state topic.
    pub fn state_payload(&self) -> StatePayload {
        StatePayload {
            alerts: Alerts {
                temperature_alert: self.temperature_alert,
                humidity_alert: self.humidity_alert,
            },
            raw_values: RawValues {
                battery_value: self.battery_percent,
                humidity_value: self.humidity_percent,
                temperature_scale: self.temperature_scale,
                temperature_sign: self.temperature_sign,
                temperature_value: self.temperature_value,
            },
            human_readable: self.human_readable(),
            timestamp: self.captured_at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alerts {
    pub temperature_alert: u8,
    pub humidity_alert: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawValues {
    pub battery_value: u8,
    pub humidity_value: u8,
    pub temperature_scale: TemperatureScale,
    pub temperature_sign: i8,
    pub temperature_value: f64,
}

/// Display strings such as `21.3°C`, `45%`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HumanReadable {
    pub temperature: String,
    pub humidity: String,
    pub battery: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePayload {
    pub alerts: Alerts,
    pub raw_values: RawValues,
    pub human_readable: HumanReadable,
    pub timestamp: String,
}
