//! Decoder for the SwitchBot Meter service-data payload.
//!
//! Byte layout (only bytes 2..=5 carry measurements):
//!
//! | byte | bits | meaning                                   |
//! |------|------|-------------------------------------------|
//! | 2    | 0-6  | battery percent                           |
//! | 3    | 0-3  | temperature tenths                        |
//! | 3    | 4-5  | humidity alert                            |
//! | 3    | 6-7  | temperature alert                         |
//! | 4    | 0-6  | temperature integer part                  |
//! | 4    | 7    | temperature sign (set = positive)         |
//! | 5    | 0-6  | humidity percent                          |
//! | 5    | 7    | temperature scale (set = Fahrenheit)      |
//!
//! See: https://github.com/OpenWonderLabs/python-host/wiki/Meter-BLE-open-API

use crate::measurement::{Measurement, TemperatureScale};
use crate::scanner::Advertisement;
use chrono::Local;
use thiserror::Error;
use uuid::{Uuid, uuid};

/// Service-data UUID tagging SwitchBot Meter payloads (16-bit UUID 0x0D00).
pub const METER_SERVICE_DATA_UUID: Uuid = uuid!("00000d00-0000-1000-8000-00805f9b34fb");

/// Shortest payload that carries every measurement byte.
pub const MIN_PAYLOAD_LEN: usize = 6;

/// Error types for decoding advertisement data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Service data shorter than [`MIN_PAYLOAD_LEN`]
    #[error("Invalid payload: expected at least {MIN_PAYLOAD_LEN} bytes, got {len}")]
    InvalidPayload { len: usize },
    /// Advertisement has no entry for [`METER_SERVICE_DATA_UUID`]
    #[error("Missing service data for {METER_SERVICE_DATA_UUID}")]
    MissingServiceData,
}

/// Pick the SwitchBot Meter entry out of an advertisement's service data.
pub fn meter_service_data(advertisement: &Advertisement) -> Option<&[u8]> {
    advertisement
        .service_data
        .get(&METER_SERVICE_DATA_UUID)
        .map(Vec::as_slice)
}

/// Decode a service-data payload into a [`Measurement`].
///
/// Only masks are applied; out-of-range values (e.g. humidity 127) still
/// decode. When the device reports Fahrenheit, the unsigned magnitude is
/// converted with `c * 1.8 + 32` before the sign is reapplied, so a negative
/// Fahrenheit reading is `-(|c| * 1.8 + 32)` rather than `-|c| * 1.8 + 32`.
pub fn decode_meter_data(data: &[u8]) -> Result<Measurement, DecodeError> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::InvalidPayload { len: data.len() });
    }

    let magnitude = f64::from(data[4] & 0x7F) + f64::from(data[3] & 0x0F) / 10.0;
    let temperature_sign = if data[4] & 0x80 == 0 { -1 } else { 1 };
    let temperature_scale = if data[5] & 0x80 == 0 {
        TemperatureScale::Celsius
    } else {
        TemperatureScale::Fahrenheit
    };
    let temperature_value = match temperature_scale {
        TemperatureScale::Celsius => magnitude,
        TemperatureScale::Fahrenheit => magnitude * 1.8 + 32.0,
    };

    Ok(Measurement {
        battery_percent: data[2] & 0x7F,
        humidity_percent: data[5] & 0x7F,
        temperature_value,
        temperature_sign,
        temperature_scale,
        temperature_alert: (data[3] & 0xC0) >> 6,
        humidity_alert: (data[3] & 0x30) >> 4,
        captured_at: Local::now(),
    })
}
