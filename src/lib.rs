//! `switchbot-meter-bridge` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup,
//! the broker connection and process exit codes. The scan-cycle logic lives in
//! [`crate::app`] where it can be tested deterministically with an injected
//! scanner and broker sink.

pub mod alias;
pub mod app;
pub mod decoder;
pub mod discovery;
pub mod duration;
pub mod mac_address;
pub mod measurement;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use alias::{Alias, AliasMap, parse_alias, to_map};
pub use app::{
    CycleOutcome, Options, RealScanner, RunError, RunSummary, ScanCycleController, Scanner,
    TerminationPolicy,
};
pub use decoder::{DecodeError, decode_meter_data};
pub use discovery::DiscoveryAnnouncer;
pub use duration::parse_duration;
pub use mac_address::MacAddress;
pub use measurement::{Measurement, TemperatureScale};
pub use output::{BrokerSink, Offline, PublishError};
pub use pipeline::{Pipeline, PipelineError};
pub use queue::{OutboundMessage, PublishQueue};
pub use registry::DeviceRegistry;
pub use scanner::{Advertisement, Backend, ScanError};
