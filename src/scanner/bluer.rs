//! BlueZ D-Bus backend for SwitchBot Meter scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! The meter carries its service data in the scan response, so the backend
//! runs an active LE discovery rather than a passive advertisement monitor.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisement, ScanError};
use crate::decoder::METER_SERVICE_DATA_UUID;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// LE-only discovery reporting every received advertisement.
///
/// BlueZ scans actively during discovery, which requests the scan response.
fn discovery_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    }
}

/// Start scanning for SwitchBot Meter advertisements using BlueZ.
///
/// Discovery stays active until the returned receiver is dropped.
pub async fn start_scan() -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    adapter.set_discovery_filter(discovery_filter()).await?;

    // Changed devices are reported as DeviceAdded as well
    let events = adapter.discover_devices_with_changes().await?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // Spawn a task that owns all Bluetooth state and runs the event loop
    tokio::spawn(async move {
        // Keep the session alive by moving it into this task
        let _session = session;
        let mut events = std::pin::pin!(events);

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Advertisement receiver dropped, stopping BlueZ discovery");
                    break;
                }
                event = events.next() => {
                    let Some(event) = event else { break };
                    let AdapterEvent::DeviceAdded(address) = event else { continue };

                    match read_advertisement(&adapter, address).await {
                        Ok(Some(advertisement)) => {
                            if tx.send(advertisement).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!("Failed to read {address}: {e}"),
                    }
                }
            }
        }
    });

    Ok(rx)
}

/// Read the current service data of a discovered device.
///
/// Returns `None` when the device carries no SwitchBot Meter entry.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Advertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(service_data) = device.service_data().await? else {
        return Ok(None);
    };

    if !service_data.contains_key(&METER_SERVICE_DATA_UUID) {
        return Ok(None);
    }

    Ok(Some(Advertisement {
        address: address.into(),
        service_data,
    }))
}
