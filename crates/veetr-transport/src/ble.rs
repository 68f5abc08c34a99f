//! BLE GATT transport via btleplug.
//!
//! The unit advertises one service with two characteristics: sensor data
//! (notify) carrying telemetry and notices, and command (write) taking
//! commands and control actions.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;
use veetr_core::{Inbound, LinkConfig, Link, LinkError, LinkWriter, Transport};

/// Primary service advertised by the unit.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_1234_1234_1234_5678_9abc);
/// Sensor data characteristic (notify).
pub const SENSOR_DATA_UUID: Uuid = Uuid::from_u128(0x8765_4321_4321_4321_4321_cba9_8765_4321);
/// Command characteristic (write).
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x1111_1111_2222_3333_4444_5555_5555_5555);

/// Advertised name prefix used when no name filter is configured.
pub const DEFAULT_DEVICE_NAME: &str = "Veetr";

const SCAN_POLL: Duration = Duration::from_millis(500);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(2);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Transport that scans for and attaches to a unit over BLE.
pub struct BleTransport {
    config: LinkConfig,
    cancel: watch::Sender<bool>,
}

impl BleTransport {
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self { config, cancel }
    }

    /// Abort a scan in progress. The pending attach fails with
    /// [`LinkError::Cancelled`].
    pub fn cancel_scan(&self) {
        self.cancel.send_replace(true);
    }

    fn name_filter(&self) -> &str {
        self.config
            .device_name
            .as_deref()
            .unwrap_or(DEFAULT_DEVICE_NAME)
    }
}

async fn default_adapter() -> Result<Adapter, LinkError> {
    let manager = Manager::new()
        .await
        .map_err(|e| LinkError::Unavailable(format!("BLE manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| LinkError::Unavailable(format!("Failed to list BLE adapters: {e}")))?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| LinkError::Unavailable("No BLE adapter found".into()))
}

/// Whether an advertisement belongs to a matching unit.
fn matches_unit(name: Option<&str>, services: &[Uuid], filter: &str) -> bool {
    let named = name.is_some_and(|n| n.to_lowercase().contains(&filter.to_lowercase()));
    named || (services.contains(&SERVICE_UUID) && filter == DEFAULT_DEVICE_NAME)
}

async fn find_unit(
    adapter: &Adapter,
    filter: &str,
    timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) -> Result<(Peripheral, Option<String>), LinkError> {
    // Unfiltered scan: some stacks only match UUIDs in the primary
    // advertisement, so filter on the application side.
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| LinkError::Unavailable(format!("Failed to start BLE scan: {e}")))?;
    tracing::info!(filter, "Scanning for unit");

    let deadline = tokio::time::Instant::now() + timeout;
    let found = 'scan: loop {
        if let Ok(peripherals) = adapter.peripherals().await {
            for peripheral in peripherals {
                let Some(props) = peripheral.properties().await.ok().flatten() else {
                    continue;
                };
                if matches_unit(props.local_name.as_deref(), &props.services, filter) {
                    tracing::info!(name = ?props.local_name, rssi = ?props.rssi, "Found unit");
                    break 'scan Ok((peripheral, props.local_name));
                }
            }
        }

        if *cancel.borrow() {
            break Err(LinkError::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            break Err(LinkError::DeviceNotFound(format!(
                "No unit matching '{filter}' found"
            )));
        }
        tokio::select! {
            () = tokio::time::sleep(SCAN_POLL) => {}
            Ok(()) = cancel.changed() => {}
        }
    };

    if let Err(e) = adapter.stop_scan().await {
        tracing::debug!("Failed to stop scan: {e}");
    }
    found
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

/// Forward sensor notifications until the stream ends or the peripheral drops.
fn forward_notifications(peripheral: Peripheral, mut notifications: Notifications) -> Inbound {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);
        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(n) if n.uuid == SENSOR_DATA_UUID => {
                        if tx.send(n.value).is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = watchdog.tick() => {
                    if !peripheral.is_connected().await.unwrap_or(false) {
                        tracing::info!("Watchdog: unit disconnected");
                        break;
                    }
                }
                () = tx.closed() => break,
            }
        }
    });
    UnboundedReceiverStream::new(rx).boxed()
}

#[async_trait]
impl Transport for BleTransport {
    async fn attach(&self) -> Result<Link, LinkError> {
        self.cancel.send_replace(false);
        let adapter = default_adapter().await?;
        let (peripheral, label) = find_unit(
            &adapter,
            self.name_filter(),
            self.config.scan_timeout(),
            self.cancel.subscribe(),
        )
        .await?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::AttachFailed(format!("Failed to connect: {e}")))?;

        match subscribe(&peripheral).await {
            Ok((command, notifications)) => {
                tracing::info!(label = ?label, "Attached to unit");
                let write_type = if command
                    .properties
                    .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
                {
                    WriteType::WithoutResponse
                } else {
                    WriteType::WithResponse
                };
                let inbound = forward_notifications(peripheral.clone(), notifications);
                Ok(Link {
                    label,
                    writer: Arc::new(BleWriter {
                        peripheral,
                        command,
                        write_type,
                    }),
                    inbound,
                })
            }
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }
}

async fn subscribe(peripheral: &Peripheral) -> Result<(Characteristic, Notifications), LinkError> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| LinkError::AttachFailed(format!("Failed to discover services: {e}")))?;

    let sensor = find_characteristic(peripheral, SENSOR_DATA_UUID)
        .ok_or_else(|| LinkError::AttachFailed("Sensor data characteristic not found".into()))?;
    let command = find_characteristic(peripheral, COMMAND_UUID)
        .ok_or_else(|| LinkError::AttachFailed("Command characteristic not found".into()))?;

    // take the stream before subscribing so no early notification is lost
    let notifications = peripheral
        .notifications()
        .await
        .map_err(|e| LinkError::AttachFailed(format!("Failed to open notifications: {e}")))?;
    peripheral
        .subscribe(&sensor)
        .await
        .map_err(|e| LinkError::AttachFailed(format!("Failed to subscribe: {e}")))?;

    Ok((command, notifications))
}

/// Write half of a BLE link.
struct BleWriter {
    peripheral: Peripheral,
    command: Characteristic,
    write_type: WriteType,
}

#[async_trait]
impl LinkWriter for BleWriter {
    async fn write(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.peripheral
            .write(&self.command, payload, self.write_type)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::Write(format!("Failed to disconnect: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "12345678-1234-1234-1234-123456789abc"
        );
        assert_eq!(
            SENSOR_DATA_UUID.to_string(),
            "87654321-4321-4321-4321-cba987654321"
        );
        assert_eq!(
            COMMAND_UUID.to_string(),
            "11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn test_matches_unit() {
        assert!(matches_unit(Some("Veetr"), &[], DEFAULT_DEVICE_NAME));
        assert!(matches_unit(Some("veetr-boat"), &[], DEFAULT_DEVICE_NAME));
        assert!(matches_unit(None, &[SERVICE_UUID], DEFAULT_DEVICE_NAME));
        assert!(!matches_unit(Some("Speaker"), &[], DEFAULT_DEVICE_NAME));
        // a custom name must match by name
        assert!(matches_unit(Some("Blue Moon"), &[SERVICE_UUID], "blue moon"));
        assert!(!matches_unit(None, &[SERVICE_UUID], "Blue Moon"));
    }
}
