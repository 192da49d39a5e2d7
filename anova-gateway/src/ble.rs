//! BLE provisioning client: scan for an advertising appliance, open a
//! session-scoped GATT connection, and exchange line-based commands over a
//! single read-notify-write characteristic.

use std::time::Duration;

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use anova_protocol::{Command, Response};

use crate::error::GatewayError;

const DEVICE_NAME: &str = "Anova";
const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

const SCAN_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Summary of a discovered appliance, enough to identify it over HTTP.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BleDeviceInfo {
    pub address: String,
    pub name: String,
}

/// Scan for the first advertising Anova appliance.
pub async fn scan() -> Result<BleDeviceInfo, GatewayError> {
    let peripheral = discover().await?;
    let properties = peripheral
        .properties()
        .await
        .map_err(|e| GatewayError::Bluetooth(e.to_string()))?
        .ok_or(GatewayError::BleDeviceNotFound)?;
    Ok(BleDeviceInfo {
        address: peripheral.address().to_string(),
        name: properties.local_name.unwrap_or_default(),
    })
}

async fn discover() -> Result<Peripheral, GatewayError> {
    let manager = Manager::new().await.map_err(|e| GatewayError::Bluetooth(e.to_string()))?;
    let adapters = manager.adapters().await.map_err(|e| GatewayError::Bluetooth(e.to_string()))?;
    let adapter = adapters.into_iter().next().ok_or_else(|| {
        GatewayError::Bluetooth("no bluetooth adapter available".to_string())
    })?;

    adapter
        .start_scan(ScanFilter { services: vec![SERVICE_UUID] })
        .await
        .map_err(|e| GatewayError::Bluetooth(e.to_string()))?;
    tokio::time::sleep(SCAN_TIMEOUT).await;
    let peripherals = adapter.peripherals().await.map_err(|e| GatewayError::Bluetooth(e.to_string()))?;
    let _ = adapter.stop_scan().await;

    for peripheral in peripherals {
        if let Ok(Some(props)) = peripheral.properties().await {
            if props.local_name.as_deref() == Some(DEVICE_NAME) {
                return Ok(peripheral);
            }
        }
    }
    Err(GatewayError::BleDeviceNotFound)
}

/// A session-scoped BLE connection to one appliance: connect on
/// construction, disconnect on drop via [`BleSession::close`], guaranteed
/// called on every exit path by callers using it inside a short scope.
pub struct BleSession {
    peripheral: Peripheral,
    characteristic: Characteristic,
    command_lock: Mutex<()>,
}

impl BleSession {
    pub async fn open() -> Result<Self, GatewayError> {
        let peripheral = discover().await?;
        peripheral.connect().await.map_err(|e| GatewayError::Bluetooth(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| GatewayError::Bluetooth(e.to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .ok_or_else(|| GatewayError::Bluetooth("ffe1 characteristic not found".to_string()))?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| GatewayError::Bluetooth(e.to_string()))?;

        Ok(BleSession { peripheral, characteristic, command_lock: Mutex::new(()) })
    }

    /// Send a [`Command`] and decode its response. Fails before touching the
    /// radio if the command is not BLE-supported.
    pub async fn send(&self, command: &Command) -> Result<Response, GatewayError> {
        if !command.supports_ble() {
            return Err(GatewayError::BadRequest(
                "command not supported on this transport".to_string(),
            ));
        }
        let text = command
            .encode()
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let raw = self.send_raw(&text).await?;
        command.decode(&raw).map_err(|e| GatewayError::BadRequest(e.to_string()))
    }

    async fn send_raw(&self, text: &str) -> Result<String, GatewayError> {
        let _guard = self.command_lock.lock().await;

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| GatewayError::Bluetooth(e.to_string()))?;

        let payload = format!("{text}\r").into_bytes();
        self.peripheral
            .write(&self.characteristic, &payload, WriteType::WithoutResponse)
            .await
            .map_err(|e| GatewayError::Bluetooth(e.to_string()))?;

        let mut buffer = Vec::new();
        let collect = async {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != CHARACTERISTIC_UUID {
                    continue;
                }
                buffer.extend_from_slice(&notification.value);
                if buffer.contains(&b'\r') {
                    break;
                }
            }
        };

        tokio::time::timeout(COMMAND_TIMEOUT, collect)
            .await
            .map_err(|_| GatewayError::Bluetooth("BLE command timed out".to_string()))?;

        let text = String::from_utf8_lossy(&buffer);
        Ok(text.trim_end_matches('\r').to_string())
    }

    /// Disconnect on every exit path; safe to call more than once.
    pub async fn close(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            debug!(error = %e, "error disconnecting BLE session");
        }
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        let peripheral = self.peripheral.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!(error = %e, "error disconnecting BLE session on drop");
            }
        });
    }
}
