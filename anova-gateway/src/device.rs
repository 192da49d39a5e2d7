//! Per-appliance state machine: handshake, heartbeat, command dispatch and
//! event handling, all funneling into a single mirrored [`DeviceState`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use anova_protocol::command::{DeviceStatus, Response};
use anova_protocol::{parse_event, Command, Event, EventOriginator, TemperatureUnit};

use crate::connection::Connection;
use crate::error::ConnectionError;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Live, in-memory mirror of one appliance's reported state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceState {
    pub status: StatusValue,
    pub current_temperature: f32,
    pub target_temperature: f32,
    pub timer_running: bool,
    pub timer_value: u32,
    pub unit: Option<UnitValue>,
    pub speaker_status: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            status: StatusValue::Stopped,
            current_temperature: 0.0,
            target_temperature: 0.0,
            timer_running: false,
            timer_value: 0,
            unit: None,
            speaker_status: false,
        }
    }
}

/// Serde-friendly mirror of [`DeviceStatus`] with the wire-level wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusValue {
    Running,
    Stopped,
    LowWater,
    HeaterError,
    PowerLoss,
    UserChangeParameter,
}

impl From<DeviceStatus> for StatusValue {
    fn from(s: DeviceStatus) -> Self {
        match s {
            DeviceStatus::Running => StatusValue::Running,
            DeviceStatus::Stopped => StatusValue::Stopped,
            DeviceStatus::LowWater => StatusValue::LowWater,
            DeviceStatus::HeaterError => StatusValue::HeaterError,
            DeviceStatus::PowerLoss => StatusValue::PowerLoss,
            DeviceStatus::UserChangeParameter => StatusValue::UserChangeParameter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitValue {
    C,
    F,
}

impl From<TemperatureUnit> for UnitValue {
    fn from(u: TemperatureUnit) -> Self {
        match u {
            TemperatureUnit::Celsius => UnitValue::C,
            TemperatureUnit::Fahrenheit => UnitValue::F,
        }
    }
}

/// A raw event plus its parsed classification, handed to subscribers.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub originator: EventOriginator,
    pub kind: Event,
}

/// A callback's own work, boxed so it can be awaited in place instead of
/// detached onto another task -- detaching it would let two notifications
/// for the same device race each other through the scheduler and arrive
/// out of the order their wire causes occurred in.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type StateChangeCallback = Arc<dyn Fn(&str, DeviceState) -> BoxFuture + Send + Sync>;
type EventCallback = Arc<dyn Fn(&str, DeviceEvent) -> BoxFuture + Send + Sync>;

/// One connected appliance: its identity, connection, and mirrored state.
pub struct Device {
    pub id_card: String,
    pub version: String,
    pub secret_key: String,
    connection: Arc<Connection>,
    state: RwLock<DeviceState>,
    state_change_cb: Mutex<Option<StateChangeCallback>>,
    event_cb: Mutex<Option<EventCallback>>,
}

impl Device {
    /// Run the handshake over `connection` and construct the Device.
    ///
    /// `events` is the connection's raw event-line stream; a background
    /// task is spawned to drain it into [`Device::handle_event`] for the
    /// lifetime of the returned `Arc`.
    pub async fn handshake(
        connection: Connection,
        mut events: mpsc::UnboundedReceiver<String>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let connection = Arc::new(connection);

        let id_card = match connection.send_command(&Command::GetIdCard.encode().unwrap()).await {
            Ok(raw) => match Command::GetIdCard.decode(&raw) {
                Ok(Response::IdCard(id)) => id,
                _ => return Err(ConnectionError::Closed),
            },
            Err(e) => return Err(e),
        };
        let version = decode_string(&connection, Command::GetVersion).await?;
        let secret_key = decode_string(&connection, Command::GetSecretKey).await?;
        let initial_status = match connection.send_command(&Command::GetDeviceStatus.encode().unwrap()).await {
            Ok(raw) => match Command::GetDeviceStatus.decode(&raw) {
                Ok(Response::Status(s)) => s,
                _ => return Err(ConnectionError::Closed),
            },
            Err(e) => return Err(e),
        };

        let device = Arc::new(Device {
            id_card: id_card.clone(),
            version,
            secret_key,
            connection,
            state: RwLock::new(DeviceState { status: initial_status.into(), ..Default::default() }),
            state_change_cb: Mutex::new(None),
            event_cb: Mutex::new(None),
        });

        let event_device = device.clone();
        tokio::spawn(async move {
            while let Some(line) = events.recv().await {
                event_device.handle_event_line(&line).await;
            }
        });

        info!(id = %device.id_card, version = %device.version, "appliance handshake complete");
        Ok(device)
    }

    pub async fn snapshot(&self) -> DeviceState {
        self.state.read().await.clone()
    }

    pub async fn set_state_change_callback(&self, cb: StateChangeCallback) {
        *self.state_change_cb.lock().await = Some(cb);
    }

    pub async fn set_event_callback(&self, cb: EventCallback) {
        *self.event_cb.lock().await = Some(cb);
    }

    pub async fn clear_callbacks(&self) {
        *self.state_change_cb.lock().await = None;
        *self.event_cb.lock().await = None;
    }

    /// One heartbeat pass: the fixed read-only query sequence from §4.5.
    pub async fn heartbeat(&self) -> Result<(), ConnectionError> {
        for cmd in [
            Command::GetDeviceStatus,
            Command::GetTargetTemperature,
            Command::GetCurrentTemperature,
            Command::GetTemperatureUnit,
            Command::GetTimerStatus,
            Command::GetSpeakerStatus,
        ] {
            match self.dispatch(cmd).await {
                Ok(_) => {}
                Err(ConnectionError::Closed) => {
                    warn!(id = %self.id_card, "connection reset during heartbeat, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a command over Wi-Fi, decode its response, apply the implied
    /// state update, and notify the state-change subscriber.
    pub async fn dispatch(&self, cmd: Command) -> Result<Response, ConnectionError> {
        if !cmd.supports_wifi() {
            return Err(ConnectionError::Protocol(anova_protocol::ProtocolError::TransportUnsupported));
        }
        let text = cmd.encode().map_err(ConnectionError::Protocol)?;
        let raw = self.connection.send_command(&text).await?;
        let response = cmd.decode(&raw).map_err(ConnectionError::Protocol)?;
        self.apply_response(&cmd, &response).await;
        Ok(response)
    }

    async fn apply_response(&self, cmd: &Command, response: &Response) {
        let mut changed = true;
        {
            let mut state = self.state.write().await;
            match (cmd, response) {
                (Command::GetDeviceStatus, Response::Status(s)) => state.status = (*s).into(),
                (Command::GetCurrentTemperature, Response::Temperature(t)) => state.current_temperature = *t,
                (Command::GetTargetTemperature, Response::Temperature(t))
                | (Command::SetTargetTemperature { .. }, Response::Temperature(t)) => {
                    state.target_temperature = *t
                }
                (Command::GetTemperatureUnit, Response::Unit(u))
                | (Command::SetTemperatureUnit { .. }, Response::Unit(u)) => state.unit = Some((*u).into()),
                (Command::GetTimerStatus, Response::Timer { running, minutes }) => {
                    state.timer_value = *minutes;
                    state.timer_running = *running;
                }
                (Command::SetTimer { minutes }, _) => state.timer_value = *minutes,
                (Command::GetSpeakerStatus, Response::SpeakerStatus(on)) => state.speaker_status = *on,
                _ => changed = false,
            }
        }
        if changed {
            self.notify_state_change().await;
        }
    }

    async fn handle_event_line(&self, line: &str) {
        let (originator, kind) = match parse_event(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(id = %self.id_card, error = %e, "dropping unparseable event");
                return;
            }
        };

        let mut changed = true;
        {
            let mut state = self.state.write().await;
            match kind {
                Event::TempReached => state.current_temperature = state.target_temperature,
                Event::LowWater => state.status = StatusValue::LowWater,
                Event::Start => state.status = StatusValue::Running,
                Event::Stop => state.status = StatusValue::Stopped,
                Event::TimeStart => state.timer_running = true,
                Event::TimeStop | Event::TimeFinish => state.timer_running = false,
                Event::ChangeTemp | Event::ChangeParam => changed = false,
            }
        }

        if changed {
            self.notify_state_change().await;
        }

        if let Some(cb) = self.event_cb.lock().await.clone() {
            cb(&self.id_card, DeviceEvent { originator, kind }).await;
        }
    }

    async fn notify_state_change(&self) {
        if let Some(cb) = self.state_change_cb.lock().await.clone() {
            let snapshot = self.snapshot().await;
            cb(&self.id_card, snapshot).await;
        }
    }

    pub async fn close(&self) {
        self.clear_callbacks().await;
        self.connection.close().await;
    }
}

async fn decode_string(connection: &Connection, cmd: Command) -> Result<String, ConnectionError> {
    let raw = connection.send_command(&cmd.encode().unwrap()).await?;
    match cmd.decode(&raw) {
        Ok(Response::Version(s)) | Ok(Response::SecretKey(s)) | Ok(Response::IdCard(s)) => Ok(s),
        _ => Err(ConnectionError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn handshake_pair(responses: &[&str]) -> (Arc<Device>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_fut = listener.accept();
        let connect_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept_fut, connect_fut);
        let (mut appliance, _) = accepted.unwrap();
        let client = client.unwrap();

        let responses: Vec<String> = responses.iter().map(|s| s.to_string()).collect();
        let appliance_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            for resp in responses {
                let _n = appliance.read(&mut buf).await.unwrap();
                appliance.write_all(&anova_protocol::encode(&resp)).await.unwrap();
            }
            appliance
        });

        let (connection, events) = Connection::new(client).unwrap();
        let device = Device::handshake(connection, events).await.unwrap();
        let appliance = appliance_task.await.unwrap();
        (device, appliance)
    }

    #[tokio::test]
    async fn handshake_populates_identity_and_initial_status() {
        let (device, _appliance) =
            handshake_pair(&["anova abcdef", "1.0.0", "a1b2c3d4e5", "stopped"]).await;
        assert_eq!(device.id_card, "abcdef");
        assert_eq!(device.version, "1.0.0");
        assert_eq!(device.secret_key, "a1b2c3d4e5");
        assert_eq!(device.snapshot().await.status, StatusValue::Stopped);
    }

    #[tokio::test]
    async fn low_water_event_updates_status() {
        let (device, mut appliance) =
            handshake_pair(&["anova abcdef", "1.0.0", "a1b2c3d4e5", "stopped"]).await;

        appliance.write_all(&anova_protocol::encode("event low water")).await.unwrap();
        // Give the event-draining task a chance to run.
        for _ in 0..50 {
            if device.snapshot().await.status == StatusValue::LowWater {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(device.snapshot().await.status, StatusValue::LowWater);
    }
}
