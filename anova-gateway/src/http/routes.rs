//! Route handlers: one per entry in the external-interface table. Each is a
//! thin translation of a Device/Manager/BLE operation into JSON.

use std::convert::Infallible;
use std::net::UdpSocket;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};

use anova_protocol::command::{Command, Response, TemperatureUnit};

use crate::ble::{self, BleSession};
use crate::device::{DeviceState, UnitValue};
use crate::error::GatewayError;
use crate::http::auth::{verify_device_secret, AdminAuth, DeviceSecret};
use crate::http::AppState;
use crate::sse::SseEvent;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:id/state", get(device_state))
        .route("/devices/:id/target_temperature", post(set_target_temperature).get(get_target_temperature))
        .route("/devices/:id/start", post(start_device))
        .route("/devices/:id/stop", post(stop_device))
        .route("/devices/:id/timer", post(set_timer).get(get_timer))
        .route("/devices/:id/timer/start", post(start_timer))
        .route("/devices/:id/timer/stop", post(stop_timer))
        .route("/devices/:id/alarm/clear", post(clear_alarm))
        .route("/devices/:id/temperature", get(get_current_temperature))
        .route("/devices/:id/unit", get(get_unit).post(set_unit))
        .route("/devices/:id/speaker_status", get(get_speaker_status))
        .route("/devices/:id/sse", get(device_sse))
        .route("/server_info", get(server_info))
        .route("/ble/device", get(ble_device))
        .route("/ble/connect_wifi", post(ble_connect_wifi))
        .route("/ble/config_wifi_server", post(ble_config_wifi_server))
        .route("/ble/restore_wifi_server", post(ble_restore_wifi_server))
        .route("/ble/", get(ble_info))
        .route("/ble/secret_key", post(ble_secret_key))
        .with_state(state)
}

#[derive(Serialize)]
struct DeviceSummary {
    id: String,
    version: String,
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceSummary>> {
    let devices = state.manager.list_devices().await;
    Json(
        devices
            .into_iter()
            .map(|d| DeviceSummary { id: d.id_card.clone(), version: d.version.clone() })
            .collect(),
    )
}

async fn require_device(
    state: &AppState,
    id: &str,
    secret: &DeviceSecret,
) -> Result<std::sync::Arc<crate::device::Device>, GatewayError> {
    verify_device_secret(state, id, secret).await?;
    state.manager.get_device(id).await.ok_or_else(|| GatewayError::DeviceNotFound(id.to_string()))
}

async fn device_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Json<DeviceState>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    Ok(Json(device.snapshot().await))
}

#[derive(Deserialize)]
struct FromStateQuery {
    #[serde(default)]
    from_state: bool,
}

#[derive(Deserialize)]
struct TargetTemperatureBody {
    temperature: f32,
}

#[derive(Serialize)]
struct ChangedTo {
    changed_to: f32,
}

async fn set_target_temperature(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Json(body): Json<TargetTemperatureBody>,
) -> Result<Json<ChangedTo>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let unit = device.snapshot().await.unit.map(|u| match u {
        UnitValue::C => TemperatureUnit::Celsius,
        UnitValue::F => TemperatureUnit::Fahrenheit,
    });
    let response = device
        .dispatch(Command::SetTargetTemperature { value: body.temperature, unit })
        .await
        .map_err(GatewayError::Connection)?;
    match response {
        Response::Temperature(t) => Ok(Json(ChangedTo { changed_to: t })),
        _ => Err(GatewayError::BadRequest("unexpected response".to_string())),
    }
}

#[derive(Serialize)]
struct TemperatureResponse {
    temperature: f32,
}

async fn get_target_temperature(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Query(q): Query<FromStateQuery>,
) -> Result<Json<TemperatureResponse>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let temperature = if q.from_state {
        device.snapshot().await.target_temperature
    } else {
        match device.dispatch(Command::GetTargetTemperature).await.map_err(GatewayError::Connection)? {
            Response::Temperature(t) => t,
            _ => return Err(GatewayError::BadRequest("unexpected response".to_string())),
        }
    };
    Ok(Json(TemperatureResponse { temperature }))
}

async fn get_current_temperature(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Query(q): Query<FromStateQuery>,
) -> Result<Json<TemperatureResponse>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let temperature = if q.from_state {
        device.snapshot().await.current_temperature
    } else {
        match device.dispatch(Command::GetCurrentTemperature).await.map_err(GatewayError::Connection)? {
            Response::Temperature(t) => t,
            _ => return Err(GatewayError::BadRequest("unexpected response".to_string())),
        }
    };
    Ok(Json(TemperatureResponse { temperature }))
}

async fn start_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Json<&'static str>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    ok_or_bad_request(device.dispatch(Command::StartDevice).await.map_err(GatewayError::Connection)?)
}

async fn stop_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Json<&'static str>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    ok_or_bad_request(device.dispatch(Command::StopDevice).await.map_err(GatewayError::Connection)?)
}

fn ok_or_bad_request(response: Response) -> Result<Json<&'static str>, GatewayError> {
    match response {
        Response::Ack(true) => Ok(Json("ok")),
        Response::Ack(false) => Err(GatewayError::BadRequest("appliance rejected command".to_string())),
        _ => Err(GatewayError::BadRequest("unexpected response".to_string())),
    }
}

#[derive(Deserialize)]
struct TimerBody {
    minutes: u32,
}

#[derive(Serialize)]
struct TimerSetResponse {
    message: &'static str,
    minutes: u32,
}

async fn set_timer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Json(body): Json<TimerBody>,
) -> Result<Json<TimerSetResponse>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    device
        .dispatch(Command::SetTimer { minutes: body.minutes })
        .await
        .map_err(GatewayError::Connection)?;
    Ok(Json(TimerSetResponse { message: "timer set", minutes: body.minutes }))
}

async fn start_timer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Json<&'static str>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    ok_or_bad_request(device.dispatch(Command::StartTimer).await.map_err(GatewayError::Connection)?)
}

async fn stop_timer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Json<&'static str>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    ok_or_bad_request(device.dispatch(Command::StopTimer).await.map_err(GatewayError::Connection)?)
}

async fn clear_alarm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Json<&'static str>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    ok_or_bad_request(device.dispatch(Command::ClearAlarm).await.map_err(GatewayError::Connection)?)
}

#[derive(Serialize)]
struct UnitResponse {
    unit: Option<&'static str>,
}

async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Query(q): Query<FromStateQuery>,
) -> Result<Json<UnitResponse>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let unit = if q.from_state {
        device.snapshot().await.unit
    } else {
        match device.dispatch(Command::GetTemperatureUnit).await.map_err(GatewayError::Connection)? {
            Response::Unit(u) => Some(u.into()),
            _ => return Err(GatewayError::BadRequest("unexpected response".to_string())),
        }
    };
    Ok(Json(UnitResponse { unit: unit.map(unit_str) }))
}

fn unit_str(u: UnitValue) -> &'static str {
    match u {
        UnitValue::C => "c",
        UnitValue::F => "f",
    }
}

#[derive(Deserialize)]
struct SetUnitBody {
    unit: String,
}

async fn set_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Json(body): Json<SetUnitBody>,
) -> Result<Json<&'static str>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let unit = match body.unit.to_ascii_lowercase().as_str() {
        "c" => TemperatureUnit::Celsius,
        "f" => TemperatureUnit::Fahrenheit,
        other => return Err(GatewayError::BadRequest(format!("unknown unit {other}"))),
    };
    device.dispatch(Command::SetTemperatureUnit { unit }).await.map_err(GatewayError::Connection)?;
    Ok(Json("ok"))
}

#[derive(Serialize)]
struct TimerResponse {
    minutes: u32,
    running: bool,
}

async fn get_timer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Query(q): Query<FromStateQuery>,
) -> Result<Json<TimerResponse>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let timer = if q.from_state {
        let snapshot = device.snapshot().await;
        TimerResponse { minutes: snapshot.timer_value, running: snapshot.timer_running }
    } else {
        match device.dispatch(Command::GetTimerStatus).await.map_err(GatewayError::Connection)? {
            Response::Timer { running, minutes } => TimerResponse { minutes, running },
            _ => return Err(GatewayError::BadRequest("unexpected response".to_string())),
        }
    };
    Ok(Json(timer))
}

#[derive(Serialize)]
struct SpeakerStatusResponse {
    speaker_status: bool,
}

async fn get_speaker_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
    Query(q): Query<FromStateQuery>,
) -> Result<Json<SpeakerStatusResponse>, GatewayError> {
    let device = require_device(&state, &id, &secret).await?;
    let speaker_status = if q.from_state {
        device.snapshot().await.speaker_status
    } else {
        match device.dispatch(Command::GetSpeakerStatus).await.map_err(GatewayError::Connection)? {
            Response::SpeakerStatus(on) => on,
            _ => return Err(GatewayError::BadRequest("unexpected response".to_string())),
        }
    };
    Ok(Json(SpeakerStatusResponse { speaker_status }))
}

async fn device_sse(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: DeviceSecret,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    verify_device_secret(&state, &id, &secret).await?;
    let (subscriber_id, queue) = state.sse.connect(&id).await;
    let sse_hub = state.sse.clone();
    let device_id = id.clone();

    let stream = async_stream::stream! {
        loop {
            match tokio::time::timeout(crate::sse::PING_INTERVAL, queue.recv()).await {
                Ok(Some(event)) => {
                    yield Ok(to_sse_event(event));
                }
                Ok(None) => break,
                Err(_) => yield Ok(to_sse_event(SseEvent::ping())),
            }
        }
        sse_hub.disconnect(&device_id, subscriber_id).await;
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: SseEvent) -> Event {
    Event::default().event(event.event_type).json_data(event.payload).unwrap_or_else(|_| Event::default())
}

#[derive(Serialize)]
struct ServerInfo {
    host: String,
    port: u16,
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(ServerInfo { host: local_ip(), port: state.settings.server_port })
}

/// Discover this host's outward-facing IP the way the appliance itself
/// would see us: connect a UDP socket to a routable address and read back
/// the local address the kernel picked, without sending any packets.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

async fn ble_device(_admin: AdminAuth) -> Result<Json<ble::BleDeviceInfo>, GatewayError> {
    Ok(Json(ble::scan().await?))
}

#[derive(Deserialize)]
struct ConnectWifiBody {
    ssid: String,
    password: String,
}

async fn ble_connect_wifi(Json(body): Json<ConnectWifiBody>) -> Result<Json<&'static str>, GatewayError> {
    let session = BleSession::open().await?;
    let result = session
        .send(&Command::SetWifiCredentials { ssid: body.ssid, password: body.password })
        .await;
    session.close().await;
    result?;
    Ok(Json("ok"))
}

#[derive(Deserialize, Default)]
struct ConfigWifiServerBody {
    host: Option<String>,
    port: Option<u16>,
}

async fn ble_config_wifi_server(
    State(state): State<AppState>,
    _admin: AdminAuth,
    body: Option<Json<ConfigWifiServerBody>>,
) -> Result<Json<&'static str>, GatewayError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let host = body.host.unwrap_or_else(local_ip);
    let port = body.port.unwrap_or(state.settings.server_port);

    let session = BleSession::open().await?;
    let result = session.send(&Command::SetServerInfo { host, port }).await;
    session.close().await;
    match result? {
        Response::Ack(true) => Ok(Json("ok")),
        _ => Err(GatewayError::BadRequest("appliance did not echo server info".to_string())),
    }
}

async fn ble_restore_wifi_server(_admin: AdminAuth) -> Result<Json<&'static str>, GatewayError> {
    let session = BleSession::open().await?;
    let result = session
        .send(&Command::SetServerInfo { host: "pc.anovaculinary.com".to_string(), port: 8080 })
        .await;
    session.close().await;
    result?;
    Ok(Json("ok"))
}

#[derive(Serialize)]
struct BleInfo {
    ble_address: String,
    ble_name: String,
    version: String,
    id_card: String,
    temperature_unit: Option<&'static str>,
    speaker_status: bool,
}

async fn ble_info(_admin: AdminAuth) -> Result<Json<BleInfo>, GatewayError> {
    let device = ble::scan().await?;
    let session = BleSession::open().await?;

    let version = match session.send(&Command::GetVersion).await {
        Ok(Response::Version(v)) => v,
        _ => String::new(),
    };
    let id_card = match session.send(&Command::GetIdCard).await {
        Ok(Response::IdCard(id)) => id,
        _ => String::new(),
    };
    let temperature_unit = match session.send(&Command::GetTemperatureUnit).await {
        Ok(Response::Unit(u)) => Some(unit_str(u.into())),
        _ => None,
    };
    let speaker_status = matches!(session.send(&Command::GetSpeakerStatus).await, Ok(Response::SpeakerStatus(true)));
    session.close().await;

    Ok(Json(BleInfo {
        ble_address: device.address,
        ble_name: device.name,
        version,
        id_card,
        temperature_unit,
        speaker_status,
    }))
}

#[derive(Serialize)]
struct SecretKeyResponse {
    secret_key: String,
}

async fn ble_secret_key(_admin: AdminAuth) -> Result<Json<SecretKeyResponse>, GatewayError> {
    let key: String = {
        let mut rng = rand::thread_rng();
        (0..10).map(|_| (b'a' + rng.gen_range(0..26)) as char).collect()
    };
    let session = BleSession::open().await?;
    let result = session.send(&Command::SetSecretKey { key: key.clone() }).await;
    session.close().await;
    result?;
    Ok(Json(SecretKeyResponse { secret_key: key }))
}

