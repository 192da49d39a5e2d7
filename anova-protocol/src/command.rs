//! The command catalogue: one type per wire command, each knowing how to
//! encode itself to text and decode its own response.
//!
//! Mirrors a tagged union rather than a class hierarchy: every command is a
//! variant of [`Command`], and every decoded response is a variant of
//! [`Response`]. Transport support (Wi-Fi, BLE, both) is exposed per command
//! via [`Command::supports_wifi`] / [`Command::supports_ble`].

use crate::error::ProtocolError;

/// Temperature unit as reported/accepted by the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" => Ok(TemperatureUnit::Celsius),
            "f" => Ok(TemperatureUnit::Fahrenheit),
            other => Err(ProtocolError::ResponseParse {
                command: "unit",
                response: other.to_string(),
            }),
        }
    }

    fn as_wire(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "c",
            TemperatureUnit::Fahrenheit => "f",
        }
    }
}

/// Appliance run state as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Running,
    Stopped,
    LowWater,
    HeaterError,
    PowerLoss,
    UserChangeParameter,
}

impl DeviceStatus {
    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(DeviceStatus::Running),
            "stopped" => Ok(DeviceStatus::Stopped),
            "low water" => Ok(DeviceStatus::LowWater),
            "heater error" => Ok(DeviceStatus::HeaterError),
            "power loss" => Ok(DeviceStatus::PowerLoss),
            "user change parameter" => Ok(DeviceStatus::UserChangeParameter),
            other => Err(ProtocolError::ResponseParse {
                command: "status",
                response: other.to_string(),
            }),
        }
    }
}

fn validate_range(value: f32, min: f32, max: f32, what: &str) -> Result<(), ProtocolError> {
    if value < min || value > max {
        return Err(ProtocolError::Validation(format!(
            "{what} {value} out of range [{min}, {max}]"
        )));
    }
    Ok(())
}

fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Every command the appliance accepts, Wi-Fi or BLE.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetIdCard,
    GetVersion,
    GetSecretKey,
    GetDeviceStatus,
    GetCurrentTemperature,
    GetTargetTemperature,
    SetTargetTemperature { value: f32, unit: Option<TemperatureUnit> },
    GetTemperatureUnit,
    SetTemperatureUnit { unit: TemperatureUnit },
    StartDevice,
    StopDevice,
    StartTimer,
    StopTimer,
    GetTimerStatus,
    SetTimer { minutes: u32 },
    ClearAlarm,
    GetSpeakerStatus,
    SetWifiCredentials { ssid: String, password: String },
    SetServerInfo { host: String, port: u16 },
    SetSecretKey { key: String },
    SetLed { red: u8, green: u8, blue: u8 },
    SetCalibrationFactor { value: f32 },
    GetCalibrationFactor,
    SetDeviceName { name: String },
    SetSpeaker { enabled: bool },
    StartSmartlink,
    GetDate,
    GetTemperatureHistory,
}

impl Command {
    /// Whether the appliance accepts this command over the Wi-Fi (TCP) transport.
    pub fn supports_wifi(&self) -> bool {
        use Command::*;
        matches!(
            self,
            GetIdCard
                | GetVersion
                | GetSecretKey
                | GetDeviceStatus
                | GetCurrentTemperature
                | GetTargetTemperature
                | SetTargetTemperature { .. }
                | GetTemperatureUnit
                | SetTemperatureUnit { .. }
                | StartDevice
                | StopDevice
                | StartTimer
                | StopTimer
                | GetTimerStatus
                | SetTimer { .. }
                | ClearAlarm
                | GetSpeakerStatus
        )
    }

    /// Whether the appliance accepts this command over the BLE transport.
    pub fn supports_ble(&self) -> bool {
        use Command::*;
        matches!(
            self,
            GetIdCard
                | GetVersion
                | GetDeviceStatus
                | GetCurrentTemperature
                | GetTargetTemperature
                | SetTargetTemperature { .. }
                | GetTemperatureUnit
                | SetTemperatureUnit { .. }
                | StartDevice
                | StopDevice
                | StartTimer
                | StopTimer
                | GetTimerStatus
                | SetTimer { .. }
                | ClearAlarm
                | GetSpeakerStatus
                | SetWifiCredentials { .. }
                | SetServerInfo { .. }
                | SetSecretKey { .. }
                | SetLed { .. }
                | SetCalibrationFactor { .. }
                | GetCalibrationFactor
                | SetDeviceName { .. }
                | SetSpeaker { .. }
                | StartSmartlink
                | GetDate
                | GetTemperatureHistory
        )
    }

    /// Validate argument ranges before encoding, per the appliance's accepted bounds.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::SetTargetTemperature { value, unit } => match unit {
                Some(TemperatureUnit::Celsius) => validate_range(*value, 5.0, 99.9, "target temperature"),
                Some(TemperatureUnit::Fahrenheit) => {
                    validate_range(*value, 41.0, 211.8, "target temperature")
                }
                // Without a known unit we cannot bound-check; the appliance
                // itself will reject out-of-range values.
                None => Ok(()),
            },
            Command::SetTimer { minutes } => {
                if *minutes > 6000 {
                    Err(ProtocolError::Validation(format!(
                        "timer minutes {minutes} exceeds maximum of 6000"
                    )))
                } else {
                    Ok(())
                }
            }
            Command::SetCalibrationFactor { value } => validate_range(*value, -9.9, 9.9, "calibration factor"),
            Command::SetSecretKey { key } => {
                if key.len() == 10 && key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
                    Ok(())
                } else {
                    Err(ProtocolError::Validation(
                        "secret key must be 10 lowercase alphanumeric characters".to_string(),
                    ))
                }
            }
            _ => Ok(()),
        }
    }

    /// Render the on-wire text for this command (without framing).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.validate()?;
        Ok(match self {
            Command::GetIdCard => "get id card".to_string(),
            Command::GetVersion => "version".to_string(),
            Command::GetSecretKey => "get number".to_string(),
            Command::GetDeviceStatus => "status".to_string(),
            Command::GetCurrentTemperature => "read temp".to_string(),
            Command::GetTargetTemperature => "read set temp".to_string(),
            Command::SetTargetTemperature { value, .. } => format!("set temp {:.1}", round1(*value)),
            Command::GetTemperatureUnit => "read unit".to_string(),
            Command::SetTemperatureUnit { unit } => format!("set unit {}", unit.as_wire()),
            Command::StartDevice => "start".to_string(),
            Command::StopDevice => "stop".to_string(),
            Command::StartTimer => "start time".to_string(),
            Command::StopTimer => "stop time".to_string(),
            Command::GetTimerStatus => "read timer".to_string(),
            Command::SetTimer { minutes } => format!("set timer {minutes}"),
            Command::ClearAlarm => "clear alarm".to_string(),
            Command::GetSpeakerStatus => "speaker status".to_string(),
            Command::SetWifiCredentials { ssid, password } => {
                format!("wifi para 2 {ssid} {password} WPA2PSK AES")
            }
            Command::SetServerInfo { host, port } => format!("server para {host} {port}"),
            Command::SetSecretKey { key } => format!("set number {key}"),
            Command::SetLed { red, green, blue } => format!("set led {red} {green} {blue}"),
            Command::SetCalibrationFactor { value } => format!("cal {:.1}", round1(*value)),
            Command::GetCalibrationFactor => "read cal".to_string(),
            Command::SetDeviceName { name } => format!("set name {name}"),
            Command::SetSpeaker { enabled } => {
                format!("set speaker {}", if *enabled { "on" } else { "off" })
            }
            Command::StartSmartlink => "smartlink start".to_string(),
            Command::GetDate => "read date".to_string(),
            Command::GetTemperatureHistory => "read data".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Command::GetIdCard => "get id card",
            Command::GetVersion => "version",
            Command::GetSecretKey => "get number",
            Command::GetDeviceStatus => "status",
            Command::GetCurrentTemperature => "read temp",
            Command::GetTargetTemperature => "read set temp",
            Command::SetTargetTemperature { .. } => "set temp",
            Command::GetTemperatureUnit => "read unit",
            Command::SetTemperatureUnit { .. } => "set unit",
            Command::StartDevice => "start",
            Command::StopDevice => "stop",
            Command::StartTimer => "start time",
            Command::StopTimer => "stop time",
            Command::GetTimerStatus => "read timer",
            Command::SetTimer { .. } => "set timer",
            Command::ClearAlarm => "clear alarm",
            Command::GetSpeakerStatus => "speaker status",
            Command::SetWifiCredentials { .. } => "wifi para",
            Command::SetServerInfo { .. } => "server para",
            Command::SetSecretKey { .. } => "set number",
            Command::SetLed { .. } => "set led",
            Command::SetCalibrationFactor { .. } => "cal",
            Command::GetCalibrationFactor => "read cal",
            Command::SetDeviceName { .. } => "set name",
            Command::SetSpeaker { .. } => "set speaker",
            Command::StartSmartlink => "smartlink start",
            Command::GetDate => "read date",
            Command::GetTemperatureHistory => "read data",
        }
    }

    /// Parse the appliance's raw text response to this command into a typed [`Response`].
    pub fn decode(&self, raw: &str) -> Result<Response, ProtocolError> {
        let raw = raw.trim();
        let parse_err = || ProtocolError::ResponseParse {
            command: self.name(),
            response: raw.to_string(),
        };

        Ok(match self {
            Command::GetIdCard => {
                Response::IdCard(raw.strip_prefix("anova ").unwrap_or(raw).to_string())
            }
            Command::GetVersion => Response::Version(raw.to_string()),
            Command::GetSecretKey => Response::SecretKey(raw.to_string()),
            Command::GetDeviceStatus => Response::Status(DeviceStatus::parse(raw)?),
            Command::GetCurrentTemperature | Command::GetTargetTemperature => {
                Response::Temperature(raw.parse::<f32>().map_err(|_| parse_err())?)
            }
            Command::SetTargetTemperature { .. } => {
                Response::Temperature(raw.parse::<f32>().map_err(|_| parse_err())?)
            }
            Command::GetTemperatureUnit | Command::SetTemperatureUnit { .. } => {
                Response::Unit(TemperatureUnit::parse(raw)?)
            }
            Command::StartDevice => {
                Response::Ack(raw.eq_ignore_ascii_case("ok") || raw.eq_ignore_ascii_case("start"))
            }
            Command::StopDevice => {
                Response::Ack(raw.eq_ignore_ascii_case("ok") || raw.eq_ignore_ascii_case("stop"))
            }
            Command::ClearAlarm => {
                Response::Ack(raw.eq_ignore_ascii_case("ok") || raw.eq_ignore_ascii_case("clear alarm"))
            }
            Command::StartSmartlink => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::StartTimer => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::StopTimer => {
                Response::Ack(raw.eq_ignore_ascii_case("ok") || raw.eq_ignore_ascii_case("stop time"))
            }
            Command::GetTimerStatus => {
                let (running, rest) = if let Some(rest) = raw.strip_suffix(" running") {
                    (true, rest)
                } else if let Some(rest) = raw.strip_suffix(" stopped") {
                    (false, rest)
                } else {
                    return Err(parse_err());
                };
                let minutes = rest.trim().parse::<u32>().map_err(|_| parse_err())?;
                Response::Timer { running, minutes }
            }
            Command::SetTimer { .. } => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::GetSpeakerStatus => {
                Response::SpeakerStatus(raw.to_ascii_lowercase().ends_with(" on") || raw.eq_ignore_ascii_case("on"))
            }
            Command::SetWifiCredentials { .. } => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::SetServerInfo { host, port } => {
                let expected = format!("{host} {port}");
                Response::Ack(raw == expected)
            }
            Command::SetSecretKey { .. } => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::SetLed { .. } => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::SetCalibrationFactor { .. } => {
                Response::CalibrationFactor(raw.parse::<f32>().map_err(|_| parse_err())?)
            }
            Command::GetCalibrationFactor => {
                Response::CalibrationFactor(raw.parse::<f32>().map_err(|_| parse_err())?)
            }
            Command::SetDeviceName { .. } => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::SetSpeaker { .. } => Response::Ack(!raw.eq_ignore_ascii_case("invalid command")),
            Command::GetDate => Response::Date(raw.to_string()),
            Command::GetTemperatureHistory => {
                let rest = raw.strip_prefix("read data ").unwrap_or(raw);
                let samples = rest
                    .split_whitespace()
                    .map(|s| s.parse::<f32>().map_err(|_| parse_err()))
                    .collect::<Result<Vec<_>, _>>()?;
                Response::TemperatureHistory(samples)
            }
        })
    }
}

/// A typed, decoded response to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    IdCard(String),
    Version(String),
    SecretKey(String),
    Status(DeviceStatus),
    Temperature(f32),
    Unit(TemperatureUnit),
    Ack(bool),
    Timer { running: bool, minutes: u32 },
    SpeakerStatus(bool),
    CalibrationFactor(f32),
    Date(String),
    TemperatureHistory(Vec<f32>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_get_id_card() {
        assert_eq!(Command::GetIdCard.encode().unwrap(), "get id card");
    }

    #[test]
    fn encodes_set_target_temperature_rounded() {
        let cmd = Command::SetTargetTemperature { value: 57.499, unit: Some(TemperatureUnit::Celsius) };
        assert_eq!(cmd.encode().unwrap(), "set temp 57.5");
    }

    #[test]
    fn rejects_out_of_range_celsius_target() {
        let cmd = Command::SetTargetTemperature { value: 150.0, unit: Some(TemperatureUnit::Celsius) };
        assert!(cmd.encode().is_err());
    }

    #[test]
    fn accepts_target_when_unit_unknown() {
        let cmd = Command::SetTargetTemperature { value: 1000.0, unit: None };
        assert!(cmd.encode().is_ok());
    }

    #[test]
    fn rejects_timer_over_max() {
        let cmd = Command::SetTimer { minutes: 6001 };
        assert!(cmd.encode().is_err());
    }

    #[test]
    fn rejects_malformed_secret_key() {
        let cmd = Command::SetSecretKey { key: "UPPERCASE1".to_string() };
        assert!(cmd.encode().is_err());
    }

    #[test]
    fn decodes_id_card_strips_anova_prefix() {
        let resp = Command::GetIdCard.decode("anova abcdef").unwrap();
        assert_eq!(resp, Response::IdCard("abcdef".to_string()));
    }

    #[test]
    fn decodes_timer_status_running() {
        let resp = Command::GetTimerStatus.decode("30 running").unwrap();
        assert_eq!(resp, Response::Timer { running: true, minutes: 30 });
    }

    #[test]
    fn decodes_timer_status_stopped() {
        let resp = Command::GetTimerStatus.decode("0 stopped").unwrap();
        assert_eq!(resp, Response::Timer { running: false, minutes: 0 });
    }

    #[test]
    fn decodes_device_status() {
        let resp = Command::GetDeviceStatus.decode("low water").unwrap();
        assert_eq!(resp, Response::Status(DeviceStatus::LowWater));
    }

    #[test]
    fn decodes_temperature_history() {
        let resp = Command::GetTemperatureHistory.decode("read data 55.0 55.2 55.4").unwrap();
        assert_eq!(resp, Response::TemperatureHistory(vec![55.0, 55.2, 55.4]));
    }

    #[test]
    fn set_server_info_ack_checks_echo() {
        let cmd = Command::SetServerInfo { host: "10.0.0.5".to_string(), port: 8080 };
        assert_eq!(cmd.decode("10.0.0.5 8080").unwrap(), Response::Ack(true));
        assert_eq!(cmd.decode("wrong").unwrap(), Response::Ack(false));
    }

    #[test]
    fn invalid_command_response_decodes_as_nack() {
        assert_eq!(Command::StartDevice.decode("invalid command").unwrap(), Response::Ack(false));
    }

    #[test]
    fn transport_support_matches_catalogue() {
        assert!(Command::GetSecretKey.supports_wifi());
        assert!(!Command::GetSecretKey.supports_ble());
        assert!(Command::SetWifiCredentials { ssid: "x".into(), password: "y".into() }.supports_ble());
        assert!(!Command::SetWifiCredentials { ssid: "x".into(), password: "y".into() }.supports_wifi());
    }
}
