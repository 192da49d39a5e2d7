//! Unsolicited event parsing: the appliance pushes `event ...` and
//! `user changed ...` lines outside the request/response cycle whenever its
//! state changes on its own (temperature reached, low water, a physical
//! button press) or because another client (Wi-Fi or BLE) changed it.

use crate::error::ProtocolError;

/// Which side originated the state change this event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOriginator {
    Wifi,
    Ble,
    Device,
}

/// A parsed unsolicited event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TempReached,
    LowWater,
    Start,
    Stop,
    ChangeTemp,
    ChangeParam,
    TimeStart,
    TimeStop,
    TimeFinish,
}

/// True if `message` looks like an event line rather than a command response.
pub fn is_event(message: &str) -> bool {
    let m = message.trim();
    m.starts_with("event") || m.starts_with("user changed")
}

/// Parse an event line into its originator and type.
///
/// The appliance prefixes device-originated events with `event`, and
/// relayed events with `event wifi` / `event ble`; a bare `user changed ...`
/// line (no originator prefix) always reports a parameter change.
pub fn parse_event(message: &str) -> Result<(EventOriginator, Event), ProtocolError> {
    let trimmed = message.trim();
    let lower = trimmed.to_ascii_lowercase();

    let originator = if lower.starts_with("event wifi") {
        EventOriginator::Wifi
    } else if lower.starts_with("event ble") {
        EventOriginator::Ble
    } else {
        EventOriginator::Device
    };

    // Strip known prefixes in sequence; mirrors the reference parser's
    // looseness (substring removal, not strict prefix stripping) so stray
    // repeated tokens don't break classification.
    let body = lower
        .replacen("event", "", 1)
        .replacen("wifi", "", 1)
        .replacen("ble", "", 1);
    let body = body.trim();

    if body.starts_with("user changed") || lower.starts_with("user changed") {
        return Ok((originator, Event::ChangeParam));
    }

    let kind = match body {
        "stop" => Event::Stop,
        "start" => Event::Start,
        "low water" => Event::LowWater,
        "time start" => Event::TimeStart,
        "time stop" => Event::TimeStop,
        "time finish" => Event::TimeFinish,
        _ if body.starts_with("temp has reached") => Event::TempReached,
        _ if body.starts_with("change temp") || body.starts_with("temp changed") => Event::ChangeTemp,
        _ => return Err(ProtocolError::UnknownEvent(trimmed.to_string())),
    };

    Ok((originator, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_event_and_user_changed_prefixes() {
        assert!(is_event("event stop"));
        assert!(is_event("user changed temp 57.0"));
        assert!(!is_event("57.0"));
    }

    #[test]
    fn parses_bare_device_event() {
        let (origin, kind) = parse_event("event stop").unwrap();
        assert_eq!(origin, EventOriginator::Device);
        assert_eq!(kind, Event::Stop);
    }

    #[test]
    fn parses_wifi_originated_event() {
        let (origin, kind) = parse_event("event wifi start").unwrap();
        assert_eq!(origin, EventOriginator::Wifi);
        assert_eq!(kind, Event::Start);
    }

    #[test]
    fn parses_ble_originated_event() {
        let (origin, kind) = parse_event("event ble low water").unwrap();
        assert_eq!(origin, EventOriginator::Ble);
        assert_eq!(kind, Event::LowWater);
    }

    #[test]
    fn parses_temp_reached() {
        let (_, kind) = parse_event("event temp has reached target").unwrap();
        assert_eq!(kind, Event::TempReached);
    }

    #[test]
    fn parses_timer_lifecycle_events() {
        assert_eq!(parse_event("event time start").unwrap().1, Event::TimeStart);
        assert_eq!(parse_event("event time stop").unwrap().1, Event::TimeStop);
        assert_eq!(parse_event("event time finish").unwrap().1, Event::TimeFinish);
    }

    #[test]
    fn parses_user_changed_as_change_param() {
        let (_, kind) = parse_event("user changed set temp 57.0").unwrap();
        assert_eq!(kind, Event::ChangeParam);
    }

    #[test]
    fn rejects_unknown_event_text() {
        assert!(parse_event("event something unexpected").is_err());
    }
}
