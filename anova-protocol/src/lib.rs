//! Pure, I/O-free logic for the Anova Precision Cooker wire protocol: frame
//! obfuscation/checksumming, the command catalogue, and unsolicited event
//! parsing. Nothing in this crate touches a socket.

pub mod command;
pub mod error;
pub mod event;
pub mod frame;

pub use command::{Command, DeviceStatus, Response, TemperatureUnit};
pub use error::ProtocolError;
pub use event::{is_event, parse_event, Event, EventOriginator};
pub use frame::{decode, encode, FrameDecoder};
