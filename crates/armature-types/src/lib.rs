//! `armature-types` – shared vocabulary of the Armature hardware server.
//!
//! Every other crate speaks in terms of these types: device identities,
//! interface codes, message categories, the message header, and the
//! workspace-wide [`HalError`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod subtype;

/// Numeric code naming a device interface (laser, sonar, position2d, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceCode(pub u16);

impl InterfaceCode {
    /// The server's own control interface (device lists, data modes, …).
    pub const PLAYER: Self = Self(1);
    pub const POWER: Self = Self(2);
    pub const GRIPPER: Self = Self(3);
    pub const POSITION2D: Self = Self(4);
    pub const SONAR: Self = Self(5);
    pub const LASER: Self = Self(6);
    pub const BLOBFINDER: Self = Self(7);
    pub const PTZ: Self = Self(8);
    pub const AUDIO: Self = Self(9);
    pub const FIDUCIAL: Self = Self(10);
    pub const SPEECH: Self = Self(12);
    pub const GPS: Self = Self(13);
    pub const BUMPER: Self = Self(14);
    pub const DIO: Self = Self(20);
    pub const LOCALIZE: Self = Self(25);
    pub const CAMERA: Self = Self(40);
    pub const BLACKBOARD: Self = Self(64);

    const NAMES: &'static [(&'static str, InterfaceCode)] = &[
        ("player", Self::PLAYER),
        ("power", Self::POWER),
        ("gripper", Self::GRIPPER),
        ("position2d", Self::POSITION2D),
        ("sonar", Self::SONAR),
        ("laser", Self::LASER),
        ("blobfinder", Self::BLOBFINDER),
        ("ptz", Self::PTZ),
        ("audio", Self::AUDIO),
        ("fiducial", Self::FIDUCIAL),
        ("speech", Self::SPEECH),
        ("gps", Self::GPS),
        ("bumper", Self::BUMPER),
        ("dio", Self::DIO),
        ("localize", Self::LOCALIZE),
        ("camera", Self::CAMERA),
        ("blackboard", Self::BLACKBOARD),
    ];

    /// Look up an interface by its configuration name, e.g. `"laser"`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, code)| *code)
    }

    /// The configuration name of this interface, when it is a known one.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(_, code)| *code == self)
            .map(|(n, _)| *n)
    }
}

impl fmt::Display for InterfaceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Identity of one device instance: interface, index and (optionally) the
/// port scope it was configured under.  Port `0` is the default scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub interface: InterfaceCode,
    pub index: u16,
    #[serde(default)]
    pub port: u16,
}

impl DeviceId {
    pub fn new(interface: InterfaceCode, index: u16) -> Self {
        Self {
            interface,
            index,
            port: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}:{}", self.interface, self.index)
        } else {
            write!(f, "{}:{}:{}", self.interface, self.index, self.port)
        }
    }
}

/// Parses `interface:index[:port]`, where `interface` is either a known name
/// (`laser`) or a numeric code (`6`).
impl FromStr for DeviceId {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HalError::InvalidDeviceId(s.to_string());
        let mut parts = s.trim().split(':');

        let interface = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let interface = InterfaceCode::from_name(interface)
            .or_else(|| interface.parse::<u16>().ok().map(InterfaceCode))
            .ok_or_else(invalid)?;
        let index = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let port = match parts.next() {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            interface,
            index,
            port,
        })
    }
}

/// Access a client (or driver) requests when it registers a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    #[default]
    All,
}

/// Category of a protocol message.  Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Unsolicited sensor or state update.
    Data = 1,
    /// Actuator command.
    Cmd = 2,
    /// Configuration or control request; always answered.
    Req = 3,
    /// Positive reply to a request.
    RespAck = 4,
    /// Synchronisation marker.
    Synch = 5,
    /// Negative reply to a request.
    RespNack = 6,
    /// Reply signalling the request could not be processed.
    RespErr = 7,
}

impl MessageType {
    /// Only the newest DATA and CMD sample per signature matters, so only
    /// these are coalesced by a replacing queue.
    pub fn is_replaceable(self) -> bool {
        matches!(self, Self::Data | Self::Cmd)
    }

    pub fn is_response(self) -> bool {
        matches!(self, Self::RespAck | Self::RespNack | Self::RespErr)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = HalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Data,
            2 => Self::Cmd,
            3 => Self::Req,
            4 => Self::RespAck,
            5 => Self::Synch,
            6 => Self::RespNack,
            7 => Self::RespErr,
            other => return Err(HalError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::Cmd => "CMD",
            Self::Req => "REQ",
            Self::RespAck => "RESP_ACK",
            Self::Synch => "SYNCH",
            Self::RespNack => "RESP_NACK",
            Self::RespErr => "RESP_ERR",
        };
        f.write_str(name)
    }
}

/// Wall-clock timestamp split into seconds and microseconds, as carried on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u32,
    pub usec: u32,
}

impl Timestamp {
    pub fn new(sec: u32, usec: u32) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    pub fn as_secs_f64(self) -> f64 {
        f64::from(self.sec) + f64::from(self.usec) * 1e-6
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(t: DateTime<Utc>) -> Self {
        Self {
            sec: t.timestamp().clamp(0, i64::from(u32::MAX)) as u32,
            usec: t.timestamp_subsec_micros(),
        }
    }
}

/// Header of every message, in memory and (with a start marker) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub subtype: u8,
    pub device: InterfaceCode,
    pub device_index: u16,
    pub timestamp: Timestamp,
    /// Payload length in bytes.
    pub size: u32,
}

impl MessageHeader {
    /// Header addressed to `device`, stamped now, with an empty payload.
    pub fn new(msg_type: MessageType, subtype: u8, device: DeviceId) -> Self {
        Self {
            msg_type,
            subtype,
            device: device.interface,
            device_index: device.index,
            timestamp: Timestamp::now(),
            size: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The addressed device in the default port scope.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.device, self.device_index)
    }

    /// True when both headers have the same (type, subtype, device) signature.
    /// Payload size and timestamp are deliberately not compared.
    pub fn same_signature(&self, other: &Self) -> bool {
        self.msg_type == other.msg_type
            && self.subtype == other.subtype
            && self.device == other.device
            && self.device_index == other.device_index
    }
}

/// Workspace-wide error type spanning the registry, driver lifecycle, wire
/// codec and configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HalError {
    #[error("device {0} is already registered")]
    DuplicateDevice(DeviceId),

    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),

    #[error("invalid device identity '{0}' (expected interface:index[:port])")]
    InvalidDeviceId(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("setup of {device} failed: {details}")]
    SetupFailed { device: DeviceId, details: String },

    #[error("shutdown of {device} failed: {details}")]
    ShutdownFailed { device: DeviceId, details: String },

    #[error("unsubscribe from {0} with no active subscriptions")]
    NotSubscribed(DeviceId),

    #[error("driver thread error on {device}: {details}")]
    Thread { device: DeviceId, details: String },

    #[error("hardware fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("wire codec error: {0}")]
    Wire(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parses_names_and_codes() {
        let id: DeviceId = "laser:0".parse().unwrap();
        assert_eq!(id, DeviceId::new(InterfaceCode::LASER, 0));

        let id: DeviceId = "4:2:6665".parse().unwrap();
        assert_eq!(id.interface, InterfaceCode::POSITION2D);
        assert_eq!(id.index, 2);
        assert_eq!(id.port, 6665);
    }

    #[test]
    fn device_id_rejects_garbage() {
        assert!("laser".parse::<DeviceId>().is_err());
        assert!("warpdrive:0".parse::<DeviceId>().is_err());
        assert!("laser:x".parse::<DeviceId>().is_err());
        assert!("laser:0:1:2".parse::<DeviceId>().is_err());
        assert!(":0".parse::<DeviceId>().is_err());
    }

    #[test]
    fn device_id_display_roundtrips() {
        let id = DeviceId::new(InterfaceCode::SONAR, 3).with_port(7000);
        assert_eq!(id.to_string(), "sonar:3:7000");
        assert_eq!(id.to_string().parse::<DeviceId>().unwrap(), id);
        assert_eq!(DeviceId::new(InterfaceCode(999), 1).to_string(), "999:1");
    }

    #[test]
    fn message_type_wire_values() {
        for raw in 1u8..=7 {
            let t = MessageType::try_from(raw).unwrap();
            assert_eq!(t as u8, raw);
        }
        assert_eq!(
            MessageType::try_from(0),
            Err(HalError::UnknownMessageType(0))
        );
    }

    #[test]
    fn only_data_and_cmd_are_replaceable() {
        assert!(MessageType::Data.is_replaceable());
        assert!(MessageType::Cmd.is_replaceable());
        assert!(!MessageType::Req.is_replaceable());
        assert!(!MessageType::RespAck.is_replaceable());
        assert!(!MessageType::RespNack.is_replaceable());
    }

    #[test]
    fn signature_ignores_timestamp_and_size() {
        let laser = DeviceId::new(InterfaceCode::LASER, 0);
        let a = MessageHeader::new(MessageType::Data, 1, laser).with_timestamp(Timestamp::new(1, 0));
        let mut b = MessageHeader::new(MessageType::Data, 1, laser).with_timestamp(Timestamp::new(9, 5));
        b.size = 128;
        assert!(a.same_signature(&b));

        let c = MessageHeader::new(MessageType::Data, 2, laser);
        assert!(!a.same_signature(&c));
        let d = MessageHeader::new(MessageType::Data, 1, DeviceId::new(InterfaceCode::LASER, 1));
        assert!(!a.same_signature(&d));
    }

    #[test]
    fn timestamp_from_datetime() {
        let t = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        let ts = Timestamp::from(t);
        assert_eq!(ts, Timestamp::new(1_700_000_000, 250_000));
        assert!((ts.as_secs_f64() - 1_700_000_000.25).abs() < 1e-3);
    }

    #[test]
    fn header_serialization_roundtrip() {
        let header = MessageHeader::new(MessageType::Cmd, 1, DeviceId::new(InterfaceCode::POSITION2D, 0));
        let json = serde_json::to_string(&header).unwrap();
        let back: MessageHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn hal_error_display() {
        let err = HalError::DuplicateDevice(DeviceId::new(InterfaceCode::LASER, 0));
        assert!(err.to_string().contains("laser:0"));
    }
}
