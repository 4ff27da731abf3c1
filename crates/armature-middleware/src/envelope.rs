//! Wire framing for [`Message`]s.
//!
//! A frame is a fixed 20-byte big-endian header followed by the XDR payload:
//!
//! | Offset | Width | Field |
//! |---|---|---|
//! | 0 | 2 | start marker `0x5878` |
//! | 2 | 1 | message type |
//! | 3 | 1 | subtype |
//! | 4 | 2 | interface code |
//! | 6 | 2 | device index |
//! | 8 | 4 | timestamp seconds |
//! | 12 | 4 | timestamp microseconds |
//! | 16 | 4 | payload size in bytes |
//!
//! Payloads are translated between native and XDR layouts through the
//! [`WireDispatchTable`].

use std::sync::Arc;

use armature_types::{InterfaceCode, MessageHeader, MessageType, Timestamp};
use tracing::{trace, warn};

use crate::codec::{WireError, XdrOp};
use crate::dispatch::WireDispatchTable;
use crate::message::Message;
use crate::queue::MessageQueue;

/// Start-of-frame marker.
pub const STX: u16 = 0x5878;

/// The on-wire message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub msg_type: MessageType,
    pub subtype: u8,
    pub interface: InterfaceCode,
    pub index: u16,
    pub timestamp: Timestamp,
    pub size: u32,
}

impl WireHeader {
    pub const LEN: usize = 20;

    pub fn from_message_header(header: &MessageHeader, size: u32) -> Self {
        Self {
            msg_type: header.msg_type,
            subtype: header.subtype,
            interface: header.device,
            index: header.device_index,
            timestamp: header.timestamp,
            size,
        }
    }

    pub fn to_message_header(&self) -> MessageHeader {
        MessageHeader {
            msg_type: self.msg_type,
            subtype: self.subtype,
            device: self.interface,
            device_index: self.index,
            timestamp: self.timestamp,
            size: self.size,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..2].copy_from_slice(&STX.to_be_bytes());
        out[2] = self.msg_type as u8;
        out[3] = self.subtype;
        out[4..6].copy_from_slice(&self.interface.0.to_be_bytes());
        out[6..8].copy_from_slice(&self.index.to_be_bytes());
        out[8..12].copy_from_slice(&self.timestamp.sec.to_be_bytes());
        out[12..16].copy_from_slice(&self.timestamp.usec.to_be_bytes());
        out[16..20].copy_from_slice(&self.size.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::TooShort {
                need: Self::LEN,
                got: buf.len(),
                context: "frame header",
            });
        }
        let u16_at = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        let marker = u16_at(0);
        if marker != STX {
            return Err(WireError::BadStartMarker {
                expected: STX,
                actual: marker,
            });
        }
        let msg_type = MessageType::try_from(buf[2]).map_err(|_| WireError::UnknownMessageType(buf[2]))?;

        Ok(Self {
            msg_type,
            subtype: buf[3],
            interface: InterfaceCode(u16_at(4)),
            index: u16_at(6),
            timestamp: Timestamp::new(u32_at(8), u32_at(12)),
            size: u32_at(16),
        })
    }
}

fn no_codec(interface: InterfaceCode, msg_type: MessageType, subtype: u8) -> WireError {
    WireError::NoCodec {
        interface: interface.0,
        msg_type: msg_type as u8,
        subtype,
    }
}

/// Encode `msg` into a complete wire frame.
///
/// An empty payload needs no codec.  A non-empty payload without a
/// registered codec is an error.
pub fn encode_message(table: &WireDispatchTable, msg: &Message) -> Result<Vec<u8>, WireError> {
    let header = msg.header();
    let body = if msg.payload().is_empty() {
        Vec::new()
    } else {
        let pack = table
            .lookup(header.device, header.msg_type, header.subtype)
            .ok_or_else(|| no_codec(header.device, header.msg_type, header.subtype))?;
        pack(msg.payload(), XdrOp::Pack)?
    };
    let size = u32::try_from(body.len()).map_err(|_| WireError::Overflow {
        value: u32::MAX,
        width: "u32 frame size",
    })?;

    let mut frame = Vec::with_capacity(WireHeader::LEN + body.len());
    frame.extend_from_slice(&WireHeader::from_message_header(header, size).encode());
    frame.extend_from_slice(&body);
    trace!(
        device = %header.device_id(),
        msg_type = %header.msg_type,
        subtype = header.subtype,
        bytes = frame.len(),
        "encoded frame"
    );
    Ok(frame)
}

/// Decode one wire frame into a [`Message`] carrying a native payload.
///
/// When the declared payload size disagrees with the bytes actually present
/// a warning is logged and the shorter of the two is used.
pub fn decode_frame(
    table: &WireDispatchTable,
    frame: &[u8],
    reply_to: Option<&Arc<MessageQueue>>,
) -> Result<Message, WireError> {
    let wire = WireHeader::decode(frame)?;
    let available = frame.len() - WireHeader::LEN;
    let declared = wire.size as usize;
    if declared != available {
        warn!(
            interface = %wire.interface,
            msg_type = %wire.msg_type,
            subtype = wire.subtype,
            declared,
            available,
            "frame size does not match header"
        );
    }
    let body = &frame[WireHeader::LEN..WireHeader::LEN + declared.min(available)];

    let payload = if body.is_empty() {
        Vec::new()
    } else {
        let unpack = table
            .lookup(wire.interface, wire.msg_type, wire.subtype)
            .ok_or_else(|| no_codec(wire.interface, wire.msg_type, wire.subtype))?;
        unpack(body, XdrOp::Unpack)?
    };

    Ok(Message::with_payload(wire.to_message_header(), &payload, reply_to))
}
