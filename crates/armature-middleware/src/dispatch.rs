//! [`WireDispatchTable`] – resolves the pack function for a message.
//!
//! Entries are keyed by (interface, message type, subtype).  The table is
//! seeded with the built-in interfaces by [`WireDispatchTable::init`] and
//! grows when plugin drivers register codecs for interfaces the built-in
//! table does not know.  Entries are never removed.
//!
//! Lookup is a linear first-match scan: the table is small and almost
//! entirely static after startup.

use armature_types::subtype::{laser, player, position2d, sonar};
use armature_types::{InterfaceCode, MessageType};
use parking_lot::RwLock;
use tracing::debug;

use crate::codec::{transcode, PackFn};
use crate::payloads::{
    AuthRequest, DataFrequency, DataMode, DataRequest, DeviceList, DeviceRequest, DriverInfo,
    LaserScan, NameService, Position2dCommand, Position2dState, SonarGeometry, SonarRanges,
};

/// One (interface, type, subtype) → codec mapping.
#[derive(Clone, Copy)]
pub struct DispatchEntry {
    pub interface: InterfaceCode,
    pub msg_type: MessageType,
    pub subtype: u8,
    pub func: PackFn,
}

impl DispatchEntry {
    pub const fn new(interface: InterfaceCode, msg_type: MessageType, subtype: u8, func: PackFn) -> Self {
        Self {
            interface,
            msg_type,
            subtype,
            func,
        }
    }

    /// Interface and subtype must match exactly.  The type must match too,
    /// except that an entry registered for REQ also serves RESP_ACK, since a
    /// reply shares its request's payload encoding.
    fn matches(&self, interface: InterfaceCode, msg_type: MessageType, subtype: u8) -> bool {
        self.interface == interface
            && self.subtype == subtype
            && (self.msg_type == msg_type
                || (self.msg_type == MessageType::Req && msg_type == MessageType::RespAck))
    }
}

impl std::fmt::Debug for DispatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("interface", &self.interface)
            .field("msg_type", &self.msg_type)
            .field("subtype", &self.subtype)
            .finish_non_exhaustive()
    }
}

/// The codecs every server knows without plugins.
pub fn builtin_entries() -> Vec<DispatchEntry> {
    use InterfaceCode as I;
    use MessageType::{Cmd, Data, Req};

    vec![
        DispatchEntry::new(I::PLAYER, Req, player::REQ_DEVLIST, transcode::<DeviceList>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_DRIVERINFO, transcode::<DriverInfo>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_DEV, transcode::<DeviceRequest>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_DATA, transcode::<DataRequest>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_DATAMODE, transcode::<DataMode>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_DATAFREQ, transcode::<DataFrequency>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_AUTH, transcode::<AuthRequest>),
        DispatchEntry::new(I::PLAYER, Req, player::REQ_NAMESERVICE, transcode::<NameService>),
        DispatchEntry::new(I::LASER, Data, laser::DATA_SCAN, transcode::<LaserScan>),
        DispatchEntry::new(I::SONAR, Data, sonar::DATA_RANGES, transcode::<SonarRanges>),
        DispatchEntry::new(I::SONAR, Req, sonar::REQ_GET_GEOM, transcode::<SonarGeometry>),
        DispatchEntry::new(I::POSITION2D, Data, position2d::DATA_STATE, transcode::<Position2dState>),
        DispatchEntry::new(I::POSITION2D, Cmd, position2d::CMD_STATE, transcode::<Position2dCommand>),
    ]
}

/// Append-only registry of payload codecs.
#[derive(Debug, Default)]
pub struct WireDispatchTable {
    entries: RwLock<Vec<DispatchEntry>>,
}

impl WireDispatchTable {
    /// An empty table.  Most callers want [`WireDispatchTable::init`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A table loaded with [`builtin_entries`].
    pub fn init() -> Self {
        Self {
            entries: RwLock::new(builtin_entries()),
        }
    }

    /// Register one more codec.  Earlier entries win on overlap.
    pub fn add(&self, entry: DispatchEntry) {
        debug!(
            interface = %entry.interface,
            msg_type = %entry.msg_type,
            subtype = entry.subtype,
            "registering wire codec"
        );
        self.entries.write().push(entry);
    }

    pub fn lookup(&self, interface: InterfaceCode, msg_type: MessageType, subtype: u8) -> Option<PackFn> {
        self.entries
            .read()
            .iter()
            .find(|e| e.matches(interface, msg_type, subtype))
            .map(|e| e.func)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{WireError, XdrOp};

    fn echo(buf: &[u8], _op: XdrOp) -> Result<Vec<u8>, WireError> {
        Ok(buf.to_vec())
    }

    fn marker(_buf: &[u8], _op: XdrOp) -> Result<Vec<u8>, WireError> {
        Ok(vec![0xAB])
    }

    fn call(f: PackFn) -> Vec<u8> {
        f(&[1, 2, 3], XdrOp::Pack).unwrap()
    }

    #[test]
    fn init_loads_builtin_entries() {
        let table = WireDispatchTable::init();
        assert_eq!(table.len(), builtin_entries().len());
        assert!(table
            .lookup(InterfaceCode::LASER, MessageType::Data, laser::DATA_SCAN)
            .is_some());
        assert!(table
            .lookup(InterfaceCode::POSITION2D, MessageType::Cmd, position2d::CMD_STATE)
            .is_some());
    }

    #[test]
    fn request_entry_serves_response_ack() {
        let table = WireDispatchTable::new();
        table.add(DispatchEntry::new(InterfaceCode::SONAR, MessageType::Req, 1, marker));

        let req = table.lookup(InterfaceCode::SONAR, MessageType::Req, 1).unwrap();
        let ack = table.lookup(InterfaceCode::SONAR, MessageType::RespAck, 1).unwrap();
        assert_eq!(call(req), vec![0xAB]);
        assert_eq!(call(ack), vec![0xAB]);
    }

    #[test]
    fn request_entry_does_not_serve_other_types() {
        let table = WireDispatchTable::new();
        table.add(DispatchEntry::new(InterfaceCode::SONAR, MessageType::Req, 1, marker));

        for t in [MessageType::Data, MessageType::Cmd, MessageType::RespNack, MessageType::RespErr] {
            assert!(table.lookup(InterfaceCode::SONAR, t, 1).is_none(), "{t}");
        }
    }

    #[test]
    fn data_entry_does_not_serve_response_ack() {
        let table = WireDispatchTable::new();
        table.add(DispatchEntry::new(InterfaceCode::LASER, MessageType::Data, 1, marker));
        assert!(table.lookup(InterfaceCode::LASER, MessageType::RespAck, 1).is_none());
    }

    #[test]
    fn interface_and_subtype_must_match_exactly() {
        let table = WireDispatchTable::new();
        table.add(DispatchEntry::new(InterfaceCode::LASER, MessageType::Data, 1, marker));
        assert!(table.lookup(InterfaceCode::SONAR, MessageType::Data, 1).is_none());
        assert!(table.lookup(InterfaceCode::LASER, MessageType::Data, 2).is_none());
    }

    #[test]
    fn first_registered_entry_wins() {
        let table = WireDispatchTable::new();
        table.add(DispatchEntry::new(InterfaceCode::GPS, MessageType::Data, 1, marker));
        table.add(DispatchEntry::new(InterfaceCode::GPS, MessageType::Data, 1, echo));
        assert_eq!(call(table.lookup(InterfaceCode::GPS, MessageType::Data, 1).unwrap()), vec![0xAB]);
    }

    #[test]
    fn runtime_registration_extends_builtin_table() {
        let table = WireDispatchTable::init();
        assert!(table.lookup(InterfaceCode::BLACKBOARD, MessageType::Data, 1).is_none());
        table.add(DispatchEntry::new(InterfaceCode::BLACKBOARD, MessageType::Data, 1, echo));
        assert_eq!(
            call(table.lookup(InterfaceCode::BLACKBOARD, MessageType::Data, 1).unwrap()),
            vec![1, 2, 3]
        );
    }
}
