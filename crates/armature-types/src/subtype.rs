//! Message subtype numbers for the built-in interfaces.
//!
//! A subtype is only meaningful together with an interface and a
//! [`MessageType`][crate::MessageType]; the same number is reused across
//! interfaces.

/// Server control interface ([`InterfaceCode::PLAYER`][crate::InterfaceCode::PLAYER]).
pub mod player {
    pub const REQ_DEVLIST: u8 = 1;
    pub const REQ_DRIVERINFO: u8 = 2;
    pub const REQ_DEV: u8 = 3;
    pub const REQ_DATA: u8 = 4;
    pub const REQ_DATAMODE: u8 = 5;
    pub const REQ_DATAFREQ: u8 = 6;
    pub const REQ_AUTH: u8 = 7;
    pub const REQ_NAMESERVICE: u8 = 8;
}

pub mod laser {
    pub const DATA_SCAN: u8 = 1;
}

pub mod sonar {
    pub const DATA_RANGES: u8 = 1;
    pub const REQ_GET_GEOM: u8 = 1;
}

pub mod position2d {
    pub const DATA_STATE: u8 = 1;
    pub const CMD_STATE: u8 = 1;
}
