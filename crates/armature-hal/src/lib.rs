//! `armature-hal` – drivers and the device table.
//!
//! # Modules
//!
//! - [`driver`] – the [`Driver`] plugin trait and its [`Outcome`]s.
//! - [`host`] – [`DriverHost`]: subscription lifecycle, worker thread,
//!   inbound queue and message routing around one driver.
//! - [`registry`] – [`DeviceRegistry`]: device identity → driver.
//! - [`sim`] – simulated laser, position2d and sonar drivers.
//! - [`sim_registry`] – [`SimRegistry`]: builds a registry from driver
//!   descriptions.

pub mod driver;
pub mod host;
pub mod registry;
pub mod sim;
pub mod sim_registry;

pub use driver::{Driver, Outcome, Reply};
pub use host::{DriverHost, HostOptions};
pub use registry::{DeviceEntry, DeviceRegistry};
pub use sim_registry::{load_driver, DriverKind, DriverSpec, SimRegistry};
