//! [`SimRegistry`] – builds a [`DeviceRegistry`] out of driver descriptions.
//!
//! Each [`DriverSpec`] names a [`DriverKind`], the devices the driver
//! provides and its [`HostOptions`].  The server builds its registry from
//! the `[[driver]]` sections of its configuration through this builder, and
//! tests use the `with_*` shortcuts.
//!
//! # Example
//!
//! ```rust
//! use armature_hal::sim_registry::SimRegistry;
//!
//! let registry = SimRegistry::builder()
//!     .with_laser(0)
//!     .with_position2d(0)
//!     .build()
//!     .unwrap();
//! assert_eq!(registry.len(), 2);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use armature_types::{DeviceId, HalError, InterfaceCode};

use crate::driver::Driver;
use crate::host::{DriverHost, HostOptions};
use crate::registry::DeviceRegistry;
use crate::sim::{SimLaser, SimPosition2d, SimSonar};

/// The drivers this server can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    SimLaser,
    SimPosition2d,
    SimSonar,
}

impl DriverKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::SimLaser => "sim_laser",
            Self::SimPosition2d => "sim_position2d",
            Self::SimSonar => "sim_sonar",
        }
    }

    /// The interface every device of this driver must provide.
    pub fn interface(self) -> InterfaceCode {
        match self {
            Self::SimLaser => InterfaceCode::LASER,
            Self::SimPosition2d => InterfaceCode::POSITION2D,
            Self::SimSonar => InterfaceCode::SONAR,
        }
    }

    pub fn instantiate(self) -> Box<dyn Driver> {
        match self {
            Self::SimLaser => Box::new(SimLaser::default()),
            Self::SimPosition2d => Box::new(SimPosition2d::new()),
            Self::SimSonar => Box::new(SimSonar::default()),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sim_laser" => Ok(Self::SimLaser),
            "sim_position2d" => Ok(Self::SimPosition2d),
            "sim_sonar" => Ok(Self::SimSonar),
            other => Err(HalError::Config(format!("unknown driver kind '{other}'"))),
        }
    }
}

/// One driver to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSpec {
    pub kind: DriverKind,
    /// Devices served by the driver.  The first one is its default identity.
    pub provides: Vec<DeviceId>,
    pub options: HostOptions,
}

impl DriverSpec {
    pub fn new(kind: DriverKind, id: DeviceId) -> Self {
        Self {
            kind,
            provides: vec![id],
            options: HostOptions::default(),
        }
    }
}

/// Instantiate `spec` and register every device it provides.
///
/// # Errors
///
/// [`HalError::Config`] when the spec provides no devices or a device of
/// the wrong interface; [`HalError::DuplicateDevice`] when a device is
/// already taken.
pub fn load_driver(registry: &Arc<DeviceRegistry>, spec: &DriverSpec) -> Result<Arc<DriverHost>, HalError> {
    let (first, rest) = spec
        .provides
        .split_first()
        .ok_or_else(|| HalError::Config(format!("driver '{}' provides no devices", spec.kind)))?;
    if let Some(bad) = spec.provides.iter().find(|id| id.interface != spec.kind.interface()) {
        return Err(HalError::Config(format!(
            "driver '{}' cannot provide {bad} (expected interface {})",
            spec.kind,
            spec.kind.interface()
        )));
    }

    let host = DriverHost::new(registry, spec.kind.instantiate(), *first, spec.options);
    if let Some(e) = host.error() {
        return Err(e);
    }
    for id in rest {
        host.add_interface(*id, spec.options.access)?;
    }
    Ok(host)
}

/// Builder for a [`DeviceRegistry`] populated with simulated drivers.
#[derive(Debug, Default)]
pub struct SimRegistry {
    specs: Vec<DriverSpec>,
}

impl SimRegistry {
    /// Create a new builder with no drivers.
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn with_laser(self, index: u16) -> Self {
        self.with_kind(DriverKind::SimLaser, index)
    }

    pub fn with_position2d(self, index: u16) -> Self {
        self.with_kind(DriverKind::SimPosition2d, index)
    }

    pub fn with_sonar(self, index: u16) -> Self {
        self.with_kind(DriverKind::SimSonar, index)
    }

    fn with_kind(self, kind: DriverKind, index: u16) -> Self {
        self.with_driver(DriverSpec::new(kind, DeviceId::new(kind.interface(), index)))
    }

    pub fn with_driver(mut self, spec: DriverSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Consume the builder and return the populated registry.  Fails on the
    /// first driver that cannot be loaded.
    pub fn build(self) -> Result<Arc<DeviceRegistry>, HalError> {
        let registry = Arc::new(DeviceRegistry::new());
        for spec in &self.specs {
            load_driver(&registry, spec)?;
        }
        Ok(registry)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use armature_middleware::{MessageQueue, Payload};
    use armature_middleware::payloads::Position2dState;
    use armature_types::{AccessMode, MessageType};

    #[test]
    fn driver_kind_parses_config_names() {
        for kind in [DriverKind::SimLaser, DriverKind::SimPosition2d, DriverKind::SimSonar] {
            assert_eq!(kind.name().parse::<DriverKind>().unwrap(), kind);
        }
        assert!(matches!("lidar".parse::<DriverKind>(), Err(HalError::Config(_))));
    }

    #[test]
    fn builder_registers_each_driver() {
        let registry = SimRegistry::builder()
            .with_laser(0)
            .with_position2d(0)
            .with_sonar(1)
            .build()
            .unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry
                .get_driver(DeviceId::new(InterfaceCode::SONAR, 1))
                .unwrap()
                .name(),
            "sim_sonar"
        );
    }

    #[test]
    fn duplicate_device_fails_build() {
        let result = SimRegistry::builder().with_laser(0).with_laser(0).build();
        assert_eq!(
            result.unwrap_err(),
            HalError::DuplicateDevice(DeviceId::new(InterfaceCode::LASER, 0))
        );
    }

    #[test]
    fn mismatched_interface_is_a_config_error() {
        let spec = DriverSpec::new(DriverKind::SimLaser, DeviceId::new(InterfaceCode::SONAR, 0));
        let result = SimRegistry::builder().with_driver(spec).build();
        assert!(matches!(result, Err(HalError::Config(_))));
    }

    #[test]
    fn empty_provides_is_a_config_error() {
        let spec = DriverSpec {
            kind: DriverKind::SimSonar,
            provides: Vec::new(),
            options: HostOptions::default(),
        };
        let registry = Arc::new(DeviceRegistry::new());
        assert!(matches!(load_driver(&registry, &spec), Err(HalError::Config(_))));
    }

    #[test]
    fn multi_device_driver_shares_one_host() {
        let spec = DriverSpec {
            kind: DriverKind::SimSonar,
            provides: vec![
                DeviceId::new(InterfaceCode::SONAR, 0),
                DeviceId::new(InterfaceCode::SONAR, 1),
            ],
            options: HostOptions {
                access: AccessMode::Read,
                ..HostOptions::default()
            },
        };
        let registry = SimRegistry::builder().with_driver(spec).build().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.drivers().len(), 1);
        assert_eq!(
            registry
                .get_device(DeviceId::new(InterfaceCode::SONAR, 1))
                .unwrap()
                .access,
            AccessMode::Read
        );
    }

    #[test]
    fn full_stack_no_hardware_required() {
        let registry = SimRegistry::builder()
            .with_laser(0)
            .with_position2d(0)
            .with_sonar(0)
            .build()
            .unwrap();
        let client = Arc::new(MessageQueue::new(true, 16));

        for driver in registry.drivers() {
            driver.subscribe(Some(&client)).unwrap();
        }
        for driver in registry.drivers() {
            driver.update();
        }
        assert!(client.wait_timeout(std::time::Duration::from_secs(5), None));

        let mut saw_position = false;
        while let Some(msg) = client.pop() {
            assert_eq!(msg.msg_type(), MessageType::Data);
            if msg.device_id().interface == InterfaceCode::POSITION2D {
                Position2dState::from_native(msg.payload()).unwrap();
                saw_position = true;
            }
        }
        assert!(saw_position);

        for driver in registry.drivers() {
            driver.unsubscribe(Some(&client)).unwrap();
            assert!(!driver.is_running());
        }
    }
}
