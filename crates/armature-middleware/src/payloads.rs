//! Payload definitions for the built-in interfaces.
//!
//! Each type mirrors one entry of the built-in dispatch table.  Drivers build
//! these, call [`Payload::to_native`] and hand the bytes to the core; the
//! wire layer packs them with the matching `transcode::<T>` function.

use armature_types::{DeviceId, InterfaceCode};

use crate::codec::{Payload, PayloadReader, PayloadWriter, WireError};

fn write_device(w: &mut PayloadWriter, id: &DeviceId) {
    w.put_u16(id.port);
    w.put_u16(id.interface.0);
    w.put_u16(id.index);
}

fn read_device(r: &mut PayloadReader<'_>) -> Result<DeviceId, WireError> {
    let port = r.get_u16()?;
    let interface = InterfaceCode(r.get_u16()?);
    let index = r.get_u16()?;
    Ok(DeviceId::new(interface, index).with_port(port))
}

// ────────────────────────────────────────────────────────────────────────────
// Server control interface
// ────────────────────────────────────────────────────────────────────────────

/// List of every device the server provides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceList {
    pub devices: Vec<DeviceId>,
}

impl Payload for DeviceList {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_len(self.devices.len());
        for d in &self.devices {
            write_device(w, d);
        }
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let n = r.get_len(3 * r.scalar_width(2))?;
        let devices = (0..n).map(|_| read_device(r)).collect::<Result<_, _>>()?;
        Ok(Self { devices })
    }
}

/// Name of the driver behind a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverInfo {
    pub device: DeviceId,
    pub driver_name: String,
}

impl Payload for DriverInfo {
    fn write(&self, w: &mut PayloadWriter) {
        write_device(w, &self.device);
        w.put_str(&self.driver_name);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device: read_device(r)?,
            driver_name: r.get_string()?,
        })
    }
}

/// Open or close a device with an access mode.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub device: DeviceId,
    /// `b'r'`, `b'w'`, `b'a'` or `b'c'` (close).
    pub access: u8,
    pub driver_name: String,
}

impl Payload for DeviceRequest {
    fn write(&self, w: &mut PayloadWriter) {
        write_device(w, &self.device);
        w.put_u8(self.access);
        w.put_str(&self.driver_name);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device: read_device(r)?,
            access: r.get_u8()?,
            driver_name: r.get_string()?,
        })
    }
}

/// Ask for one round of data in pull mode.  Carries no fields.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DataRequest;

impl Payload for DataRequest {
    fn write(&self, _w: &mut PayloadWriter) {}

    fn read(_r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataMode {
    pub mode: u8,
}

impl Payload for DataMode {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_u8(self.mode);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self { mode: r.get_u8()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFrequency {
    pub frequency: u16,
}

impl Payload for DataFrequency {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_u16(self.frequency);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            frequency: r.get_u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub key: String,
}

impl Payload for AuthRequest {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_str(&self.key);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self { key: r.get_string()? })
    }
}

/// Resolve a robot name to the port it is served on.
#[derive(Debug, Clone, PartialEq)]
pub struct NameService {
    pub name: String,
    pub port: u16,
}

impl Payload for NameService {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_str(&self.name);
        w.put_u16(self.port);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            name: r.get_string()?,
            port: r.get_u16()?,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors and actuators
// ────────────────────────────────────────────────────────────────────────────

/// Planar pose or velocity: x, y (m or m/s) and yaw (rad or rad/s).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose2d {
    pub x: f32,
    pub y: f32,
    pub yaw: f32,
}

impl Pose2d {
    pub fn new(x: f32, y: f32, yaw: f32) -> Self {
        Self { x, y, yaw }
    }
}

impl Payload for Pose2d {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_f32(self.x);
        w.put_f32(self.y);
        w.put_f32(self.yaw);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            x: r.get_f32()?,
            y: r.get_f32()?,
            yaw: r.get_f32()?,
        })
    }
}

/// One laser sweep.  Angles in radians, ranges in metres.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaserScan {
    pub min_angle: f32,
    pub max_angle: f32,
    pub resolution: f32,
    pub max_range: f32,
    pub ranges: Vec<f32>,
    pub intensity: Vec<u8>,
    /// Scan sequence number.
    pub id: u32,
}

impl Payload for LaserScan {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_f32(self.min_angle);
        w.put_f32(self.max_angle);
        w.put_f32(self.resolution);
        w.put_f32(self.max_range);
        w.put_len(self.ranges.len());
        for r in &self.ranges {
            w.put_f32(*r);
        }
        w.put_len(self.intensity.len());
        for i in &self.intensity {
            w.put_u8(*i);
        }
        w.put_u32(self.id);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let min_angle = r.get_f32()?;
        let max_angle = r.get_f32()?;
        let resolution = r.get_f32()?;
        let max_range = r.get_f32()?;
        let n = r.get_len(4)?;
        let ranges = (0..n).map(|_| r.get_f32()).collect::<Result<_, _>>()?;
        let n = r.get_len(r.scalar_width(1))?;
        let intensity = (0..n).map(|_| r.get_u8()).collect::<Result<_, _>>()?;
        let id = r.get_u32()?;
        Ok(Self {
            min_angle,
            max_angle,
            resolution,
            max_range,
            ranges,
            intensity,
            id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SonarRanges {
    pub ranges: Vec<f32>,
}

impl Payload for SonarRanges {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_len(self.ranges.len());
        for r in &self.ranges {
            w.put_f32(*r);
        }
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let n = r.get_len(4)?;
        let ranges = (0..n).map(|_| r.get_f32()).collect::<Result<_, _>>()?;
        Ok(Self { ranges })
    }
}

/// Mounting pose of every transducer in a sonar ring.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SonarGeometry {
    pub poses: Vec<Pose2d>,
}

impl Payload for SonarGeometry {
    fn write(&self, w: &mut PayloadWriter) {
        w.put_len(self.poses.len());
        for p in &self.poses {
            p.write(w);
        }
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let n = r.get_len(12)?;
        let poses = (0..n).map(|_| Pose2d::read(r)).collect::<Result<_, _>>()?;
        Ok(Self { poses })
    }
}

/// Odometric state of a planar mobile base.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position2dState {
    pub pos: Pose2d,
    pub vel: Pose2d,
    pub stall: u8,
}

impl Payload for Position2dState {
    fn write(&self, w: &mut PayloadWriter) {
        self.pos.write(w);
        self.vel.write(w);
        w.put_u8(self.stall);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            pos: Pose2d::read(r)?,
            vel: Pose2d::read(r)?,
            stall: r.get_u8()?,
        })
    }
}

/// Velocity command for a planar mobile base.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position2dCommand {
    pub vel: Pose2d,
    /// Motor power: 0 = off, 1 = on.
    pub state: u8,
}

impl Payload for Position2dCommand {
    fn write(&self, w: &mut PayloadWriter) {
        self.vel.write(w);
        w.put_u8(self.state);
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            vel: Pose2d::read(r)?,
            state: r.get_u8()?,
        })
    }
}
