//! Simulated drivers for running the server without physical hardware.
//!
//! | Driver | Style | Behaviour |
//! |---|---|---|
//! | [`SimLaser`] | self-threaded | Publishes a synthetic 181-beam scan every period. |
//! | [`SimPosition2d`] | polled | Integrates velocity commands into odometry; answers every request with NACK. |
//! | [`SimSonar`] | polled | Publishes fixed ranges; answers the geometry request. |

use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use armature_middleware::Message;
use armature_middleware::Payload;
use armature_middleware::payloads::{
    LaserScan, Pose2d, Position2dCommand, Position2dState, SonarGeometry, SonarRanges,
};
use armature_types::subtype::{laser, position2d, sonar};
use armature_types::{HalError, MessageType};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::{Driver, Outcome, Reply};
use crate::host::DriverHost;

// ────────────────────────────────────────────────────────────────────────────
// Laser
// ────────────────────────────────────────────────────────────────────────────

/// A simulated scanning laser running on its own thread.
pub struct SimLaser {
    period: Duration,
    max_range: f32,
    seq: AtomicU32,
}

impl SimLaser {
    pub const BEAMS: usize = 181;

    pub fn new(period: Duration) -> Self {
        Self {
            period,
            max_range: 8.0,
            seq: AtomicU32::new(0),
        }
    }

    /// Produce the next scan.  Ranges follow a slowly moving sine so that
    /// consecutive scans differ.
    pub fn scan(&self) -> LaserScan {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let phase = id as f32 * 0.05;
        let ranges = (0..Self::BEAMS)
            .map(|i| self.max_range * (0.5 + 0.25 * (i as f32 * 0.1 + phase).sin()))
            .collect();
        LaserScan {
            min_angle: -FRAC_PI_2,
            max_angle: FRAC_PI_2,
            resolution: PI / (Self::BEAMS - 1) as f32,
            max_range: self.max_range,
            ranges,
            intensity: vec![0; Self::BEAMS],
            id,
        }
    }
}

impl Default for SimLaser {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Driver for SimLaser {
    fn name(&self) -> &str {
        "sim_laser"
    }

    fn setup(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
        host.start_thread()
    }

    fn shutdown(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
        host.stop_thread()
    }

    fn main(&self, host: &Arc<DriverHost>) {
        while !host.test_cancel() {
            host.process_messages();
            let scan = self.scan().to_native();
            for id in host.interfaces() {
                host.publish(id, laser::DATA_SCAN, &scan, None);
            }
            host.wait_for_messages(self.period);
        }
    }

    fn main_quit(&self, host: &Arc<DriverHost>) {
        debug!(device = %host.id(), scans = self.seq.load(Ordering::Relaxed), "laser stopped");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Position2d
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Odometry {
    state: Position2dState,
    last_step: Option<Instant>,
}

/// A simulated planar base with perfect odometry.
#[derive(Debug, Default)]
pub struct SimPosition2d {
    odometry: Mutex<Odometry>,
}

fn wrap_angle(a: f32) -> f32 {
    (a + PI).rem_euclid(TAU) - PI
}

impl SimPosition2d {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Position2dState {
        self.odometry.lock().state
    }

    /// Apply a velocity command.  Motors off stops the base.
    pub fn command(&self, cmd: Position2dCommand) {
        let mut odo = self.odometry.lock();
        odo.state.vel = if cmd.state == 0 { Pose2d::default() } else { cmd.vel };
    }

    /// Advance the pose by `dt` seconds at the current velocity.  Velocity is
    /// in the robot frame.
    pub fn integrate(&self, dt: f32) {
        let mut odo = self.odometry.lock();
        let Position2dState { pos, vel, .. } = &mut odo.state;
        let (sin, cos) = pos.yaw.sin_cos();
        pos.x += (vel.x * cos - vel.y * sin) * dt;
        pos.y += (vel.x * sin + vel.y * cos) * dt;
        pos.yaw = wrap_angle(pos.yaw + vel.yaw * dt);
    }

    fn step(&self, now: Instant) -> Position2dState {
        let dt = {
            let mut odo = self.odometry.lock();
            let dt = odo.last_step.map_or(0.0, |t| now.duration_since(t).as_secs_f32());
            odo.last_step = Some(now);
            dt
        };
        self.integrate(dt);
        self.state()
    }
}

impl Driver for SimPosition2d {
    fn name(&self) -> &str {
        "sim_position2d"
    }

    fn setup(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
        *self.odometry.lock() = Odometry::default();
        Ok(())
    }

    fn shutdown(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
        self.odometry.lock().state.vel = Pose2d::default();
        Ok(())
    }

    fn process_message(&self, host: &Arc<DriverHost>, msg: &Message) -> Outcome {
        let subtype = msg.header().subtype;
        match msg.msg_type() {
            MessageType::Cmd if subtype == position2d::CMD_STATE => {
                match Position2dCommand::from_native(msg.payload()) {
                    Ok(cmd) => self.command(cmd),
                    Err(e) => warn!(device = %host.id(), error = %e, "malformed velocity command"),
                }
                Outcome::Handled
            }
            MessageType::Req => Outcome::Reply(Reply::nack(subtype)),
            _ => Outcome::Unhandled,
        }
    }

    fn update(&self, host: &Arc<DriverHost>) {
        host.process_messages();
        let state = self.step(Instant::now()).to_native();
        for id in host.interfaces() {
            host.publish(id, position2d::DATA_STATE, &state, None);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sonar
// ────────────────────────────────────────────────────────────────────────────

/// A simulated sonar ring whose transducers are evenly spaced around the
/// robot.
#[derive(Debug)]
pub struct SimSonar {
    count: usize,
    radius: f32,
}

impl SimSonar {
    pub fn new(count: usize) -> Self {
        Self { count, radius: 0.2 }
    }

    pub fn geometry(&self) -> SonarGeometry {
        let poses = (0..self.count)
            .map(|i| {
                let yaw = wrap_angle(i as f32 * TAU / self.count as f32);
                Pose2d::new(self.radius * yaw.cos(), self.radius * yaw.sin(), yaw)
            })
            .collect();
        SonarGeometry { poses }
    }

    pub fn ranges(&self) -> SonarRanges {
        SonarRanges {
            ranges: (0..self.count).map(|i| 1.0 + 0.25 * i as f32).collect(),
        }
    }
}

impl Default for SimSonar {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Driver for SimSonar {
    fn name(&self) -> &str {
        "sim_sonar"
    }

    fn setup(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
        Ok(())
    }

    fn shutdown(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
        Ok(())
    }

    fn process_message(&self, _host: &Arc<DriverHost>, msg: &Message) -> Outcome {
        match (msg.msg_type(), msg.header().subtype) {
            (MessageType::Req, sonar::REQ_GET_GEOM) => {
                Outcome::Reply(Reply::ack(sonar::REQ_GET_GEOM, self.geometry().to_native()))
            }
            (MessageType::Req, other) => Outcome::Reply(Reply::nack(other)),
            _ => Outcome::Unhandled,
        }
    }

    fn update(&self, host: &Arc<DriverHost>) {
        host.process_messages();
        let ranges = self.ranges().to_native();
        for id in host.interfaces() {
            host.publish(id, sonar::DATA_RANGES, &ranges, None);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
