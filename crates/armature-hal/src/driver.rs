//! The `Driver` plugin trait.
//!
//! A driver is the piece of code that talks to one piece of hardware (or
//! simulates it).  It only implements the device-specific hooks below; the
//! subscription bookkeeping, worker thread, inbound queue and message routing
//! are owned by the [`DriverHost`] that wraps it.
//!
//! Two styles are supported:
//!
//! - **Self-threaded** drivers call [`DriverHost::start_thread`] from
//!   [`Driver::setup`] and [`DriverHost::stop_thread`] from
//!   [`Driver::shutdown`].  Their [`Driver::main`] loops until
//!   [`DriverHost::test_cancel`] turns true.
//! - **Polled** drivers do their work in [`Driver::update`], which the
//!   server loop calls while the driver has subscribers.

use std::sync::Arc;

use armature_middleware::Message;
use armature_types::{HalError, MessageType};
use tracing::error;

use crate::host::DriverHost;

/// A response produced by [`Driver::process_message`].  The payload is in
/// native layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub msg_type: MessageType,
    pub subtype: u8,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn ack(subtype: u8, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::RespAck,
            subtype,
            payload,
        }
    }

    pub fn nack(subtype: u8) -> Self {
        Self {
            msg_type: MessageType::RespNack,
            subtype,
            payload: Vec::new(),
        }
    }

    pub fn error(subtype: u8) -> Self {
        Self {
            msg_type: MessageType::RespErr,
            subtype,
            payload: Vec::new(),
        }
    }
}

/// What a driver did with an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send this response back to the message's sender.
    Reply(Reply),
    /// Consumed, nothing to send back.
    Handled,
    /// The driver does not understand this message.
    Unhandled,
}

/// Device-specific hooks of a driver plugin.
///
/// Every hook receives the [`DriverHost`] so that it can publish data, send
/// messages to other devices or manage its worker thread.  Hooks take
/// `&self`; drivers keep mutable state behind their own locks.
pub trait Driver: Send + Sync + 'static {
    /// Driver name, reported in logs and device listings.
    fn name(&self) -> &str;

    /// Called when the first client subscribes.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::SetupFailed`] (or any other [`HalError`]) when the
    /// device cannot be brought up.  The subscription is then refused.
    fn setup(&self, host: &Arc<DriverHost>) -> Result<(), HalError>;

    /// Called when the last client unsubscribes.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::ShutdownFailed`] when the device could not be
    /// brought down.  The subscription is then kept.
    fn shutdown(&self, host: &Arc<DriverHost>) -> Result<(), HalError>;

    /// Handle one inbound message.
    fn process_message(&self, _host: &Arc<DriverHost>, _msg: &Message) -> Outcome {
        Outcome::Unhandled
    }

    /// Body of the worker thread started by [`DriverHost::start_thread`].
    fn main(&self, host: &Arc<DriverHost>) {
        error!(device = %host.id(), driver = self.name(), "driver did not provide a main loop");
    }

    /// Cleanup after [`Driver::main`] returns, unwinds or is cancelled.
    fn main_quit(&self, _host: &Arc<DriverHost>) {}

    /// Periodic work for polled drivers.
    fn update(&self, _host: &Arc<DriverHost>) {}
}
