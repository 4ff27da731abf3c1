//! `armature-middleware` – the message plumbing.
//!
//! Moves protocol messages between drivers and clients without caring about
//! what they mean.
//!
//! # Modules
//!
//! - [`message`] – [`Message`]: a shared, immutable header + payload envelope.
//! - [`notify`] – [`Notifier`] and [`CancelToken`]: broadcast wake-ups with
//!   cancellable blocking waits.
//! - [`queue`] – [`MessageQueue`]: bounded, ordered, thread-safe queue with
//!   replace-on-push coalescing for DATA and CMD traffic.
//! - [`codec`] – native and XDR payload encodings plus the [`PackFn`]
//!   signature every wire codec implements.
//! - [`payloads`] – payload definitions for the built-in interfaces.
//! - [`dispatch`] – [`WireDispatchTable`]: resolves the pack function for an
//!   (interface, type, subtype) triple.
//! - [`envelope`] – encodes messages into wire frames and decodes them back.

pub mod codec;
pub mod dispatch;
pub mod envelope;
pub mod message;
pub mod notify;
pub mod payloads;
pub mod queue;

pub use codec::{Encoding, PackFn, Payload, WireError, XdrOp};
pub use dispatch::{DispatchEntry, WireDispatchTable};
pub use envelope::{decode_frame, encode_message, WireHeader};
pub use message::Message;
pub use notify::{CancelToken, Notifier};
pub use queue::MessageQueue;
