//! [`Message`] – shared envelope of one protocol message.
//!
//! A message is created once by a producer (a driver or the wire decoder)
//! and then handed around by cloning the handle.  Cloning bumps an atomic
//! reference count and aliases the same buffer; the buffer is freed when the
//! last handle is dropped, whichever thread that happens on.

use std::fmt;
use std::sync::{Arc, Weak};

use armature_types::{DeviceId, MessageHeader, MessageType};
use tracing::warn;

use crate::queue::MessageQueue;

struct Envelope {
    header: MessageHeader,
    payload: Box<[u8]>,
    reply_to: Option<Weak<MessageQueue>>,
}

/// Immutable, reference-counted protocol message.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Envelope>,
}

impl Message {
    /// Copy `header` and `payload` into a new message.
    ///
    /// `reply_to` is the queue replies should be delivered to (the queue of
    /// the client or driver that produced the message).  It is held weakly,
    /// so a queued message never keeps its sender's queue alive.
    ///
    /// When `header.size` disagrees with the payload length a warning is
    /// logged and the stored header is corrected to the real length.
    pub fn new(header: MessageHeader, payload: &[u8], reply_to: Option<&Arc<MessageQueue>>) -> Self {
        let mut header = header;
        if header.size as usize != payload.len() {
            warn!(
                device = %header.device_id(),
                msg_type = %header.msg_type,
                subtype = header.subtype,
                declared = header.size,
                actual = payload.len(),
                "message size does not match header"
            );
            header.size = payload.len() as u32;
        }
        Self {
            inner: Arc::new(Envelope {
                header,
                payload: payload.into(),
                reply_to: reply_to.map(Arc::downgrade),
            }),
        }
    }

    /// Build a message whose header size is taken from `payload`.
    pub fn with_payload(mut header: MessageHeader, payload: &[u8], reply_to: Option<&Arc<MessageQueue>>) -> Self {
        header.size = payload.len() as u32;
        Self::new(header, payload, reply_to)
    }

    pub fn header(&self) -> &MessageHeader {
        &self.inner.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn msg_type(&self) -> MessageType {
        self.inner.header.msg_type
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.header.device_id()
    }

    /// The queue replies should go to, if the sender is still alive.
    pub fn reply_to(&self) -> Option<Arc<MessageQueue>> {
        self.inner.reply_to.as_ref().and_then(Weak::upgrade)
    }

    /// True when both messages share a (type, subtype, device) signature.
    pub fn same_signature(&self, other: &Message) -> bool {
        self.inner.header.same_signature(&other.inner.header)
    }

    /// Number of live handles to this message's buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles alias the same buffer.
    pub fn ptr_eq(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> Weak<impl Sized + use<>> {
        Arc::downgrade(&self.inner)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.inner.header)
            .field("payload_len", &self.inner.payload.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
