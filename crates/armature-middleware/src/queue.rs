//! [`MessageQueue`] – bounded, ordered, thread-safe message queue.
//!
//! Every driver owns one inbound queue and every client connection owns one
//! outbound queue.  The queue's policy is fixed at construction:
//!
//! | Policy | Effect |
//! |---|---|
//! | `replace = true` | Pushing DATA or CMD first removes the newest queued message with the same (type, subtype, device) signature, so only the latest sample of each kind waits for delivery. REQ and RESP traffic is never replaced. |
//! | `max_len` | Hard cap on queued messages.  A push at capacity is dropped with a warning; the producer never blocks. |
//!
//! Consumers block in [`MessageQueue::wait`] until a push or an explicit
//! [`MessageQueue::data_available`] broadcast.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::message::Message;
use crate::notify::{CancelToken, Notifier};

/// Default capacity of driver inbound queues.
pub const DEFAULT_MAX_LEN: usize = 32;

pub struct MessageQueue {
    id: Uuid,
    replace: bool,
    max_len: usize,
    items: Mutex<VecDeque<Message>>,
    notifier: Notifier,
}

impl MessageQueue {
    pub fn new(replace: bool, max_len: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            replace,
            max_len,
            items: Mutex::new(VecDeque::with_capacity(max_len.min(1024))),
            notifier: Notifier::new(),
        }
    }

    /// Identifier used in log output.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn replace(&self) -> bool {
        self.replace
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append `msg`, applying the replace policy first.
    ///
    /// Returns `false` when the queue is full; the message is dropped with a
    /// warning.  Waiters are signalled either way.
    pub fn push(&self, msg: Message) -> bool {
        let accepted = {
            let mut items = self.items.lock();

            if self.replace && msg.msg_type().is_replaceable() {
                if let Some(pos) = items.iter().rposition(|queued| queued.same_signature(&msg)) {
                    items.remove(pos);
                    trace!(queue = %self.id, subtype = msg.header().subtype, "replaced queued message");
                }
            }

            if items.len() >= self.max_len {
                warn!(
                    queue = %self.id,
                    len = items.len(),
                    max_len = self.max_len,
                    device = %msg.device_id(),
                    msg_type = %msg.msg_type(),
                    "tried to push onto a full message queue"
                );
                false
            } else {
                items.push_back(msg);
                true
            }
        };
        self.notifier.notify_all();
        accepted
    }

    /// Remove and return the oldest message.  Never blocks.
    pub fn pop(&self) -> Option<Message> {
        self.items.lock().pop_front()
    }

    /// Block until the queue is non-empty or a broadcast arrives.
    pub fn wait(&self) {
        let seen = self.notifier.generation();
        if !self.is_empty() {
            return;
        }
        self.notifier.wait(seen, None);
    }

    /// [`MessageQueue::wait`] that also returns once `cancel` fires.
    pub fn wait_cancellable(&self, cancel: &CancelToken) {
        let seen = self.notifier.generation();
        if !self.is_empty() || cancel.is_cancelled() {
            return;
        }
        self.notifier.wait(seen, Some(cancel));
    }

    /// Bounded wait.  Returns `true` when there is work or a wake-up arrived.
    pub fn wait_timeout(&self, timeout: Duration, cancel: Option<&CancelToken>) -> bool {
        let seen = self.notifier.generation();
        if !self.is_empty() {
            return true;
        }
        self.notifier.wait_timeout(seen, cancel, timeout)
    }

    /// Wake every thread blocked in a wait on this queue.
    pub fn data_available(&self) {
        self.notifier.notify_all();
    }

    /// Set `cancel` and wake this queue's waiters.
    pub fn cancel_waiters(&self, cancel: &CancelToken) {
        self.notifier.cancel_waiters(cancel);
    }

    /// Drop every queued message.
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("id", &self.id)
            .field("replace", &self.replace)
            .field("max_len", &self.max_len)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(false, DEFAULT_MAX_LEN)
    }
}
