//! [`DriverHost`] – runtime wrapper around one [`Driver`] plugin.
//!
//! The host owns everything a driver shares with the rest of the server:
//!
//! | Concern | Mechanism |
//! |---|---|
//! | Subscription count | `subscribe`/`unsubscribe`, with `setup`/`shutdown` run exactly once per 0→1 / 1→0 transition under the lifecycle lock. |
//! | Inbound traffic | A [`MessageQueue`] other drivers and clients push onto. |
//! | Worker thread | `start_thread`/`stop_thread` around [`Driver::main`], with [`Driver::main_quit`] guaranteed once per run. |
//! | Data-available condition | A [`Notifier`] broadcast whenever the driver produces output. |
//! | Outbound traffic | `put_msg`/`publish`, which resolve targets through the [`DeviceRegistry`]. |
//!
//! Lock order: lifecycle, then worker, then access.  The lifecycle lock is
//! held while `setup`/`shutdown` run, so those hooks may subscribe to *other*
//! drivers but must not subscribe to their own host.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use armature_middleware::queue::DEFAULT_MAX_LEN;
use armature_middleware::{CancelToken, Message, MessageQueue, Notifier};
use armature_types::{AccessMode, DeviceId, HalError, MessageHeader, MessageType, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, debug_span, info, info_span, trace, warn};

use crate::driver::{Driver, Outcome, Reply};
use crate::registry::DeviceRegistry;

/// Construction parameters for a [`DriverHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOptions {
    /// Access mode recorded for the driver's default interface.
    pub access: AccessMode,
    /// Replace policy of the inbound queue.
    pub replace: bool,
    /// Capacity of the inbound queue.
    pub queue_len: usize,
    /// Subscribe once at startup and stay subscribed until exit.
    pub always_on: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            access: AccessMode::All,
            replace: false,
            queue_len: DEFAULT_MAX_LEN,
            always_on: false,
        }
    }
}

/// Runtime state wrapped around a [`Driver`] plugin.
pub struct DriverHost {
    id: DeviceId,
    plugin: Box<dyn Driver>,
    registry: Weak<DeviceRegistry>,
    always_on: bool,

    interfaces: Mutex<Vec<DeviceId>>,
    lifecycle: Mutex<()>,
    subscriptions: AtomicUsize,
    subscribers: Mutex<Vec<Weak<MessageQueue>>>,
    error: Mutex<Option<HalError>>,

    /// Serialises pushes made on behalf of this driver.
    access: Mutex<()>,
    signal: Notifier,
    inbox: Arc<MessageQueue>,

    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancelToken,
}

impl DriverHost {
    /// Wrap `plugin` and register it as `id` in `registry`.
    ///
    /// A registration failure does not abort construction; it is stored and
    /// can be inspected through [`DriverHost::error`].
    pub fn new(
        registry: &Arc<DeviceRegistry>,
        plugin: Box<dyn Driver>,
        id: DeviceId,
        options: HostOptions,
    ) -> Arc<Self> {
        let host = Arc::new(Self {
            id,
            plugin,
            registry: Arc::downgrade(registry),
            always_on: options.always_on,
            interfaces: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
            subscriptions: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            access: Mutex::new(()),
            signal: Notifier::new(),
            inbox: Arc::new(MessageQueue::new(options.replace, options.queue_len)),
            worker: Mutex::new(None),
            cancel: CancelToken::new(),
        });
        if let Err(e) = host.add_interface(id, options.access) {
            host.set_error(e);
        }
        host
    }

    /// Register one more interface served by this driver.
    pub fn add_interface(self: &Arc<Self>, id: DeviceId, access: AccessMode) -> Result<(), HalError> {
        let registry = self.registry().ok_or_else(|| HalError::HardwareFault {
            component: id.to_string(),
            details: "device registry has been dropped".to_string(),
        })?;
        registry.add_device(id, access, Arc::clone(self))?;
        self.interfaces.lock().push(id);
        debug!(device = %id, driver = self.plugin.name(), ?access, "interface registered");
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    /// The driver's default device identity.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    /// Every device this driver registered, in registration order.
    pub fn interfaces(&self) -> Vec<DeviceId> {
        self.interfaces.lock().clone()
    }

    pub fn inbox(&self) -> &Arc<MessageQueue> {
        &self.inbox
    }

    /// The data-available condition.  Other drivers may wait on it with their
    /// own cancellation token.
    pub fn signal(&self) -> &Notifier {
        &self.signal
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::Acquire)
    }

    pub fn always_on(&self) -> bool {
        self.always_on
    }

    /// The last error recorded by registration, setup or shutdown.
    pub fn error(&self) -> Option<HalError> {
        self.error.lock().clone()
    }

    pub fn registry(&self) -> Option<Arc<DeviceRegistry>> {
        self.registry.upgrade()
    }

    /// True while a worker thread is started and has not finished.
    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn set_error(&self, e: HalError) {
        warn!(device = %self.id, driver = self.plugin.name(), error = %e, "driver error");
        *self.error.lock() = Some(e);
    }

    // ── Subscription lifecycle ─────────────────────────────────────────────

    /// Add a subscription.  The first one runs [`Driver::setup`]; the count
    /// only grows when setup succeeds.
    ///
    /// When `client` is given, the queue receives everything this driver
    /// [`publish`][Self::publish]es until the matching
    /// [`unsubscribe`][Self::unsubscribe] or until the client drops it.
    pub fn subscribe(self: &Arc<Self>, client: Option<&Arc<MessageQueue>>) -> Result<(), HalError> {
        let _lifecycle = self.lifecycle.lock();
        let count = self.subscriptions.load(Ordering::Acquire);
        if count == 0 {
            if let Err(e) = self.plugin.setup(self) {
                self.set_error(e.clone());
                return Err(e);
            }
            info!(device = %self.id, driver = self.plugin.name(), "driver set up");
        }
        self.subscriptions.store(count + 1, Ordering::Release);
        if let Some(queue) = client {
            self.subscribers.lock().push(Arc::downgrade(queue));
        }
        debug!(device = %self.id, subscriptions = count + 1, "subscribed");
        Ok(())
    }

    /// Drop a subscription.  The last one runs [`Driver::shutdown`]; the
    /// count only shrinks when shutdown succeeds, and waiters on the
    /// data-available condition are released either way.
    pub fn unsubscribe(self: &Arc<Self>, client: Option<&Arc<MessageQueue>>) -> Result<(), HalError> {
        let _lifecycle = self.lifecycle.lock();
        let count = self.subscriptions.load(Ordering::Acquire);
        match count {
            0 => return Err(HalError::NotSubscribed(self.id)),
            1 => {
                let result = self.plugin.shutdown(self);
                self.data_available();
                if let Err(e) = result {
                    self.set_error(e.clone());
                    return Err(e);
                }
                info!(device = %self.id, driver = self.plugin.name(), "driver shut down");
            }
            _ => {}
        }
        self.subscriptions.store(count - 1, Ordering::Release);
        if let Some(queue) = client {
            let mut subscribers = self.subscribers.lock();
            if let Some(pos) = subscribers.iter().position(|q| q.as_ptr() == Arc::as_ptr(queue)) {
                subscribers.remove(pos);
            }
        }
        debug!(device = %self.id, subscriptions = count - 1, "unsubscribed");
        Ok(())
    }

    // ── Worker thread ──────────────────────────────────────────────────────

    /// Spawn a thread running [`Driver::main`].  Starting an already running
    /// driver is a no-op.
    pub fn start_thread(self: &Arc<Self>) -> Result<(), HalError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(device = %self.id, "driver thread already running");
            return Ok(());
        }
        self.cancel.reset();

        let host = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("driver-{}", self.id))
            .spawn(move || {
                let _span = info_span!("driver", device = %host.id, driver = host.plugin.name()).entered();
                let _quit = MainQuitGuard { host: &host };
                host.plugin.main(&host);
            })
            .map_err(|e| HalError::Thread {
                device: self.id,
                details: e.to_string(),
            })?;
        *worker = Some(handle);
        debug!(device = %self.id, "driver thread started");
        Ok(())
    }

    /// Cancel the worker thread and wait for it to exit.  Stopping a driver
    /// with no thread is a no-op.
    ///
    /// # Errors
    ///
    /// [`HalError::Thread`] when called from the worker itself, or when
    /// [`Driver::main`] panicked.  [`Driver::main_quit`] has run in the
    /// latter case.
    pub fn stop_thread(&self) -> Result<(), HalError> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            *self.worker.lock() = Some(handle);
            return Err(HalError::Thread {
                device: self.id,
                details: "a driver thread cannot join itself".to_string(),
            });
        }

        self.inbox.cancel_waiters(&self.cancel);
        self.signal.cancel_waiters(&self.cancel);
        let joined = handle.join();
        // Cancellation only addresses the run that just ended.
        self.cancel.reset();
        joined.map_err(|_| HalError::Thread {
            device: self.id,
            details: "driver main loop panicked".to_string(),
        })?;
        debug!(device = %self.id, "driver thread stopped");
        Ok(())
    }

    /// True while [`DriverHost::stop_thread`] is asking the worker to exit.
    /// Main loops poll this between units of work.
    pub fn test_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── Data-available condition ───────────────────────────────────────────

    /// Wake everyone waiting on this driver.
    pub fn data_available(&self) {
        self.signal.notify_all();
    }

    /// Block until the next [`DriverHost::data_available`] or cancellation.
    pub fn wait(&self) {
        let seen = self.signal.generation();
        self.signal.wait(seen, Some(&self.cancel));
    }

    /// Like [`DriverHost::wait`] with an upper bound.  Returns `false` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let seen = self.signal.generation();
        self.signal.wait_timeout(seen, Some(&self.cancel), timeout)
    }

    /// Block until the inbound queue has messages, cancellation, or timeout.
    pub fn wait_for_messages(&self, timeout: Duration) -> bool {
        self.inbox.wait_timeout(timeout, Some(&self.cancel))
    }

    // ── Message handling ───────────────────────────────────────────────────

    /// Drain the inbound queue through [`Driver::process_message`].
    /// Returns the number of messages taken off the queue.
    pub fn process_messages(self: &Arc<Self>) -> usize {
        let _span = debug_span!("process_messages", device = %self.id).entered();
        let mut processed = 0;
        while !self.test_cancel() {
            let Some(msg) = self.inbox.pop() else {
                break;
            };
            processed += 1;
            match self.plugin.process_message(self, &msg) {
                Outcome::Reply(reply) => self.send_reply(&msg, reply),
                Outcome::Handled => {}
                Outcome::Unhandled => warn!(
                    device = %msg.device_id(),
                    msg_type = %msg.msg_type(),
                    subtype = msg.header().subtype,
                    len = msg.payload().len(),
                    "unhandled message"
                ),
            }
        }
        processed
    }

    /// Main loop for drivers that only react to inbound messages.
    pub fn run_message_loop(self: &Arc<Self>) {
        while !self.test_cancel() {
            self.inbox.wait_cancellable(&self.cancel);
            self.process_messages();
        }
    }

    /// Run [`Driver::update`] when the driver has subscribers.
    pub fn update(self: &Arc<Self>) {
        if self.subscriptions() > 0 {
            self.plugin.update(self);
        }
    }

    /// The registered identity a request was addressed to.  Headers carry no
    /// port, so it is taken from the matching interface of this driver.
    fn reply_device(&self, request: &Message) -> DeviceId {
        let requested = request.device_id();
        self.interfaces
            .lock()
            .iter()
            .copied()
            .find(|id| id.interface == requested.interface && id.index == requested.index)
            .unwrap_or(requested)
    }

    fn send_reply(&self, request: &Message, reply: Reply) {
        match request.reply_to() {
            Some(queue) => {
                self.put_msg(
                    self.reply_device(request),
                    Some(&queue),
                    reply.msg_type,
                    reply.subtype,
                    &reply.payload,
                    None,
                );
            }
            None => debug!(
                device = %request.device_id(),
                msg_type = %reply.msg_type,
                subtype = reply.subtype,
                "no reply path, dropping response"
            ),
        }
    }

    /// Send a message about device `id`.
    ///
    /// The message goes to `client` when given, otherwise to the inbound
    /// queue of the driver registered as `id`.  Replies to it are routed
    /// back to this driver's inbound queue.  The timestamp defaults to now.
    ///
    /// Messages about unregistered devices are dropped without error, so a
    /// driver may report on every interface it supports whether or not it
    /// was configured to provide it.  Returns `true` when the message was
    /// queued.
    pub fn put_msg(
        &self,
        id: DeviceId,
        client: Option<&Arc<MessageQueue>>,
        msg_type: MessageType,
        subtype: u8,
        payload: &[u8],
        timestamp: Option<Timestamp>,
    ) -> bool {
        let Some(target) = self.registry().and_then(|r| r.get_driver(id)) else {
            trace!(device = %id, %msg_type, subtype, "dropping message for unregistered device");
            return false;
        };

        let header = MessageHeader::new(msg_type, subtype, id).with_timestamp(timestamp.unwrap_or_else(Timestamp::now));
        let msg = Message::with_payload(header, payload, Some(&self.inbox));
        let queue = client.unwrap_or(&target.inbox);
        let accepted = {
            let _access = self.access.lock();
            queue.push(msg)
        };
        self.data_available();
        accepted
    }

    /// Send a DATA message about `id` to every subscribed client queue.
    /// Returns how many queues accepted it.  Queues whose clients have gone
    /// away are forgotten.
    pub fn publish(&self, id: DeviceId, subtype: u8, payload: &[u8], timestamp: Option<Timestamp>) -> usize {
        let subscribers: Vec<Arc<MessageQueue>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|q| q.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        let timestamp = Some(timestamp.unwrap_or_else(Timestamp::now));
        let mut delivered = 0;
        for queue in &subscribers {
            if self.put_msg(id, Some(queue), MessageType::Data, subtype, payload, timestamp) {
                delivered += 1;
            }
        }
        delivered
    }
}

impl fmt::Debug for DriverHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHost")
            .field("id", &self.id)
            .field("driver", &self.plugin.name())
            .field("subscriptions", &self.subscriptions())
            .field("always_on", &self.always_on)
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

/// Runs [`Driver::main_quit`] when the worker body exits, including by
/// unwinding.
struct MainQuitGuard<'a> {
    host: &'a Arc<DriverHost>,
}

impl Drop for MainQuitGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(device = %self.host.id, "driver main loop panicked");
        }
        self.host.plugin.main_quit(self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armature_types::InterfaceCode;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicBool;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    enum MainMode {
        #[default]
        Loop,
        Panic,
        StopSelf,
    }

    #[derive(Default)]
    struct Tracker {
        setups: AtomicUsize,
        shutdowns: AtomicUsize,
        quits: AtomicUsize,
        up: AtomicBool,
        overlaps: AtomicUsize,
        fail_setup: AtomicBool,
        fail_shutdown: AtomicBool,
        setup_delay: Duration,
        mode: MainMode,
        seen: Mutex<Vec<(MessageType, u8)>>,
        self_stop: Mutex<Option<Result<(), HalError>>>,
    }

    struct TrackingDriver(Arc<Tracker>);

    impl Driver for TrackingDriver {
        fn name(&self) -> &str {
            "tracking"
        }

        fn setup(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
            thread::sleep(self.0.setup_delay);
            if self.0.fail_setup.load(Ordering::SeqCst) {
                return Err(HalError::SetupFailed {
                    device: host.id(),
                    details: "refused".to_string(),
                });
            }
            if self.0.up.swap(true, Ordering::SeqCst) {
                self.0.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.0.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
            if self.0.fail_shutdown.load(Ordering::SeqCst) {
                return Err(HalError::ShutdownFailed {
                    device: host.id(),
                    details: "refused".to_string(),
                });
            }
            if !self.0.up.swap(false, Ordering::SeqCst) {
                self.0.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn process_message(&self, _host: &Arc<DriverHost>, msg: &Message) -> Outcome {
            let subtype = msg.header().subtype;
            self.0.seen.lock().push((msg.msg_type(), subtype));
            match (msg.msg_type(), subtype) {
                (MessageType::Req, 1) => Outcome::Reply(Reply::ack(1, msg.payload().to_vec())),
                (MessageType::Cmd, _) => Outcome::Handled,
                _ => Outcome::Unhandled,
            }
        }

        fn main(&self, host: &Arc<DriverHost>) {
            match self.0.mode {
                MainMode::Loop => host.run_message_loop(),
                MainMode::Panic => panic!("main failure"),
                MainMode::StopSelf => *self.0.self_stop.lock() = Some(host.stop_thread()),
            }
        }

        fn main_quit(&self, _host: &Arc<DriverHost>) {
            self.0.quits.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A driver that provides none of the optional hooks.
    struct Bare;

    impl Driver for Bare {
        fn name(&self) -> &str {
            "bare"
        }
        fn setup(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
            Ok(())
        }
        fn shutdown(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
            Ok(())
        }
    }

    /// Subscribes to `source` for as long as it is itself subscribed.
    struct Derived {
        source: DeviceId,
    }

    impl Driver for Derived {
        fn name(&self) -> &str {
            "derived"
        }

        fn setup(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
            let registry = host.registry().ok_or(HalError::UnknownDevice(self.source))?;
            registry.subscribe(self.source, Some(host.inbox()))
        }

        fn shutdown(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
            let registry = host.registry().ok_or(HalError::UnknownDevice(self.source))?;
            registry.unsubscribe(self.source, Some(host.inbox()))
        }
    }

    fn laser0() -> DeviceId {
        DeviceId::new(InterfaceCode::LASER, 0)
    }

    fn sonar0() -> DeviceId {
        DeviceId::new(InterfaceCode::SONAR, 0)
    }

    fn tracked_host(registry: &Arc<DeviceRegistry>, id: DeviceId, tracker: &Arc<Tracker>) -> Arc<DriverHost> {
        DriverHost::new(
            registry,
            Box::new(TrackingDriver(Arc::clone(tracker))),
            id,
            HostOptions::default(),
        )
    }

    fn setup() -> (Arc<DeviceRegistry>, Arc<Tracker>, Arc<DriverHost>) {
        let registry = Arc::new(DeviceRegistry::new());
        let tracker = Arc::new(Tracker::default());
        let host = tracked_host(&registry, laser0(), &tracker);
        (registry, tracker, host)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    #[test]
    fn construction_registers_default_interface() {
        let (registry, _tracker, host) = setup();
        assert!(host.error().is_none());
        let found = registry.get_driver(laser0()).unwrap();
        assert!(Arc::ptr_eq(&found, &host));
    }

    #[test]
    fn duplicate_registration_is_stored_as_error() {
        let (registry, tracker, _host) = setup();
        let second = tracked_host(&registry, laser0(), &tracker);
        assert_eq!(second.error(), Some(HalError::DuplicateDevice(laser0())));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn additional_interfaces_route_to_same_host() {
        let (registry, _tracker, host) = setup();
        host.add_interface(sonar0(), AccessMode::Read).unwrap();
        assert!(Arc::ptr_eq(&registry.get_driver(sonar0()).unwrap(), &host));
        assert_eq!(registry.get_device(sonar0()).unwrap().access, AccessMode::Read);
        assert_eq!(host.interfaces(), vec![laser0(), sonar0()]);
    }

    #[test]
    fn rejected_interfaces_are_not_listed() {
        let (registry, tracker, _host) = setup();
        let second = tracked_host(&registry, laser0(), &tracker);
        assert!(second.interfaces().is_empty());
    }

    // ------------------------------------------------------------------
    // Subscription lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn setup_and_shutdown_run_once_per_transition() {
        let (_registry, tracker, host) = setup();
        host.subscribe(None).unwrap();
        host.subscribe(None).unwrap();
        assert_eq!(tracker.setups.load(Ordering::SeqCst), 1);
        assert_eq!(host.subscriptions(), 2);

        host.unsubscribe(None).unwrap();
        assert_eq!(tracker.shutdowns.load(Ordering::SeqCst), 0);
        host.unsubscribe(None).unwrap();
        assert_eq!(tracker.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(host.subscriptions(), 0);

        host.subscribe(None).unwrap();
        assert_eq!(tracker.setups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_without_subscription_fails() {
        let (_registry, tracker, host) = setup();
        assert_eq!(host.unsubscribe(None), Err(HalError::NotSubscribed(laser0())));
        assert_eq!(host.subscriptions(), 0);
        assert_eq!(tracker.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_setup_refuses_subscription() {
        let (_registry, tracker, host) = setup();
        tracker.fail_setup.store(true, Ordering::SeqCst);
        assert!(matches!(host.subscribe(None), Err(HalError::SetupFailed { .. })));
        assert_eq!(host.subscriptions(), 0);
        assert!(matches!(host.error(), Some(HalError::SetupFailed { .. })));

        tracker.fail_setup.store(false, Ordering::SeqCst);
        host.subscribe(None).unwrap();
        assert_eq!(host.subscriptions(), 1);
    }

    #[test]
    fn failed_shutdown_keeps_subscription_and_still_signals() {
        let (_registry, tracker, host) = setup();
        host.subscribe(None).unwrap();
        tracker.fail_shutdown.store(true, Ordering::SeqCst);

        let seen = host.signal().generation();
        let waiter = {
            let host = Arc::clone(&host);
            thread::spawn(move || host.signal().wait(seen, None))
        };
        assert!(matches!(host.unsubscribe(None), Err(HalError::ShutdownFailed { .. })));
        waiter.join().unwrap();
        assert_eq!(host.subscriptions(), 1);

        tracker.fail_shutdown.store(false, Ordering::SeqCst);
        host.unsubscribe(None).unwrap();
        assert_eq!(host.subscriptions(), 0);
    }

    #[test]
    fn concurrent_subscribe_with_slow_setup_sets_up_once() {
        let registry = Arc::new(DeviceRegistry::new());
        let tracker = Arc::new(Tracker {
            setup_delay: Duration::from_millis(50),
            ..Tracker::default()
        });
        let host = tracked_host(&registry, laser0(), &tracker);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let host = Arc::clone(&host);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    host.subscribe(None)
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(tracker.setups.load(Ordering::SeqCst), 1);
        assert_eq!(host.subscriptions(), 2);
    }

    #[test]
    fn interleaved_subscribers_never_overlap_setup_and_shutdown() {
        let (_registry, tracker, host) = setup();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let host = Arc::clone(&host);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        host.subscribe(None).unwrap();
                        host.unsubscribe(None).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(host.subscriptions(), 0);
        assert_eq!(tracker.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(
            tracker.setups.load(Ordering::SeqCst),
            tracker.shutdowns.load(Ordering::SeqCst)
        );
        assert!(!tracker.up.load(Ordering::SeqCst));
    }

    #[test]
    fn client_queue_receives_published_data_until_unsubscribed() {
        let (_registry, _tracker, host) = setup();
        let client = Arc::new(MessageQueue::default());
        host.subscribe(Some(&client)).unwrap();

        assert_eq!(host.publish(laser0(), 1, &[7, 7], None), 1);
        let msg = client.pop().unwrap();
        assert_eq!(msg.msg_type(), MessageType::Data);
        assert_eq!(msg.payload(), &[7, 7]);
        assert!(Arc::ptr_eq(&msg.reply_to().unwrap(), host.inbox()));

        host.unsubscribe(Some(&client)).unwrap();
        assert_eq!(host.publish(laser0(), 1, &[7, 7], None), 0);
        assert!(client.is_empty());
    }

    #[test]
    fn dropped_client_queues_stop_receiving_publishes() {
        let (_registry, _tracker, host) = setup();
        let kept = Arc::new(MessageQueue::default());
        let gone = Arc::new(MessageQueue::default());
        host.subscribe(Some(&kept)).unwrap();
        host.subscribe(Some(&gone)).unwrap();

        let weak = Arc::downgrade(&gone);
        drop(gone);
        assert!(weak.upgrade().is_none());

        assert_eq!(host.publish(laser0(), 1, &[1], None), 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(host.subscriptions(), 2);
    }

    #[test]
    fn derived_driver_subscribes_to_its_source() {
        let (registry, tracker, source) = setup();
        let derived = DriverHost::new(
            &registry,
            Box::new(Derived { source: laser0() }),
            sonar0(),
            HostOptions::default(),
        );

        derived.subscribe(None).unwrap();
        assert_eq!(source.subscriptions(), 1);
        assert_eq!(tracker.setups.load(Ordering::SeqCst), 1);

        source.publish(laser0(), 1, &[1], None);
        assert_eq!(derived.inbox().len(), 1);

        derived.unsubscribe(None).unwrap();
        assert_eq!(source.subscriptions(), 0);
        assert_eq!(tracker.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn derived_driver_fails_without_source() {
        let registry = Arc::new(DeviceRegistry::new());
        let derived = DriverHost::new(
            &registry,
            Box::new(Derived { source: laser0() }),
            sonar0(),
            HostOptions::default(),
        );
        assert_eq!(derived.subscribe(None), Err(HalError::UnknownDevice(laser0())));
        assert_eq!(derived.subscriptions(), 0);
    }

    // ------------------------------------------------------------------
    // Worker thread
    // ------------------------------------------------------------------

    #[test]
    fn main_quit_runs_once_per_run() {
        let (_registry, tracker, host) = setup();
        host.start_thread().unwrap();
        assert!(host.is_running());
        host.stop_thread().unwrap();
        assert_eq!(tracker.quits.load(Ordering::SeqCst), 1);
        assert!(!host.is_running());

        host.start_thread().unwrap();
        host.stop_thread().unwrap();
        assert_eq!(tracker.quits.load(Ordering::SeqCst), 2);

        // Nothing left to stop.
        host.stop_thread().unwrap();
        assert_eq!(tracker.quits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn main_quit_runs_when_main_panics() {
        let registry = Arc::new(DeviceRegistry::new());
        let tracker = Arc::new(Tracker {
            mode: MainMode::Panic,
            ..Tracker::default()
        });
        let host = tracked_host(&registry, laser0(), &tracker);
        host.start_thread().unwrap();
        assert!(matches!(host.stop_thread(), Err(HalError::Thread { .. })));
        assert_eq!(tracker.quits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_cannot_join_itself() {
        let registry = Arc::new(DeviceRegistry::new());
        let tracker = Arc::new(Tracker {
            mode: MainMode::StopSelf,
            ..Tracker::default()
        });
        let host = tracked_host(&registry, laser0(), &tracker);
        host.start_thread().unwrap();
        host.stop_thread().unwrap();

        assert!(matches!(
            tracker.self_stop.lock().clone(),
            Some(Err(HalError::Thread { .. }))
        ));
        assert_eq!(tracker.quits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_driver_blocks_and_drains_again() {
        let (registry, tracker, host) = setup();
        let sender = DriverHost::new(&registry, Box::new(Bare), sonar0(), HostOptions::default());
        host.start_thread().unwrap();
        host.stop_thread().unwrap();
        assert!(!host.test_cancel());

        let started = std::time::Instant::now();
        assert!(!host.wait_timeout(Duration::from_millis(30)));
        assert!(!host.wait_for_messages(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(60));

        assert!(sender.put_msg(laser0(), None, MessageType::Req, 1, &[3], None));
        assert_eq!(host.process_messages(), 1);
        assert_eq!(tracker.seen.lock().as_slice(), &[(MessageType::Req, 1)]);
        assert_eq!(sender.inbox().pop().unwrap().msg_type(), MessageType::RespAck);
    }

    #[test]
    fn unsubscribed_threaded_driver_still_answers_requests() {
        struct Threaded(Arc<Tracker>);
        impl Driver for Threaded {
            fn name(&self) -> &str {
                "threaded"
            }
            fn setup(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
                host.start_thread()
            }
            fn shutdown(&self, host: &Arc<DriverHost>) -> Result<(), HalError> {
                host.stop_thread()
            }
            fn process_message(&self, host: &Arc<DriverHost>, msg: &Message) -> Outcome {
                TrackingDriver(Arc::clone(&self.0)).process_message(host, msg)
            }
            fn main(&self, host: &Arc<DriverHost>) {
                host.run_message_loop();
            }
        }

        let registry = Arc::new(DeviceRegistry::new());
        let tracker = Arc::new(Tracker::default());
        let host = DriverHost::new(
            &registry,
            Box::new(Threaded(Arc::clone(&tracker))),
            laser0(),
            HostOptions::default(),
        );
        let sender = DriverHost::new(&registry, Box::new(Bare), sonar0(), HostOptions::default());
        host.subscribe(None).unwrap();
        host.unsubscribe(None).unwrap();
        assert!(!host.is_running());

        assert!(sender.put_msg(laser0(), None, MessageType::Req, 1, &[6], None));
        assert_eq!(host.process_messages(), 1);
        assert_eq!(sender.inbox().pop().unwrap().payload(), &[6]);
    }

    #[test]
    fn default_main_returns_immediately() {
        let registry = Arc::new(DeviceRegistry::new());
        let host = DriverHost::new(&registry, Box::new(Bare), laser0(), HostOptions::default());
        host.start_thread().unwrap();
        host.stop_thread().unwrap();
    }

    #[test]
    fn message_loop_processes_while_running() {
        let (registry, tracker, host) = setup();
        let sender = DriverHost::new(&registry, Box::new(Bare), sonar0(), HostOptions::default());
        host.start_thread().unwrap();

        assert!(sender.put_msg(laser0(), None, MessageType::Req, 1, &[4, 2], None));
        assert!(sender.inbox().wait_timeout(Duration::from_secs(5), None));
        host.stop_thread().unwrap();

        let reply = sender.inbox().pop().unwrap();
        assert_eq!(reply.msg_type(), MessageType::RespAck);
        assert_eq!(reply.payload(), &[4, 2]);
        assert_eq!(tracker.seen.lock().as_slice(), &[(MessageType::Req, 1)]);
    }

    #[test]
    fn driver_wait_is_released_by_data_available_and_cancel() {
        let (_registry, _tracker, host) = setup();
        assert!(!host.wait_timeout(Duration::from_millis(10)));

        let waiter = {
            let host = Arc::clone(&host);
            thread::spawn(move || host.wait())
        };
        while !waiter.is_finished() {
            host.data_available();
            thread::sleep(Duration::from_millis(1));
        }
        waiter.join().unwrap();
    }

    // ------------------------------------------------------------------
    // Message routing
    // ------------------------------------------------------------------

    #[test]
    fn put_msg_to_unregistered_device_is_ignored() {
        let (_registry, _tracker, host) = setup();
        let client = Arc::new(MessageQueue::default());
        assert!(!host.put_msg(sonar0(), Some(&client), MessageType::Data, 1, &[1], None));
        assert!(!host.put_msg(sonar0(), None, MessageType::Data, 1, &[1], None));
        assert!(client.is_empty());
        assert!(host.inbox().is_empty());
    }

    #[test]
    fn put_msg_without_client_lands_in_target_inbox() {
        let (registry, _tracker, target) = setup();
        let sender = DriverHost::new(&registry, Box::new(Bare), sonar0(), HostOptions::default());
        let ts = Timestamp::new(12, 34);

        assert!(sender.put_msg(laser0(), None, MessageType::Cmd, 2, &[9], Some(ts)));
        let msg = target.inbox().pop().unwrap();
        assert_eq!(msg.device_id(), laser0());
        assert_eq!(msg.header().timestamp, ts);
        assert_eq!(msg.header().size, 1);
        assert!(Arc::ptr_eq(&msg.reply_to().unwrap(), sender.inbox()));
    }

    #[test]
    fn put_msg_signals_data_available() {
        let (_registry, _tracker, host) = setup();
        let client = Arc::new(MessageQueue::default());
        let before = host.signal().generation();
        host.put_msg(laser0(), Some(&client), MessageType::Data, 1, &[], None);
        assert_ne!(host.signal().generation(), before);
    }

    #[test]
    fn unhandled_messages_do_not_stop_processing() {
        let (registry, tracker, host) = setup();
        let sender = DriverHost::new(&registry, Box::new(Bare), sonar0(), HostOptions::default());

        sender.put_msg(laser0(), None, MessageType::Data, 9, &[1, 2, 3], None);
        sender.put_msg(laser0(), None, MessageType::Cmd, 1, &[], None);
        sender.put_msg(laser0(), None, MessageType::Req, 1, &[5], None);

        assert_eq!(host.process_messages(), 3);
        assert_eq!(tracker.seen.lock().len(), 3);
        let reply = sender.inbox().pop().unwrap();
        assert_eq!(reply.msg_type(), MessageType::RespAck);
        assert!(sender.inbox().is_empty());
    }

    #[test]
    fn replies_reach_clients_of_ported_devices() {
        let registry = Arc::new(DeviceRegistry::new());
        let tracker = Arc::new(Tracker::default());
        let ported = laser0().with_port(7000);
        let host = tracked_host(&registry, ported, &tracker);
        let client = Arc::new(MessageQueue::default());

        let header = MessageHeader::new(MessageType::Req, 1, ported);
        host.inbox().push(Message::with_payload(header, &[8], Some(&client)));
        assert_eq!(host.process_messages(), 1);

        let reply = client.pop().unwrap();
        assert_eq!(reply.msg_type(), MessageType::RespAck);
        assert_eq!(reply.payload(), &[8]);
        assert_eq!(reply.device_id(), laser0());
        assert!(Arc::ptr_eq(&reply.reply_to().unwrap(), host.inbox()));
    }

    #[test]
    fn reply_without_reply_path_is_dropped() {
        let (_registry, tracker, host) = setup();
        let header = MessageHeader::new(MessageType::Req, 1, laser0());
        host.inbox().push(Message::with_payload(header, &[1], None));
        assert_eq!(host.process_messages(), 1);
        assert_eq!(tracker.seen.lock().len(), 1);
    }

    #[test]
    fn update_only_runs_while_subscribed() {
        struct Counting(Arc<AtomicUsize>);
        impl Driver for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            fn setup(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
                Ok(())
            }
            fn shutdown(&self, _host: &Arc<DriverHost>) -> Result<(), HalError> {
                Ok(())
            }
            fn update(&self, _host: &Arc<DriverHost>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = Arc::new(DeviceRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let host = DriverHost::new(
            &registry,
            Box::new(Counting(Arc::clone(&calls))),
            laser0(),
            HostOptions::default(),
        );
        host.update();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        host.subscribe(None).unwrap();
        host.update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
