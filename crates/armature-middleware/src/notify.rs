//! Broadcast wake-ups with cancellable blocking waits.
//!
//! A [`Notifier`] counts broadcasts in a generation counter.  A waiter
//! records the generation it has seen and sleeps until the counter moves,
//! which makes wake-ups impossible to lose between "check for work" and
//! "go to sleep", and makes spurious condvar wake-ups harmless.
//!
//! A [`CancelToken`] lets a blocked waiter be released for shutdown.  The
//! flag is checked under the notifier's lock, so a cancellation that races
//! with a waiter falling asleep is never missed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Shared cancellation flag for a worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag so the token can guard the next worker run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Broadcast condition with a generation counter.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation.  Read it *before* checking for work, then
    /// pass it to [`Notifier::wait`].
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the generation differs from `seen` or `cancel` fires.
    pub fn wait(&self, seen: u64, cancel: Option<&CancelToken>) {
        let mut generation = self.generation.lock();
        while *generation == seen && !cancel.is_some_and(CancelToken::is_cancelled) {
            self.cond.wait(&mut generation);
        }
    }

    /// Like [`Notifier::wait`] with an upper bound.  Returns `true` when woken
    /// by a broadcast or cancellation, `false` on timeout.
    pub fn wait_timeout(&self, seen: u64, cancel: Option<&CancelToken>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return true;
            }
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen || cancel.is_some_and(CancelToken::is_cancelled);
            }
        }
        true
    }

    /// Set `cancel` and wake every waiter so that cancellable waits return.
    pub fn cancel_waiters(&self, cancel: &CancelToken) {
        cancel.cancel();
        self.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_generation_moved() {
        let n = Notifier::new();
        let seen = n.generation();
        n.notify_all();
        // Must not block.
        n.wait(seen, None);
    }

    #[test]
    fn broadcast_releases_every_waiter() {
        let n = Arc::new(Notifier::new());
        let seen = n.generation();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let n = n.clone();
                thread::spawn(move || n.wait(seen, None))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        n.notify_all();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn cancel_releases_waiter() {
        let n = Arc::new(Notifier::new());
        let token = CancelToken::new();
        let seen = n.generation();
        let waiter = {
            let n = n.clone();
            let token = token.clone();
            thread::spawn(move || n.wait(seen, Some(&token)))
        };
        thread::sleep(Duration::from_millis(20));
        n.cancel_waiters(&token);
        waiter.join().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelled_token_never_blocks() {
        let n = Notifier::new();
        let token = CancelToken::new();
        token.cancel();
        n.wait(n.generation(), Some(&token));
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn wait_timeout_reports_timeout() {
        let n = Notifier::new();
        assert!(!n.wait_timeout(n.generation(), None, Duration::from_millis(10)));
        let seen = n.generation();
        n.notify_all();
        assert!(n.wait_timeout(seen, None, Duration::from_millis(10)));
    }
}
