//! Single-waiter cooperative notifier.
//!
//! A [`SingleWaiterNotifier`] is awaited by one thread (a transmitter waiting
//! on credit or a response) and signalled by others. Signals raised on an
//! event delivery thread are deferred: the flag is set immediately but the
//! wakeup is queued on the signalling thread until [`flush`] runs, so a batch
//! of receipts produces one wakeup rather than one per receipt. Collectors
//! call [`flush`] from their own `flush`, which transports invoke when their
//! inbound queue drains.
//!
//! A notifier sits on at most one thread's deferred list. A signal raised on
//! any other thread while it is queued wakes the waiter immediately.
//!
//! Waiters never rely solely on the deferred wakeup; they re-check the flag on
//! a short bounded interval.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

const RECHECK_INTERVAL: Duration = Duration::from_millis(5);

thread_local! {
    static PENDING: RefCell<Vec<Arc<SingleWaiterNotifier>>> = const { RefCell::new(Vec::new()) };
}

/// Wake every notifier signalled by the current thread since the last flush.
pub fn flush() {
    let pending = PENDING.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for notifier in pending {
        *notifier.queued_on.lock() = None;
        notifier.wake();
    }
}

/// Number of deferred wakeups queued on the current thread
pub fn pending() -> usize {
    PENDING.with(|p| p.borrow().len())
}

#[derive(Debug, Default)]
pub struct SingleWaiterNotifier {
    signalled: Mutex<bool>,
    cond: Condvar,
    /// Thread whose deferred list holds this notifier
    queued_on: Mutex<Option<ThreadId>>,
}

impl SingleWaiterNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the signal and defer the wakeup to the next [`flush`] on this
    /// thread, or wake now if another thread already holds the deferral
    pub fn signal(self: &Arc<Self>) {
        *self.signalled.lock() = true;
        let current = thread::current().id();
        let mut queued_on = self.queued_on.lock();
        match *queued_on {
            Some(owner) if owner == current => {}
            Some(_) => {
                drop(queued_on);
                self.wake();
            }
            None => {
                *queued_on = Some(current);
                drop(queued_on);
                let me = Arc::clone(self);
                PENDING.with(|p| p.borrow_mut().push(me));
            }
        }
    }

    /// Set the signal and wake the waiter immediately
    pub fn signal_now(&self) {
        *self.signalled.lock() = true;
        self.wake();
    }

    fn wake(&self) {
        self.cond.notify_one();
    }

    /// Block until signalled or `timeout` elapses; consumes the signal.
    ///
    /// Returns `true` when a signal was consumed.
    pub fn await_signal(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signalled = self.signalled.lock();
        loop {
            if *signalled {
                *signalled = false;
                return true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(RECHECK_INTERVAL)
                }
                None => RECHECK_INTERVAL,
            };
            self.cond.wait_for(&mut signalled, slice);
        }
    }

    /// Whether a signal is pending, without consuming it
    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }
}
