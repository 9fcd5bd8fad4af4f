//! One-shot boolean event used to wake waiters on request completion.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A boolean flag with wait-for-on / wait-for-off semantics.
///
/// `wait_any` registers one switch with every request it watches; the first
/// request to complete turns it on. The prefetcher keeps one switch per
/// buffer slot.
#[derive(Debug, Default)]
pub struct OnOffSwitch {
    on: Mutex<bool>,
    cond: Condvar,
}

impl OnOffSwitch {
    /// Creates a switch in the given position.
    pub fn new(on: bool) -> Self {
        Self {
            on: Mutex::new(on),
            cond: Condvar::new(),
        }
    }

    /// Turns the switch on and wakes every waiter.
    pub fn on(&self) {
        let mut on = self.on.lock();
        *on = true;
        self.cond.notify_all();
    }

    /// Turns the switch off and wakes every waiter.
    pub fn off(&self) {
        let mut on = self.on.lock();
        *on = false;
        self.cond.notify_all();
    }

    /// Returns the current position without blocking.
    pub fn is_on(&self) -> bool {
        *self.on.lock()
    }

    /// Blocks until the switch is on.
    pub fn wait_for_on(&self) {
        let mut on = self.on.lock();
        while !*on {
            self.cond.wait(&mut on);
        }
    }

    /// Blocks until the switch is off.
    pub fn wait_for_off(&self) {
        let mut on = self.on.lock();
        while *on {
            self.cond.wait(&mut on);
        }
    }

    /// Blocks until the switch is on or the timeout elapses. Returns the
    /// position observed last.
    pub fn wait_for_on_timeout(&self, timeout: Duration) -> bool {
        let mut on = self.on.lock();
        if !*on {
            self.cond.wait_while_for(&mut on, |on| !*on, timeout);
        }
        *on
    }
}
