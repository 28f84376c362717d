//! Administrative suspend/resume of a running test.

use std::sync::{Condvar, Mutex};
use tracing::info;

/// A condition-variable gate. Test code calls [`wait_while_suspended`] at
/// safe points; an operator flips the gate through the autot channel.
///
/// [`wait_while_suspended`]: SuspendGate::wait_while_suspended
#[derive(Debug, Default)]
pub struct SuspendGate {
    suspended: Mutex<bool>,
    cond: Condvar,
}

impl SuspendGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        *self.suspended.lock().unwrap_or_else(|e| e.into_inner()) = true;
        info!("test suspended");
    }

    pub fn resume(&self) {
        *self.suspended.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.cond.notify_all();
        info!("test resumed");
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until not suspended. Spurious wakeups re-check the flag.
    pub fn wait_while_suspended(&self) {
        let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
        while *suspended {
            suspended = self.cond.wait(suspended).unwrap_or_else(|e| e.into_inner());
        }
    }

}
