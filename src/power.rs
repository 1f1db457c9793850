//! Power management flags shared between the event context and the
//! application thread.
//!
//! Each flag has one setter side and one clearer side. Plain loads and
//! stores are enough, so no read-modify-write atomics are needed.

use core::sync::atomic::{AtomicBool, Ordering};

/// Standby and link power requests.
#[derive(Debug, Default)]
pub struct PowerState {
    standby_enabled: AtomicBool,
    standby_trigger: AtomicBool,
    force_link_u2: AtomicBool,
}

impl PowerState {
    /// All flags clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter standby the next time VBus goes away.
    pub fn arm_standby(&self) {
        self.standby_enabled.store(true, Ordering::Release);
    }

    /// Whether standby entry is armed.
    pub fn is_standby_armed(&self) -> bool {
        self.standby_enabled.load(Ordering::Acquire)
    }

    /// VBus went away. Turns an armed standby into a pending one and disarms it.
    ///
    /// Returns whether standby is now pending.
    pub fn on_vbus_removed(&self) -> bool {
        if !self.standby_enabled.load(Ordering::Acquire) {
            return false;
        }
        self.standby_enabled.store(false, Ordering::Relaxed);
        self.standby_trigger.store(true, Ordering::Release);
        true
    }

    /// Whether standby entry is pending.
    pub fn is_standby_pending(&self) -> bool {
        self.standby_trigger.load(Ordering::Acquire)
    }

    /// Clear the pending standby entry, returning whether it was set.
    pub fn take_standby_trigger(&self) -> bool {
        if self.standby_trigger.load(Ordering::Acquire) {
            self.standby_trigger.store(false, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Ask the application thread to push the link into U2.
    pub fn set_force_link_u2(&self, force: bool) {
        self.force_link_u2.store(force, Ordering::Release);
    }

    /// Whether the link should be pushed into U2.
    pub fn force_link_u2(&self) -> bool {
        self.force_link_u2.load(Ordering::Acquire)
    }
}
