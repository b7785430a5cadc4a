//! Asynchronous notifications delivered to the engine from outside a tick.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Charger events raised by interrupt handlers or other tasks, and the little state that
/// lives as long as one cable insertion.
///
/// Only plain loads and stores are used so this works on targets without CAS.
#[derive(Debug, Default)]
pub struct ChargerEvents {
    plugged_out: AtomicBool,
    force_single_path: AtomicBool,
    priority_inversion: AtomicBool,
    adapter_otp: AtomicU8,
}

impl ChargerEvents {
    /// Create a new `ChargerEvents` with no event pending
    pub const fn new() -> Self {
        ChargerEvents {
            plugged_out: AtomicBool::new(false),
            force_single_path: AtomicBool::new(false),
            priority_inversion: AtomicBool::new(false),
            adapter_otp: AtomicU8::new(0),
        }
    }

    /// A charger cable was attached. Clears the plugged-out state and the adapter history.
    pub fn charger_inserted(&self) {
        self.adapter_otp.store(0, Ordering::Release);
        self.plugged_out.store(false, Ordering::Release);
    }

    /// The charger cable was removed. Cancels detection and any running session.
    pub fn charger_removed(&self) {
        self.plugged_out.store(true, Ordering::Release);
    }

    /// Has the cable been removed since the last insertion?
    pub fn plugged_out(&self) -> bool {
        self.plugged_out.load(Ordering::Acquire)
    }

    /// Request (or release) single path operation, e.g. for a factory path test.
    pub fn set_force_single_path(&self, force: bool) {
        self.force_single_path.store(force, Ordering::Release);
    }

    /// Is single path operation being forced?
    pub fn force_single_path(&self) -> bool {
        self.force_single_path.load(Ordering::Acquire)
    }

    /// Another charge topology has claimed priority over this session.
    pub fn set_priority_inversion(&self, inverted: bool) {
        self.priority_inversion.store(inverted, Ordering::Release);
    }

    /// Has another charge topology claimed priority?
    pub fn priority_inversion(&self) -> bool {
        self.priority_inversion.load(Ordering::Acquire)
    }

    /// Count an adapter over-temperature stop. Returns the count since insertion.
    ///
    /// Only the session holding the charger calls this, so load then store is enough.
    pub fn note_adapter_otp(&self) -> u8 {
        let count = self.adapter_otp.load(Ordering::Acquire).saturating_add(1);
        self.adapter_otp.store(count, Ordering::Release);
        count
    }

    /// Adapter over-temperature stops since insertion
    pub fn adapter_otp_count(&self) -> u8 {
        self.adapter_otp.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_clears_state() {
        let events = ChargerEvents::new();
        events.charger_removed();
        assert_eq!(events.note_adapter_otp(), 1);
        assert_eq!(events.note_adapter_otp(), 2);
        assert!(events.plugged_out());

        events.charger_inserted();
        assert!(!events.plugged_out());
        assert_eq!(events.adapter_otp_count(), 0);
    }
}
