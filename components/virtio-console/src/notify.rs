//! Guest notification
//!
//! The device raises an interrupt towards the guest through a
//! [`GuestNotifier`]. [`IrqCounter`] records triggers and is what tests and
//! the simulated guest driver use.

use std::cell::Cell;
use std::rc::Rc;

/// Interrupt line towards the guest
pub trait GuestNotifier {
    /// Raise the interrupt
    fn trigger(&self);
}

/// Notifier that counts triggers
///
/// Clones share the counter, so one clone can be handed to the device and
/// the other kept to observe it.
#[derive(Debug, Clone, Default)]
pub struct IrqCounter {
    count: Rc<Cell<u64>>,
}

impl IrqCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of triggers so far
    pub fn count(&self) -> u64 {
        self.count.get()
    }

    /// Return the count and reset it to zero (acknowledge)
    pub fn take(&self) -> u64 {
        self.count.replace(0)
    }
}

impl GuestNotifier for IrqCounter {
    fn trigger(&self) {
        self.count.set(self.count.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_count() {
        let irq = IrqCounter::new();
        let device_side = irq.clone();
        device_side.trigger();
        device_side.trigger();

        assert_eq!(irq.count(), 2);
        assert_eq!(irq.take(), 2);
        assert_eq!(device_side.count(), 0);
    }
}
