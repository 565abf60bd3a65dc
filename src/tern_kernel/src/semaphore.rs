//! Counting semaphores
use core::sync::atomic::Ordering;

use crate::{klock, KernelTraits};

/// A counting semaphore.
///
/// The counter never goes negative: takers that find it exhausted poll
/// (optionally yielding) instead of enqueueing, so `give` is a plain
/// increment and is safe to call from interrupt context.
pub struct Semaphore<Traits> {
    value: klock::CpuLockCell<Traits, i32>,
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Create a semaphore with `count` initial permits.
    pub const fn new(count: i32) -> Self {
        Self {
            value: klock::CpuLockCell::new(count),
        }
    }

    /// Release one permit. ISR-safe.
    pub fn give(&self) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        *self.value.write(&mut *lock) += 1;
    }

    /// Acquire one permit, polling without yielding. Fails once
    /// `timeout_ticks` have elapsed (`0` means a single poll).
    ///
    /// The wait burns the caller's quantum; prefer [`Self::cooperative_take`]
    /// for waits expected to outlast one quantum.
    pub fn take(&self, timeout_ticks: u32) -> bool {
        self.take_inner(timeout_ticks, false)
    }

    /// Acquire one permit, yielding the processor between polls.
    pub fn cooperative_take(&self, timeout_ticks: u32) -> bool {
        self.take_inner(timeout_ticks, true)
    }

    fn take_inner(&self, timeout_ticks: u32, yield_while_waiting: bool) -> bool {
        let state = Traits::state();
        let deadline = state
            .tick_count
            .load(Ordering::Relaxed)
            .saturating_add(timeout_ticks);

        loop {
            {
                let mut lock = klock::lock_cpu::<Traits>().unwrap();
                let value = self.value.write(&mut *lock);
                if *value > 0 {
                    *value -= 1;
                    return true;
                }
            }
            if state.tick_count.load(Ordering::Relaxed) >= deadline {
                return false;
            }
            if yield_while_waiting {
                // Safety: CPU Lock released above
                unsafe { Traits::yield_cpu() };
            }
        }
    }
}
