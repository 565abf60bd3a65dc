//! Mutexes
//!
//! A mutex is a capacity-1 semaphore plus ownership metadata. Waiting is
//! cooperative polling, made livelock-free by single-step priority
//! inheritance: every failed poll lifts the holder to the waiter's priority,
//! and releasing posts a raise to the recorded requester so it is dispatched
//! promptly (see the notification module for the raise mechanism).
use core::sync::atomic::Ordering;

use crate::{cfg::PRIORITY_MAX, klock, KernelTraits, TaskId};

/// A mutual-exclusion primitive with priority inheritance.
pub struct Mutex<Traits> {
    /// Number of free permits: 1 = free, 0 = held. `give` infers "nobody
    /// holds it" from `value == 1`, which is correct only because the
    /// capacity is exactly 1.
    value: klock::CpuLockCell<Traits, i8>,

    /// The current owner.
    holder: klock::CpuLockCell<Traits, Option<TaskId>>,

    /// The task that most recently began waiting; the target of the
    /// release-time priority raise.
    requester: klock::CpuLockCell<Traits, Option<TaskId>>,
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            value: klock::CpuLockCell::new(1),
            holder: klock::CpuLockCell::new(None),
            requester: klock::CpuLockCell::new(None),
        }
    }

    /// Acquire the mutex. Fails once `timeout_ticks` have elapsed (`0` means
    /// a single poll). Yields between polls; each failed poll raises the
    /// holder's effective priority to the caller's.
    ///
    /// Only valid in task context.
    pub fn take(&self, timeout_ticks: u32) -> bool {
        let state = Traits::state();
        let deadline = state
            .tick_count
            .load(Ordering::Relaxed)
            .saturating_add(timeout_ticks);

        loop {
            {
                let mut lock = klock::lock_cpu::<Traits>().unwrap();

                let current = match state.kernel.read(&*lock).running_task {
                    Some(current) => current,
                    None => return false,
                };
                self.requester.replace(&mut *lock, Some(current));

                let acquired = {
                    let value = self.value.write(&mut *lock);
                    if *value > 0 {
                        *value -= 1;
                        true
                    } else {
                        false
                    }
                };
                if acquired {
                    self.holder.replace(&mut *lock, Some(current));
                    return true;
                }

                // Single-step inheritance: the holder must not be starved by
                // us (or our priority peers) while we busy-wait for it
                if let Some(holder) = self.holder.get(&*lock) {
                    let caller_priority = state.kernel.read(&*lock).task_priority(current);
                    if let Some(priority) = caller_priority {
                        let _ = state
                            .kernel
                            .write(&mut *lock)
                            .raise_priority(holder, priority);
                    }
                }
            }
            if state.tick_count.load(Ordering::Relaxed) >= deadline {
                return false;
            }
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
    }

    /// Release the mutex. Only the holder may release; returns `false`
    /// otherwise (or when the mutex is not held at all).
    ///
    /// Posts a priority raise at the releaser's priority to the recorded
    /// requester and yields, so a higher-priority waiter acquires the mutex
    /// immediately.
    pub fn give(&self) -> bool {
        let state = Traits::state();
        {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();

            let current = state.kernel.read(&*lock).running_task;
            if self.value.get(&*lock) == 1 || self.holder.get(&*lock) != current {
                return false;
            }

            if let Some(requester) = self.requester.get(&*lock) {
                let releaser_priority = current
                    .and_then(|current| state.kernel.read(&*lock).task_priority(current));
                if let Some(priority) = releaser_priority {
                    let _ = state
                        .kernel
                        .write(&mut *lock)
                        .raise_priority(requester, priority);
                }
            }

            self.value.replace(&mut *lock, 1);
            self.holder.replace(&mut *lock, None);
        }
        // Let the raised waiter in
        // Safety: CPU Lock released above
        unsafe { Traits::yield_cpu() };
        true
    }

    /// Release the mutex from interrupt context. Ownership is not validated.
    ///
    /// The recorded requester is raised to [`PRIORITY_MAX`], making it the
    /// immediately eligible task at the next dispatch; no yield is issued
    /// here.
    pub fn give_from_isr(&self) -> bool {
        let state = Traits::state();
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        if self.value.get(&*lock) == 1 {
            return false;
        }

        if let Some(requester) = self.requester.get(&*lock) {
            let _ = state
                .kernel
                .write(&mut *lock)
                .raise_priority(requester, PRIORITY_MAX);
        }

        self.value.replace(&mut *lock, 1);
        self.holder.replace(&mut *lock, None);
        true
    }
}
