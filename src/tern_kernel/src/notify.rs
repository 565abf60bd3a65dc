//! Task notifications
//!
//! Every task owns a one-slot mailbox carrying a 32-bit message. Posting a
//! notification also applies a *priority raise* to the receiver — the shared
//! mechanism behind the mutex module's inheritance protocol — so a waiter
//! can be made the most eligible task at the next dispatch.
use core::sync::atomic::Ordering;

use crate::{
    cfg::{Priority, PRIORITY_MAX},
    error::BadIdError,
    klock,
    task::TaskFlags,
    KernelState, KernelTraits, PortThreading, System, TaskId,
};

impl<Traits: PortThreading> KernelState<Traits> {
    /// Store a message in `task`'s mailbox and, if `raise_to` is given,
    /// lift the task's effective priority (consumed at its next dispatch).
    pub(crate) fn notify_task(
        &mut self,
        task: TaskId,
        message: u32,
        raise_to: Option<Priority>,
    ) -> Result<(), BadIdError> {
        let cb = self.tasks.get_mut(task).ok_or(BadIdError::BadId)?;
        cb.notification_message = message;
        cb.flags.insert(TaskFlags::HAS_NOTIFICATION);

        if let Some(priority) = raise_to {
            self.raise_priority(task, priority)?;
        }
        Ok(())
    }

    /// Take the current task's pending notification, if any.
    pub(crate) fn take_notification(&mut self) -> Option<u32> {
        let cur = self.running_task?;
        let cb = self.tasks.cb_mut(cur);
        if cb.flags.contains(TaskFlags::HAS_NOTIFICATION) {
            cb.flags.remove(TaskFlags::HAS_NOTIFICATION);
            Some(cb.notification_message)
        } else {
            None
        }
    }
}

/// These associated functions implement the notification portion of the
/// public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Post a notification to `task`, waking it at the caller's priority: the
    /// receiver's effective priority is raised to the caller's, so an
    /// equal-or-lower-priority receiver is dispatched no later than the next
    /// scheduler pass.
    pub fn notify(task: TaskId, message: u32) -> Result<(), BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let kernel = Traits::state().kernel.write(&mut *lock);
        let raise_to = kernel.running_task.and_then(|cur| kernel.task_priority(cur));
        kernel.notify_task(task, message, raise_to)
    }

    /// Post a notification from interrupt context. The receiver is raised to
    /// [`PRIORITY_MAX`] so it becomes the immediately eligible task at the
    /// next dispatch.
    pub fn notify_from_isr(task: TaskId, message: u32) -> Result<(), BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .write(&mut *lock)
            .notify_task(task, message, Some(PRIORITY_MAX))
    }

    /// Wait for a notification, cooperatively yielding between polls.
    ///
    /// Returns the stored message and clears the mailbox. A timeout returns
    /// `0` — indistinguishable from a legitimate zero message, which callers
    /// must account for in their protocol.
    pub fn notify_take(timeout_ticks: u32) -> u32 {
        let state = Traits::state();
        let deadline = state
            .tick_count
            .load(Ordering::Relaxed)
            .saturating_add(timeout_ticks);

        loop {
            {
                let mut lock = klock::lock_cpu::<Traits>().unwrap();
                if let Some(message) =
                    state.kernel.write(&mut *lock).take_notification()
                {
                    return message;
                }
            }
            if state.tick_count.load(Ordering::Relaxed) >= deadline {
                return 0;
            }
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
    }
}
