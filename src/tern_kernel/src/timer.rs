//! Software timers
//!
//! Timers share the time-wait list with task delays. A due timer's callback
//! runs on the timer's own private stack, entered through the tick trampoline
//! and left through the timer-return trap; callbacks never nest.
use alloc::{boxed::Box, vec::Vec};
use arrayvec::ArrayVec;
use core::{fmt, mem::MaybeUninit, sync::atomic::Ordering};

use crate::{
    cfg::{MIN_STACK_SIZE_NO_FPU, TIMER_LIST_LENGTH, TIMER_STACK_DEPTH},
    error::{BadIdError, CreateTimerError, UpdateTimerError},
    klock,
    utils::Init,
    KernelState, KernelTraits, PortThreading, System, TimerId, UTicks,
};

/// The type of a timer callback. Receives the fired timer's ID, through
/// which the user cookie is available ([`System::timer_user_id`]).
pub type TimerFn = fn(TimerId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerSt {
    /// The timer is armed: it owns a node on the time-wait list.
    Ready,
    /// The timer is stopped (or a retired one-shot).
    Blocked,
}

/// *Timer control block* — the state data of a software timer.
pub struct TimerCb<Traits: PortThreading> {
    /// Port-private state, notably the saved stack pointer. First field, as
    /// in [`TaskCb`](crate::TaskCb).
    pub port_timer_state: Traits::PortTaskState,

    /// The timer's private stack: `TIMER_STACK_DEPTH` words plus the context
    /// frame for the callback entry.
    pub(crate) stack: Box<[MaybeUninit<u32>]>,

    pub(crate) callback: TimerFn,

    /// User-defined identifier, passed through for the callback's benefit.
    pub(crate) user_id: u32,

    /// The period in ticks. For a one-shot timer this is the delay until the
    /// single expiry.
    pub(crate) period: UTicks,

    pub(crate) auto_reload: bool,

    pub(crate) st: TimerSt,
}

impl<Traits: PortThreading> TimerCb<Traits> {
    /// The whole private stack region (for the port's frame seeding).
    #[inline]
    pub fn stack_mut(&mut self) -> &mut [MaybeUninit<u32>] {
        &mut self.stack
    }
}

impl<Traits: PortThreading> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("user_id", &self.user_id)
            .field("period", &self.period)
            .field("auto_reload", &self.auto_reload)
            .field("st", &self.st)
            .finish()
    }
}

/// The timer table: at most [`TIMER_LIST_LENGTH`] live timers, with stable
/// slot indices ([`TimerId`]) and stable control block addresses.
pub(crate) struct TimerTable<Traits: PortThreading> {
    slots: ArrayVec<Option<Box<TimerCb<Traits>>>, TIMER_LIST_LENGTH>,
}

impl<Traits: PortThreading> Init for TimerTable<Traits> {
    const INIT: Self = Self {
        slots: ArrayVec::new_const(),
    };
}

impl<Traits: PortThreading> TimerTable<Traits> {
    pub(crate) fn get(&self, id: TimerId) -> Option<&TimerCb<Traits>> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_deref())
    }

    pub(crate) fn get_mut(&mut self, id: TimerId) -> Option<&mut TimerCb<Traits>> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_deref_mut())
    }

    fn alloc(&mut self, cb: Box<TimerCb<Traits>>) -> Result<TimerId, CreateTimerError> {
        if let Some(i) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[i] = Some(cb);
            return Ok(TimerId(i as u8));
        }
        if self.slots.is_full() {
            return Err(CreateTimerError::TimerListFull);
        }
        self.slots.push(Some(cb));
        Ok(TimerId((self.slots.len() - 1) as u8))
    }

    fn free(&mut self, id: TimerId) -> Option<Box<TimerCb<Traits>>> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.take())
    }
}

impl<Traits: PortThreading> KernelState<Traits> {
    /// The core of `timer_create`: allocate the private stack and control
    /// block and arm the timer at `now + period`.
    pub(crate) fn create_timer(
        &mut self,
        callback: TimerFn,
        user_id: u32,
        period: UTicks,
        auto_reload: bool,
        now: UTicks,
    ) -> Result<TimerId, CreateTimerError> {
        if period == 0 {
            return Err(CreateTimerError::InvalidPeriod);
        }

        let total = TIMER_STACK_DEPTH + MIN_STACK_SIZE_NO_FPU;
        let mut stack = Vec::new();
        if stack.try_reserve_exact(total).is_err() {
            return Err(CreateTimerError::AllocationFailed);
        }
        stack.resize(total, MaybeUninit::uninit());

        let id = self.timers.alloc(Box::new(TimerCb {
            port_timer_state: Init::INIT,
            stack: stack.into_boxed_slice(),
            callback,
            user_id,
            period,
            auto_reload,
            st: TimerSt::Ready,
        }))?;

        self.timeouts.insert_timer(id, now.saturating_add(period));
        Ok(id)
    }

    /// The core of `timer_stop`: disarm without freeing. A callback already
    /// entered keeps running until it returns.
    pub(crate) fn stop_timer(&mut self, timer: TimerId) -> Result<(), BadIdError> {
        let cb = self.timers.get_mut(timer).ok_or(BadIdError::BadId)?;
        cb.st = TimerSt::Blocked;
        self.timeouts.remove_timer(timer);
        Ok(())
    }

    /// The core of `timer_resume`: re-arm with a fresh deadline relative to
    /// `now`. No-op on an armed timer.
    pub(crate) fn resume_timer(&mut self, timer: TimerId, now: UTicks) -> Result<(), BadIdError> {
        let cb = self.timers.get_mut(timer).ok_or(BadIdError::BadId)?;
        if cb.st == TimerSt::Ready {
            return Ok(());
        }
        cb.st = TimerSt::Ready;
        let deadline = now.saturating_add(cb.period);
        self.timeouts.insert_timer(timer, deadline);
        Ok(())
    }

    /// The core of `timer_update_period`: takes effect from the next expiry.
    pub(crate) fn update_timer_period(
        &mut self,
        timer: TimerId,
        period: UTicks,
        now: UTicks,
    ) -> Result<(), UpdateTimerError> {
        if period == 0 {
            return Err(UpdateTimerError::InvalidPeriod);
        }
        let cb = self.timers.get_mut(timer).ok_or(UpdateTimerError::BadId)?;
        cb.period = period;
        if cb.st == TimerSt::Ready {
            self.timeouts.remove_timer(timer);
            self.timeouts.insert_timer(timer, now.saturating_add(period));
        }
        Ok(())
    }

    /// The core of `timer_delete`: disarm and vacate the slot, freeing the
    /// private stack.
    pub(crate) fn delete_timer(&mut self, timer: TimerId) -> Result<(), BadIdError> {
        if self.timers.get(timer).is_none() {
            return Err(BadIdError::BadId);
        }
        self.timeouts.remove_timer(timer);
        self.timers.free(timer);
        Ok(())
    }
}

/// The entry point executed on a timer's private stack when it fires: runs
/// the callback, clears the timer-running flag, and requests the
/// timer-return trap, which dispatches whatever task is then the most
/// eligible (possibly one the callback just woke).
///
/// # Safety
///
/// Only meant to be entered through the port's timer-fire path (or called
/// directly by a hosted port), with `timer_running` set.
pub unsafe extern "C" fn timer_entry_trampoline<Traits: KernelTraits>(timer: usize) {
    let timer = TimerId(timer as u8);

    let callback = {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .read(&*lock)
            .timers
            .get(timer)
            .map(|cb| cb.callback)
    };

    if let Some(callback) = callback {
        callback(timer);
    }

    Traits::state().timer_running.store(false, Ordering::Relaxed);

    // Safety: we are at the end of a timer callback; that is this trap's one
    // legitimate call site
    unsafe { Traits::request_timer_return() };
}

/// These associated functions implement the timer-related portion of the
/// public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a software timer. The first expiry is `period_ticks` from now;
    /// an auto-reload timer then fires every `period_ticks`.
    pub fn timer_create(
        callback: TimerFn,
        user_id: u32,
        period_ticks: UTicks,
        auto_reload: bool,
    ) -> Result<TimerId, CreateTimerError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let now = Traits::state().tick_count.load(Ordering::Relaxed);
        Traits::state().kernel.write(&mut *lock).create_timer(
            callback,
            user_id,
            period_ticks,
            auto_reload,
            now,
        )
    }

    /// Stop a timer. Takes effect for subsequent cycles; an executing
    /// callback finishes normally.
    pub fn timer_stop(timer: TimerId) -> Result<(), BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state().kernel.write(&mut *lock).stop_timer(timer)
    }

    /// Start or restart a timer; the next expiry is one period from now.
    pub fn timer_resume(timer: TimerId) -> Result<(), BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let now = Traits::state().tick_count.load(Ordering::Relaxed);
        Traits::state()
            .kernel
            .write(&mut *lock)
            .resume_timer(timer, now)
    }

    /// Change a timer's period, rescheduling a pending expiry.
    pub fn timer_update_period(timer: TimerId, period_ticks: UTicks) -> Result<(), UpdateTimerError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let now = Traits::state().tick_count.load(Ordering::Relaxed);
        Traits::state()
            .kernel
            .write(&mut *lock)
            .update_timer_period(timer, period_ticks, now)
    }

    /// Delete a timer and free its stack. Must not be called while the
    /// timer's callback is executing — the kernel does not validate this,
    /// and the callback's stack would be freed under it.
    pub fn timer_delete(timer: TimerId) -> Result<(), BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state().kernel.write(&mut *lock).delete_timer(timer)
    }

    /// The user cookie a timer was created with.
    pub fn timer_user_id(timer: TimerId) -> Result<u32, BadIdError> {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .read(&*lock)
            .timers
            .get(timer)
            .map(|cb| cb.user_id)
            .ok_or(BadIdError::BadId)
    }
}
