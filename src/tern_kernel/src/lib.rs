//! The `tern` kernel: fixed-priority preemptive multitasking with round-robin
//! among equal priorities, software timers, task delays, task notifications,
//! counting semaphores, priority-inheriting mutexes, and bounded message
//! queues, for single-core 32-bit microcontrollers.
//!
//! # Kernel trait types
//!
//! The kernel is not a runnable artifact by itself. An application chooses a
//! port crate and lets its binding macro define a *kernel trait type* — a unit
//! struct implementing [`PortThreading`] (the hardware contract) and
//! [`KernelCfg`] (the static kernel state). All kernel objects and API entry
//! points are parameterized by that type, so multiple independent kernel
//! instances can coexist in one test binary.
//!
//! # Contexts
//!
//! *Task context* is code running on a task's private stack. *Interrupt
//! context* covers the tick and trap handlers as well as application ISRs.
//! Blocking operations (anything taking a `timeout_ticks` parameter and the
//! delay/yield family) are only valid in task context; the `*_from_isr`
//! variants and [`Semaphore::give`] are interrupt-safe.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::{fmt, marker::PhantomData, ptr::NonNull, sync::atomic::Ordering};

pub mod cfg;
mod error;
mod klock;
mod mutex;
mod notify;
mod queue;
mod semaphore;
pub mod task;
mod timeout;
pub mod timer;
pub mod utils;

pub use self::{
    cfg::Priority,
    error::{
        BadIdError, CreateTaskError, CreateTimerError, InitError, ResultCode, UpdatePriorityError,
        UpdateTimerError,
    },
    mutex::Mutex,
    queue::Queue,
    semaphore::Semaphore,
    task::{TaskCb, TaskFn},
    timer::{timer_entry_trampoline, TimerCb, TimerFn},
};

use self::{klock::CpuLockCell, utils::Init};

/// Unsigned tick count. Wraps at 2³²; deadlines are formed with saturating
/// addition so a saturated deadline never fires.
pub type UTicks = u32;

/// Identifies a task. Stale IDs (referring to a deleted task) are rejected
/// with [`BadIdError`]; reusing an ID after its slot has been recycled by a
/// later `task_create` is a user-contract violation the kernel cannot detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u16);

/// Identifies a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) u8);

/// What the port's tick trampoline should do after [`PortToKernel::timer_tick`]
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Return from the tick interrupt.
    None,
    /// The quantum elapsed; pend the dispatch trap.
    Dispatch,
    /// A software timer is due; run its callback on the timer's own stack
    /// (see [`prepare_timer_fire`]).
    FireTimer(TimerId),
}

/// The hardware interface the kernel requires from a port.
///
/// # Safety
///
/// Implementing this trait is a promise that the methods uphold their
/// individual contracts; the kernel's memory safety depends on them.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-private per-task data, notably the saved stack pointer. This is
    /// the first field of [`TaskCb`] and [`TimerCb`] so that trampoline code
    /// can reach it without offset arithmetic.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// Enter a CPU Lock state (disable maskable interrupts), unless it is
    /// already active. Returns `false` in the latter case.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state (re-enable maskable interrupts).
    ///
    /// # Safety
    ///
    /// A CPU Lock state must be active, owned by the kernel.
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// (handler) context.
    fn is_interrupt_context() -> bool;

    /// Request a scheduler pass (the yield trap, immediate `0`).
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn yield_cpu();

    /// Request the timer-return trap (immediate `1`), which runs a scheduler
    /// pass and resumes the task that is `running_task` afterwards.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`timer_entry_trampoline`] at the end of a
    /// timer callback.
    unsafe fn request_timer_return();

    /// Seed the initial exception frame on a newly created task's stack such
    /// that the first dispatch starts executing `task.entry()(task.entry_param())`
    /// in thumb state, with the return address pointing at
    /// [`task::task_exit_trampoline`], and store the resulting stack pointer
    /// in `task.port_task_state`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, before the task becomes
    /// reachable by the scheduler.
    unsafe fn initialize_task_state(task: &mut TaskCb<Self>);

    /// Seed a timer's private stack so that execution begins at
    /// `entry(param)`, and store the resulting stack pointer in
    /// `timer.port_timer_state`.
    ///
    /// # Safety
    ///
    /// Only meant to be called through [`prepare_timer_fire`], while no timer
    /// callback is executing.
    unsafe fn initialize_timer_state(
        timer: &mut TimerCb<Self>,
        entry: unsafe extern "C" fn(usize),
        param: usize,
    );

    /// Hand the processor to the task chosen by the first scheduler pass and
    /// never return.
    ///
    /// # Safety
    ///
    /// CPU Lock active; called exactly once, by [`PortToKernel::boot`].
    unsafe fn dispatch_first_task() -> !;
}

/// Associates the static kernel state with a kernel trait type.
///
/// # Safety
///
/// `state` must return the same instance every time, and that instance must
/// not be shared with another kernel trait type.
pub unsafe trait KernelCfg: PortThreading {
    fn state() -> &'static State<Self>;
}

/// The combined requirements of a kernel trait type. Blanket-implemented.
pub trait KernelTraits: PortThreading + KernelCfg {}
impl<T: PortThreading + KernelCfg> KernelTraits for T {}

/// The entry points a port's trampolines call into the kernel.
/// Blanket-implemented on every kernel trait type.
pub trait PortToKernel {
    /// Finish the boot phase: run the first scheduler pass and dispatch.
    ///
    /// # Safety
    ///
    /// [`init_kernel`] must have succeeded; CPU Lock inactive.
    unsafe fn boot() -> !;

    /// The tick handler. Advances time-waits and reports what the trampoline
    /// should do next.
    ///
    /// # Safety
    ///
    /// Must be called from the tick interrupt, CPU Lock inactive.
    unsafe fn timer_tick() -> TickAction;

    /// Run a scheduler pass: select the next task, enforce the quantum, and
    /// update `running_task`. The register swap itself is the trampoline's
    /// job (save into the outgoing task's port state before calling this,
    /// restore from the incoming task's afterwards).
    ///
    /// # Safety
    ///
    /// CPU Lock inactive.
    unsafe fn choose_running_task();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // The boot context owns the CPU, so this can't fail
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .write(&mut *lock)
            .choose_running_task();

        // Keep CPU Lock active across the hand-off; the port releases it once
        // the first task context is in place
        core::mem::forget(lock);

        // Safety: CPU Lock active, first pass done
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn timer_tick() -> TickAction {
        timeout::handle_tick::<Traits>()
    }

    unsafe fn choose_running_task() {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .write(&mut *lock)
            .choose_running_task();
    }
}

/// The static kernel state bound to one kernel trait type.
pub struct State<Traits: PortThreading> {
    /// Everything the scheduler pass touches, behind one CPU Lock cell: the
    /// task arena, the ready set, the time-wait list, the timer table, the
    /// running task, and the quantum counter.
    pub(crate) kernel: CpuLockCell<Traits, KernelState<Traits>>,

    /// The monotonic tick counter. The only kernel datum read outside the
    /// critical region (wait loops poll it with a relaxed load); written by
    /// the tick handler under CPU Lock.
    pub(crate) tick_count: core::sync::atomic::AtomicU32,

    /// True while a timer callback is executing on its own stack.
    pub(crate) timer_running: core::sync::atomic::AtomicBool,
}

impl<Traits: PortThreading> State<Traits> {
    pub const INIT: Self = Self {
        kernel: Init::INIT,
        tick_count: Init::INIT,
        timer_running: Init::INIT,
    };
}

impl<Traits: PortThreading> Init for State<Traits> {
    const INIT: Self = Self::INIT;
}

pub(crate) struct KernelState<Traits: PortThreading> {
    pub(crate) tasks: task::TaskArena<Traits>,
    pub(crate) ready: task::readyqueue::ReadyQueue,
    pub(crate) timeouts: timeout::TimeoutList,
    pub(crate) timers: timer::TimerTable<Traits>,

    /// The Running task. Never `None` after `init_kernel` except transiently
    /// while the running task deletes itself.
    pub(crate) running_task: Option<TaskId>,

    /// Ticks consumed from the current round-robin slice. Starts saturated so
    /// that the first tick after boot triggers a scheduler pass.
    pub(crate) quantum_ticks: u32,
}

impl<Traits: PortThreading> Init for KernelState<Traits> {
    const INIT: Self = Self {
        tasks: Init::INIT,
        ready: Init::INIT,
        timeouts: Init::INIT,
        timers: Init::INIT,
        running_task: None,
        quantum_ticks: cfg::QUANTUM,
    };
}

/// The facade through which all task, timer, and notification services are
/// reached: `System::<Traits>::task_create(..)` etc. The inherent methods are
/// defined in the respective modules.
pub struct System<Traits>(PhantomData<Traits>);

/// Create the idle task. Must be called once, before [`PortToKernel::boot`]
/// and before any other kernel service.
pub fn init_kernel<Traits: KernelTraits>() -> Result<(), InitError> {
    System::<Traits>::task_create(
        task::idle_task_body::<Traits>,
        "idle task",
        0,
        cfg::IDLE_TASK_STACK_WORDS,
        cfg::PRIORITY_IDLE,
        false,
    )?;
    Ok(())
}

/// Get a pointer to the running task's [`PortThreading::PortTaskState`].
///
/// This is how a context-switch trampoline locates the cell to save the
/// outgoing stack pointer into (called before
/// [`PortToKernel::choose_running_task`]) and to restore the incoming one
/// from (called after). Returns `None` when there is no running task — the
/// trampoline must then skip the save/restore (e.g. right after the running
/// task deleted itself, when its stack no longer exists).
///
/// The pointee stays valid after CPU Lock is released: control blocks have
/// stable addresses and are only freed from task context.
pub fn running_task_port_state<Traits: KernelTraits>() -> Option<NonNull<Traits::PortTaskState>> {
    let lock = klock::lock_cpu::<Traits>()?;
    let kernel = Traits::state().kernel.read(&*lock);
    let id = kernel.running_task?;
    kernel.tasks.get(id).map(|cb| NonNull::from(&cb.port_task_state))
}

/// Get a pointer to a timer's [`PortThreading::PortTaskState`] so the tick
/// trampoline can switch to the timer's private stack.
pub fn timer_port_state<Traits: KernelTraits>(
    timer: TimerId,
) -> Option<NonNull<Traits::PortTaskState>> {
    let lock = klock::lock_cpu::<Traits>()?;
    Traits::state()
        .kernel
        .read(&*lock)
        .timers
        .get(timer)
        .map(|cb| NonNull::from(&cb.port_timer_state))
}

/// Seed `timer`'s private stack for one callback run (the callback entry is
/// [`timer_entry_trampoline`]). Called by the port's tick trampoline after
/// [`PortToKernel::timer_tick`] returned [`TickAction::FireTimer`] and before
/// it switches to the timer stack.
///
/// # Safety
///
/// CPU Lock inactive; `timer` was just reported by `timer_tick`.
pub unsafe fn prepare_timer_fire<Traits: KernelTraits>(timer: TimerId) {
    let mut lock = match klock::lock_cpu::<Traits>() {
        Some(lock) => lock,
        None => return,
    };
    let kernel = Traits::state().kernel.write(&mut *lock);
    if let Some(cb) = kernel.timers.get_mut(timer) {
        // Safety: forwarding our own contract
        unsafe {
            Traits::initialize_timer_state(cb, timer_entry_trampoline::<Traits>, timer.0 as usize)
        };
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// The current value of the tick counter.
    #[inline]
    pub fn tick_count() -> UTicks {
        Traits::state().tick_count.load(Ordering::Relaxed)
    }
}
