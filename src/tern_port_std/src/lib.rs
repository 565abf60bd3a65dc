//! Simulation environment for running the `tern` kernel on a hosted target.
//!
//! Real ports perform context switches by swapping register banks inside the
//! yield and tick traps. A hosted process cannot do that, and does not need
//! to: every scheduling decision the kernel makes is observable through
//! [`PortToKernel::choose_running_task`] and [`TickAction`]. This port
//! therefore *simulates* the machine:
//!
//!  - The CPU Lock is an atomic flag.
//!  - The yield trap runs a scheduler pass synchronously and then invokes an
//!    optional, test-installed *yield hook*, which plays the role of "the
//!    other tasks run now" for code that blocks in a polling loop.
//!  - Tick interrupts are delivered explicitly with [`deliver_tick`], which
//!    acts on the kernel's [`TickAction`] exactly like a tick trampoline
//!    would, including running due timer callbacks.
//!
//! The test harness is the processor: it calls kernel services "as" whatever
//! task the kernel considers running, and checks the kernel's decisions
//! against the expected schedule.
use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{utils::Init, PortToKernel, TickAction};

/// Used by [`use_port!`]
#[doc(hidden)]
pub extern crate tern_kernel;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    tern_kernel::KernelTraits + tern_kernel::PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
pub struct State {
    cpu_lock: AtomicBool,

    /// The test-installed yield hook. Swapped out for the duration of an
    /// invocation so a hook that yields again doesn't recurse into itself.
    yield_hook: SpinMutex<Option<YieldHook>>,
}

type YieldHook = Box<dyn FnMut() + Send>;

impl State {
    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            yield_hook: SpinMutex::new(None),
        }
    }

    #[doc(hidden)]
    pub fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu_lock.swap(true, Ordering::Acquire)
    }

    #[doc(hidden)]
    pub fn leave_cpu_lock(&self) {
        self.cpu_lock.store(false, Ordering::Release);
    }

    #[doc(hidden)]
    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The port-private per-task (and per-timer) state.
///
/// This field is expected to be accessed with CPU Lock or not at all, so
/// `SpinMutex` is sufficient (no real mutexes are necessary). The runtime
/// performance is not a concern in `tern_port_std`.
#[derive(Debug)]
pub struct TaskState {
    tsm: SpinMutex<Tsm>,
}

#[derive(Debug)]
struct Tsm {
    /// The "saved stack pointer". Points at the top of the task's allocated
    /// stack; never moves because this port doesn't execute task code.
    sp: usize,

    /// For timers: the seeded callback entry, consumed by [`deliver_tick`]
    /// in lieu of switching to the timer's stack.
    pending_entry: Option<(unsafe extern "C" fn(usize), usize)>,
}

impl TaskState {
    const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm {
                sp: 0,
                pending_entry: None,
            }),
        }
    }
}

impl Init for TaskState {
    const INIT: Self = Self::new();
}

// Safety: the contents are guarded by the spin mutex
unsafe impl Sync for TaskState {}

/// Implements [`tern_kernel::PortThreading::yield_cpu`]: the yield trap with
/// immediate `0` — an unconditional scheduler pass — followed by the yield
/// hook.
pub fn yield_cpu<Traits: PortInstance>() {
    // Safety: the caller had CPU Lock inactive
    unsafe { Traits::choose_running_task() };
    run_yield_hook::<Traits>();
}

/// Deliver one tick interrupt and act on the kernel's decision like a tick
/// trampoline would: pend nothing, run a dispatch pass, or run a due timer's
/// callback (on this stack — the simulation has no private timer stacks).
pub fn deliver_tick<Traits: PortInstance>() {
    // Safety: tick context, CPU Lock inactive
    let action = unsafe { Traits::timer_tick() };
    log::trace!("tick -> {:?}", action);
    match action {
        TickAction::None => {}
        TickAction::Dispatch => unsafe { Traits::choose_running_task() },
        TickAction::FireTimer(timer) => {
            // Safety: `timer` was just reported due
            unsafe { tern_kernel::prepare_timer_fire::<Traits>(timer) };

            let entry = tern_kernel::timer_port_state::<Traits>(timer).and_then(|state| {
                // Safety: the pointee is alive; timers are only deleted from
                // task context, which isn't running during a tick
                unsafe { state.as_ref() }.tsm.lock().pending_entry.take()
            });
            if let Some((entry, param)) = entry {
                // Safety: this is the port's timer-fire path
                unsafe { entry(param) };
            }
        }
    }
}

/// Implements [`tern_kernel::PortThreading::request_timer_return`]: the trap
/// with immediate `1`. The "restore" half is moot here; what remains is the
/// scheduler pass that picks whatever task the callback made eligible.
pub fn timer_return<Traits: PortInstance>() {
    // Safety: the timer trampoline had CPU Lock inactive
    unsafe { Traits::choose_running_task() };
}

/// Implements [`tern_kernel::PortThreading::initialize_task_state`]: record
/// the initial "stack pointer" (the stack top; there is no frame to seed on
/// a hosted target).
pub fn initialize_task_state<Traits: PortInstance>(task: &mut tern_kernel::TaskCb<Traits>) {
    let sp = {
        let stack = task.stack_mut();
        stack.as_ptr() as usize + std::mem::size_of_val(&*stack)
    };
    task.port_task_state.tsm.lock().sp = sp;
}

/// Implements [`tern_kernel::PortThreading::initialize_timer_state`]: store
/// the callback entry for [`deliver_tick`] to invoke.
pub fn initialize_timer_state<Traits: PortInstance>(
    timer: &mut tern_kernel::TimerCb<Traits>,
    entry: unsafe extern "C" fn(usize),
    param: usize,
) {
    let sp = {
        let stack = timer.stack_mut();
        stack.as_ptr() as usize + std::mem::size_of_val(&*stack)
    };
    let mut tsm = timer.port_timer_state.tsm.lock();
    tsm.sp = sp;
    tsm.pending_entry = Some((entry, param));
}

/// Install the yield hook: a closure invoked after every yield-trap
/// scheduler pass. Blocking kernel services poll in a yield loop, so this is
/// where a test interleaves the work of other tasks (delivering ticks,
/// releasing resources as the task the kernel now considers running).
pub fn set_yield_hook<Traits: PortInstance>(hook: Box<dyn FnMut() + Send>) {
    *Traits::port_state().yield_hook.lock() = Some(hook);
}

/// Remove the yield hook.
pub fn take_yield_hook<Traits: PortInstance>() {
    *Traits::port_state().yield_hook.lock() = None;
}

fn run_yield_hook<Traits: PortInstance>() {
    // Take the hook out while it runs; a nested yield inside the hook then
    // simply skips it instead of recursing
    let hook = Traits::port_state().yield_hook.lock().take();
    if let Some(mut hook) = hook {
        hook();
        let slot = &mut *Traits::port_state().yield_hook.lock();
        if slot.is_none() {
            *slot = Some(hook);
        }
    }
}

/// Deliver `n` consecutive ticks.
pub fn deliver_ticks<Traits: PortInstance>(n: u32) {
    for _ in 0..n {
        deliver_tick::<Traits>();
    }
}

/// Run a scheduler pass directly, like the yield trap (minus the hook). Used
/// to perform the first dispatch after the tasks of a scenario are created.
pub fn dispatch<Traits: PortInstance>() {
    // Safety: CPU Lock inactive between kernel calls
    unsafe { Traits::choose_running_task() };
}

/// Instantiate the kernel static state and port bindings on a kernel trait
/// type.
///
/// ```ignore
/// tern_port_std::use_port!(struct SimKernel);
/// type System = tern_kernel::System<SimKernel>;
/// ```
#[macro_export]
macro_rules! use_port {
    ($vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        unsafe impl $crate::tern_kernel::PortThreading for $Traits {
            type PortTaskState = $crate::TaskState;

            unsafe fn try_enter_cpu_lock() -> bool {
                <$Traits as $crate::PortInstance>::port_state().try_enter_cpu_lock()
            }
            unsafe fn leave_cpu_lock() {
                <$Traits as $crate::PortInstance>::port_state().leave_cpu_lock()
            }
            fn is_cpu_lock_active() -> bool {
                <$Traits as $crate::PortInstance>::port_state().is_cpu_lock_active()
            }
            fn is_interrupt_context() -> bool {
                false
            }
            unsafe fn yield_cpu() {
                $crate::yield_cpu::<$Traits>()
            }
            unsafe fn request_timer_return() {
                $crate::timer_return::<$Traits>()
            }
            unsafe fn initialize_task_state(task: &mut $crate::tern_kernel::TaskCb<Self>) {
                $crate::initialize_task_state::<$Traits>(task)
            }
            unsafe fn initialize_timer_state(
                timer: &mut $crate::tern_kernel::TimerCb<Self>,
                entry: unsafe extern "C" fn(usize),
                param: usize,
            ) {
                $crate::initialize_timer_state::<$Traits>(timer, entry, param)
            }
            unsafe fn dispatch_first_task() -> ! {
                panic!("the hosted port simulates dispatch; drive it with deliver_tick")
            }
        }

        unsafe impl $crate::tern_kernel::KernelCfg for $Traits {
            fn state() -> &'static $crate::tern_kernel::State<Self> {
                static KERNEL_STATE: $crate::tern_kernel::State<$Traits> =
                    $crate::tern_kernel::State::INIT;
                &KERNEL_STATE
            }
        }

        unsafe impl $crate::PortInstance for $Traits {
            fn port_state() -> &'static $crate::State {
                static PORT_STATE: $crate::State = $crate::State::new();
                &PORT_STATE
            }
        }
    };
}
