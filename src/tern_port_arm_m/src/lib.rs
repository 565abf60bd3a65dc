//! Cortex-M binding for the `tern` kernel.
//!
//! # Trap assignment
//!
//! | Exception | Role |
//! |-----------|------|
//! | SysTick   | The tick: drives the time-wait list; pends PendSV for the quantum or a timer fire. |
//! | PendSV    | The context switch: saves the outgoing callee-saved bank, runs the scheduler pass (or enters a due timer's stack), restores the incoming bank. Configured with the lowest exception priority so it only runs when nothing more urgent is pending. |
//! | SVCall    | The yield trap. Immediate `0` requests a scheduler pass; immediate `1` is the timer-return path used by the timer trampoline. |
//!
//! # Saved context
//!
//! The hardware pushes the 8-word exception frame (r0–r3, r12, lr, pc, xPSR;
//! 25 words with the extended FPU frame) onto the task's stack. The PendSV
//! trampoline saves the remaining callee-saved bank — r4–r11, plus s16–s31
//! when the stacked EXC_RETURN indicates an active FPU context — below it,
//! and keeps the resulting stack pointer and the EXC_RETURN value in the
//! task's [`TaskState`]. This makes a task's context cost exactly
//! `MIN_STACK_SIZE_NO_FPU` (16) or `MIN_STACK_SIZE_FPU` (49) words of its
//! stack.
//!
//! # Usage
//!
//! ```ignore
//! tern_port_arm_m::use_port!(struct McuKernel);
//! type System = tern_kernel::System<McuKernel>;
//!
//! fn main() -> ! {
//!     tern_port_arm_m::init::<McuKernel>(SYSTEM_CORE_CLOCK).unwrap();
//!     // ... create tasks and timers ...
//!     tern_port_arm_m::start_scheduler::<McuKernel>()
//! }
//! ```
//!
//! `use_port!` exports the `SysTick`, `PendSV`, and `SVCall` handler symbols
//! (`#[no_mangle]`, one invocation per binary) that a `cortex-m-rt`-style
//! vector table picks up.
#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::AtomicPtr;

use tern_kernel::utils::Init;

/// Used by [`use_port!`]
#[doc(hidden)]
pub extern crate tern_kernel;

#[cfg(target_arch = "arm")]
#[doc(hidden)]
pub extern crate cortex_m;

pub mod systick;
pub mod threading;

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

/// The port-private per-task (and per-timer) state: the saved stack pointer
/// and the EXC_RETURN value describing the saved frame's flavour.
///
/// `repr(C)` with `sp` first: the trampolines address the fields by constant
/// offsets.
#[repr(C)]
pub struct TaskState {
    pub(crate) sp: UnsafeCell<u32>,
    pub(crate) exc_return: UnsafeCell<u32>,
}

// Safety: accessed only by the trampolines, one context switch at a time
unsafe impl Sync for TaskState {}
unsafe impl Send for TaskState {}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
        exc_return: UnsafeCell::new(0),
    };
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskState").finish_non_exhaustive()
    }
}

/// The internal state of the port.
pub struct State {
    /// Hand-off from the SysTick handler to PendSV: the [`TaskState`] of a
    /// timer whose stack should be entered instead of running a scheduler
    /// pass. Null when no timer fire is pending.
    #[cfg_attr(not(target_arch = "arm"), allow(dead_code))]
    pub(crate) pending_timer: AtomicPtr<TaskState>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            pending_timer: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// "Return to Thread mode, no FPU state, use PSP": the EXC_RETURN seeded
/// into fresh task and timer frames.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xffff_fffd;

/// Same, with an active FPU context (the hardware stacks and pops the
/// extended frame).
pub const EXC_RETURN_THREAD_PSP_FPU: u32 = 0xffff_ffed;

/// Initialize the port and the kernel: program SysTick from the bus
/// frequency, assign the trap priorities, and create the idle task. Call
/// once, before [`start_scheduler`].
pub fn init<Traits: PortInstance>(bus_freq_hz: u32) -> Result<(), tern_kernel::InitError> {
    systick::configure::<Traits>(bus_freq_hz);
    tern_kernel::init_kernel::<Traits>()
}

/// Hand the processor to the scheduler. Never returns.
pub fn start_scheduler<Traits: PortInstance>() -> ! {
    // Safety: `init` left CPU Lock inactive; this is the one boot call
    unsafe { <Traits as tern_kernel::PortToKernel>::boot() }
}

/// Instantiate the kernel static state and the Cortex-M port bindings on a
/// kernel trait type, and export the exception handlers.
#[macro_export]
macro_rules! use_port {
    ($vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        unsafe impl $crate::tern_kernel::PortThreading for $Traits {
            type PortTaskState = $crate::TaskState;

            unsafe fn try_enter_cpu_lock() -> bool {
                $crate::threading::try_enter_cpu_lock()
            }
            unsafe fn leave_cpu_lock() {
                unsafe { $crate::threading::leave_cpu_lock() }
            }
            fn is_cpu_lock_active() -> bool {
                $crate::threading::is_cpu_lock_active()
            }
            fn is_interrupt_context() -> bool {
                $crate::threading::is_interrupt_context()
            }
            unsafe fn yield_cpu() {
                unsafe { $crate::threading::yield_cpu() }
            }
            unsafe fn request_timer_return() {
                unsafe { $crate::threading::request_timer_return() }
            }
            unsafe fn initialize_task_state(task: &mut $crate::tern_kernel::TaskCb<Self>) {
                unsafe { $crate::threading::initialize_task_state::<$Traits>(task) }
            }
            unsafe fn initialize_timer_state(
                timer: &mut $crate::tern_kernel::TimerCb<Self>,
                entry: unsafe extern "C" fn(usize),
                param: usize,
            ) {
                unsafe {
                    $crate::threading::initialize_timer_state::<$Traits>(timer, entry, param)
                }
            }
            unsafe fn dispatch_first_task() -> ! {
                unsafe { $crate::threading::dispatch_first_task::<$Traits>() }
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

        #[cfg(target_arch = "arm")]
        #[unsafe(naked)]
        #[no_mangle]
        pub unsafe extern "C" fn PendSV() {
            core::arch::naked_asm!(
                "b {handler}",
                handler = sym $crate::threading::handle_pend_sv::<$Traits>,
            )
        }

        #[cfg(target_arch = "arm")]
        #[unsafe(naked)]
        #[no_mangle]
        pub unsafe extern "C" fn SVCall() {
            core::arch::naked_asm!(
                "b {handler}",
                handler = sym $crate::threading::handle_svc::<$Traits>,
            )
        }

        #[cfg(target_arch = "arm")]
        #[no_mangle]
        pub unsafe extern "C" fn SysTick() {
            unsafe { $crate::systick::handle_sys_tick::<$Traits>() }
        }
    };
}
