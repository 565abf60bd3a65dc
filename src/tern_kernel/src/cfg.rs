//! Static configuration of the kernel
//!
//! These are compile-time constants in the spirit of a C RTOS configuration
//! header. Applications that need a different tick rate or quantum edit this
//! module (or vendor the crate) — there is no runtime configuration.

/// Task priority. Higher values are more urgent.
///
/// The valid range is `PRIORITY_IDLE..=PRIORITY_MAX`, i.e. `[-16, +15]`.
pub type Priority = i8;

/// The tick frequency in Hz.
///
/// Must be one of 100, 1 000, 2 000, 4 000, or 10 000 (enforced below).
pub const SENSIBILITY: u32 = 1_000;

/// The number of ticks a task runs before being rotated with its
/// equal-priority peers.
pub const QUANTUM: u32 = 2;

/// The stack depth, in words, of every software timer's private stack
/// (excluding the context frame).
pub const TIMER_STACK_DEPTH: usize = 256;

/// The maximum number of live software timers.
pub const TIMER_LIST_LENGTH: usize = 12;

/// The number of priority levels.
pub const MAX_TASK_PRIORITY_COUNT: usize = 32;

/// The number of context words reserved on top of a task's requested stack
/// when the task does not use the FPU: the 8-word hardware exception frame
/// plus the 8-word callee-saved bank.
pub const MIN_STACK_SIZE_NO_FPU: usize = 16;

/// Same as [`MIN_STACK_SIZE_NO_FPU`], for tasks with an FPU context: the
/// extended 8+17-word hardware frame plus the 8+16-word callee-saved bank.
pub const MIN_STACK_SIZE_FPU: usize = 49;

/// The capacity of a task's debug name.
pub const MAX_TASK_NAME_LEN: usize = 12;

/// The longest expressible delay, in ticks. Deadlines are computed with
/// saturating addition, so a delay that saturates effectively never fires.
pub const MAX_DELAY: u32 = u32::MAX;

/// The requested stack depth of the idle task, in words.
pub(crate) const IDLE_TASK_STACK_WORDS: usize = 4;

pub const PRIORITY_IDLE: Priority = -16;
pub const PRIORITY_LOW: Priority = -2;
pub const PRIORITY_BELOW_NORMAL: Priority = -1;
pub const PRIORITY_NORMAL: Priority = 0;
pub const PRIORITY_ABOVE_NORMAL: Priority = 1;
pub const PRIORITY_HIGH: Priority = 2;
pub const PRIORITY_REALTIME: Priority = 15;

/// The most urgent priority. ISR-driven wakes raise the woken task to this
/// level so that it is the immediately eligible task at the next dispatch.
pub const PRIORITY_MAX: Priority = PRIORITY_REALTIME;

/// Convert milliseconds to ticks.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms.saturating_mul(SENSIBILITY / 1000)
}

/// Map a priority to its index in the ready set (0..32, ascending urgency).
#[inline]
pub(crate) const fn priority_index(priority: Priority) -> usize {
    (priority as i32 + 16) as usize
}

const _: () = assert!(
    matches!(SENSIBILITY, 100 | 1_000 | 2_000 | 4_000 | 10_000),
    "SENSIBILITY must be one of the supported tick rates"
);
const _: () = assert!(QUANTUM >= 1, "QUANTUM must be at least one tick");
const _: () = assert!(MAX_TASK_PRIORITY_COUNT == 32, "the ready set bitmap is 32 bits wide");
