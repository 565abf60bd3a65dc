//! The trap layer: CPU Lock, the context-switch trampolines, and exception
//! frame seeding.
use core::mem::MaybeUninit;
use memoffset::offset_of;

use crate::{PortInstance, TaskState, EXC_RETURN_THREAD_PSP, EXC_RETURN_THREAD_PSP_FPU};
use tern_kernel::{TaskCb, TimerCb};

/// Field offsets of [`TaskState`], used by the trampolines.
#[cfg_attr(not(target_arch = "arm"), allow(dead_code))]
pub(crate) const OFFSET_SP: usize = offset_of!(TaskState, sp);
#[cfg_attr(not(target_arch = "arm"), allow(dead_code))]
pub(crate) const OFFSET_EXC_RETURN: usize = offset_of!(TaskState, exc_return);

/// The hardware exception frame: r0–r3, r12, lr, pc, xPSR.
const HW_FRAME_WORDS: usize = 8;

/// The extended hardware frame additionally holds s0–s15 and FPSCR.
const HW_FRAME_WORDS_FPU: usize = 8 + 17;

/// The software-saved callee bank: r4–r11 (plus s16–s31 with FPU).
const CALLEE_WORDS: usize = 8;
const CALLEE_WORDS_FPU: usize = 8 + 16;

// CPU Lock
// ---------------------------------------------------------------------------

#[cfg(target_arch = "arm")]
pub fn try_enter_cpu_lock() -> bool {
    if cortex_m::register::primask::read().is_inactive() {
        cortex_m::interrupt::disable();
        true
    } else {
        false
    }
}

/// # Safety
///
/// A kernel-owned CPU Lock state must be active.
#[cfg(target_arch = "arm")]
pub unsafe fn leave_cpu_lock() {
    // Safety: forwarded from the caller
    unsafe { cortex_m::interrupt::enable() };
}

#[cfg(target_arch = "arm")]
pub fn is_cpu_lock_active() -> bool {
    cortex_m::register::primask::read().is_active()
}

#[cfg(target_arch = "arm")]
pub fn is_interrupt_context() -> bool {
    // `IPSR.Exception != 0`
    let ipsr: u32;
    unsafe {
        core::arch::asm!("mrs {}, ipsr", out(reg) ipsr, options(nomem, nostack, preserves_flags));
    }
    (ipsr & ((1u32 << 9) - 1)) != 0
}

// Traps
// ---------------------------------------------------------------------------

/// The yield trap, immediate `0`.
///
/// # Safety
///
/// CPU Lock inactive.
#[cfg(target_arch = "arm")]
pub unsafe fn yield_cpu() {
    unsafe { core::arch::asm!("svc 0") };
}

/// The timer-return trap, immediate `1`.
///
/// # Safety
///
/// Only to be issued by the timer trampoline.
#[cfg(target_arch = "arm")]
pub unsafe fn request_timer_return() {
    unsafe { core::arch::asm!("svc 1") };
}

/// # Safety
///
/// CPU Lock active; called exactly once, by the kernel's boot path.
#[cfg(target_arch = "arm")]
pub unsafe fn dispatch_first_task<Traits: PortInstance>() -> ! {
    // The first scheduler pass has already chosen `running_task`. Pend the
    // dispatch trap; its save phase skips the boot context (the trap origin
    // is MSP), so it simply restores the first task.
    cortex_m::peripheral::SCB::set_pendsv();
    // Safety: CPU Lock is active per this function's contract
    unsafe { leave_cpu_lock() };
    loop {
        cortex_m::asm::wfi();
    }
}

// Trampoline helpers (called from the naked handlers)
// ---------------------------------------------------------------------------

/// The outgoing context's save slot: the running task's [`TaskState`], or
/// null when there is none (e.g. right after a self-delete).
#[cfg(target_arch = "arm")]
pub(crate) unsafe extern "C" fn pendsv_save_target<Traits: PortInstance>() -> *mut TaskState {
    tern_kernel::running_task_port_state::<Traits>()
        .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
}

/// The incoming context: a pending timer's stack if the tick handler
/// requested one, else the outcome of a scheduler pass.
#[cfg(target_arch = "arm")]
pub(crate) unsafe extern "C" fn pendsv_pick_target<Traits: PortInstance>() -> *mut TaskState {
    use core::sync::atomic::Ordering;

    let pending = Traits::port_state()
        .pending_timer
        .swap(core::ptr::null_mut(), Ordering::AcqRel);
    if !pending.is_null() {
        return pending;
    }

    // Safety: PendSV runs with CPU Lock inactive
    unsafe { <Traits as tern_kernel::PortToKernel>::choose_running_task() };
    tern_kernel::running_task_port_state::<Traits>()
        .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
}

/// The timer-return path: the preempted context was saved on timer entry, so
/// this runs a pass (the callback may have woken somebody more urgent) and
/// restores whatever is `running_task` now.
#[cfg(target_arch = "arm")]
pub(crate) unsafe extern "C" fn timer_return_target<Traits: PortInstance>() -> *mut TaskState {
    // Safety: SVCall runs with CPU Lock inactive
    unsafe { <Traits as tern_kernel::PortToKernel>::choose_running_task() };
    tern_kernel::running_task_port_state::<Traits>()
        .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
}

// Naked handlers
// ---------------------------------------------------------------------------

macro_rules! define_switch_handlers {
    ($fpu_save:expr, $fpu_restore:expr) => {
        /// The PendSV handler: context save, scheduling decision (or timer
        /// entry), context restore.
        ///
        /// # Safety
        ///
        /// Must be invoked as the PendSV exception handler, configured with
        /// the lowest exception priority.
        #[cfg(target_arch = "arm")]
        #[unsafe(naked)]
        pub unsafe extern "C" fn handle_pend_sv<Traits: PortInstance>() {
            core::arch::naked_asm!(
                concat!(
                    "
                # Save the outgoing context, unless the trap arose from the
                # MSP thread context (boot) or there is no running task.
                #
                #   <r4-r11 = context, s16-s31 = context, lr = EXC_RETURN>
                tst lr, #4
                beq 1f
                push {{r4, lr}}
                bl {save_target}
                pop {{r4, lr}}
                cbz r0, 1f
                mrs r2, psp
                str lr, [r0, #{offset_exc_return}]
                ",
                    $fpu_save,
                    "
                stmdb r2!, {{r4-r11}}
                str r2, [r0, #{offset_sp}]
            1:
                # Decide what runs next and restore its context
                push {{r4, lr}}
                bl {pick_target}
                pop {{r4, lr}}
                cbz r0, 2f
                ldr lr, [r0, #{offset_exc_return}]
                ldr r2, [r0, #{offset_sp}]
                ldmia r2!, {{r4-r11}}
                ",
                    $fpu_restore,
                    "
                msr psp, r2
            2:
                bx lr
                "
                ),
                save_target = sym pendsv_save_target::<Traits>,
                pick_target = sym pendsv_pick_target::<Traits>,
                offset_sp = const OFFSET_SP,
                offset_exc_return = const OFFSET_EXC_RETURN,
            )
        }

        /// The tail half of the timer-return trap: restore-only.
        ///
        /// # Safety
        ///
        /// Reached from [`handle_svc`] with immediate `1`.
        #[cfg(target_arch = "arm")]
        #[unsafe(naked)]
        pub unsafe extern "C" fn handle_timer_return<Traits: PortInstance>() {
            core::arch::naked_asm!(
                concat!(
                    "
                # The timer's own context is discarded; its stack is re-seeded
                # on the next fire
                push {{r4, lr}}
                bl {return_target}
                pop {{r4, lr}}
                cbz r0, 2f
                ldr lr, [r0, #{offset_exc_return}]
                ldr r2, [r0, #{offset_sp}]
                ldmia r2!, {{r4-r11}}
                ",
                    $fpu_restore,
                    "
                msr psp, r2
            2:
                bx lr
                "
                ),
                return_target = sym timer_return_target::<Traits>,
                offset_sp = const OFFSET_SP,
                offset_exc_return = const OFFSET_EXC_RETURN,
            )
        }
    };
}

#[cfg(target_abi = "eabihf")]
define_switch_handlers!(
    "
                tst lr, #0x10
                it eq
                vstmdbeq r2!, {{s16-s31}}
                ",
    "
                tst lr, #0x10
                it eq
                vldmiaeq r2!, {{s16-s31}}
                "
);

#[cfg(not(target_abi = "eabihf"))]
define_switch_handlers!("", "");

/// The SVCall handler: selects the stack the trap arose from, reads the
/// immediate out of the `svc` instruction preceding the stacked return
/// address, and branches to the matching path. Callable from thread and
/// handler contexts alike.
///
/// # Safety
///
/// Must be invoked as the SVCall exception handler.
#[cfg(target_arch = "arm")]
#[unsafe(naked)]
pub unsafe extern "C" fn handle_svc<Traits: PortInstance>() {
    core::arch::naked_asm!(
        "
        tst lr, #4
        ite eq
        mrseq r0, msp
        mrsne r0, psp
        ldr r1, [r0, #24]
        ldrb.w r1, [r1, #-2]
        cmp r1, #0
        beq 2f
        cmp r1, #1
        beq 3f
        bx lr
    2:
        b {scheduler_pass}
    3:
        b {timer_return}
        ",
        scheduler_pass = sym handle_pend_sv::<Traits>,
        timer_return = sym handle_timer_return::<Traits>,
    )
}

// Frame seeding
// ---------------------------------------------------------------------------

/// Write an initial exception frame into `stack` such that an exception
/// return into it starts executing `pc(param)` in thumb state. Returns the
/// word index the saved stack pointer must point at.
fn seed_exception_frame(
    stack: &mut [MaybeUninit<u32>],
    pc: u32,
    return_address: u32,
    param: u32,
    fpu: bool,
) -> usize {
    let hw_words = if fpu { HW_FRAME_WORDS_FPU } else { HW_FRAME_WORDS };
    let frame = stack.len() - hw_words;

    // R0: the parameter to the entry point
    stack[frame] = MaybeUninit::new(param);
    // LR: entry points must not return; this catches one that does
    stack[frame + 5] = MaybeUninit::new(return_address);
    // PC: the entry point. The Thumb bit is a property of branch target
    // addresses; an exception frame holds the exact program counter, so it
    // must be cleared here.
    stack[frame + 6] = MaybeUninit::new(pc & !1);
    // xPSR: thumb state
    stack[frame + 7] = MaybeUninit::new(0x0100_0000);

    frame - if fpu { CALLEE_WORDS_FPU } else { CALLEE_WORDS }
}

/// Implements [`tern_kernel::PortThreading::initialize_task_state`].
///
/// # Safety
///
/// The task must not be reachable by the scheduler yet.
pub unsafe fn initialize_task_state<Traits: PortInstance>(task: &mut TaskCb<Traits>) {
    let entry = task.entry() as usize as u32;
    let param = task.entry_param() as u32;
    let fpu = task.floating_point();
    let exit = tern_kernel::task::task_exit_trampoline as usize as u32;

    let (sp, exc_return) = {
        let stack = task.stack_mut();
        let sp_index = seed_exception_frame(stack, entry, exit, param, fpu);
        let sp = stack.as_ptr() as usize as u32 + (sp_index as u32) * 4;
        let exc_return = if fpu {
            EXC_RETURN_THREAD_PSP_FPU
        } else {
            EXC_RETURN_THREAD_PSP
        };
        (sp, exc_return)
    };

    // Safety: the task is not running, so nobody else accesses these cells
    unsafe {
        *task.port_task_state.sp.get() = sp;
        *task.port_task_state.exc_return.get() = exc_return;
    }
}

/// Implements [`tern_kernel::PortThreading::initialize_timer_state`]: seed
/// the timer's private stack to run `entry(param)`. Timer callbacks never
/// carry an FPU context.
///
/// # Safety
///
/// No callback may be executing on this timer's stack.
pub unsafe fn initialize_timer_state<Traits: PortInstance>(
    timer: &mut TimerCb<Traits>,
    entry: unsafe extern "C" fn(usize),
    param: usize,
) {
    let pc = entry as usize as u32;
    let exit = tern_kernel::task::task_exit_trampoline as usize as u32;

    let sp = {
        let stack = timer.stack_mut();
        let sp_index = seed_exception_frame(stack, pc, exit, param as u32, false);
        stack.as_ptr() as usize as u32 + (sp_index as u32) * 4
    };

    // Safety: no callback is executing, so nobody else accesses these cells
    unsafe {
        *timer.port_timer_state.sp.get() = sp;
        *timer.port_timer_state.exc_return.get() = EXC_RETURN_THREAD_PSP;
    }
}

// Hosted stand-ins, so `cargo test --all` can build this crate. The real
// implementations require an Arm target.
// ---------------------------------------------------------------------------

#[cfg(not(target_arch = "arm"))]
mod hosted_stubs {
    use super::*;

    pub fn try_enter_cpu_lock() -> bool {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
    pub unsafe fn leave_cpu_lock() {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
    pub fn is_cpu_lock_active() -> bool {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
    pub fn is_interrupt_context() -> bool {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
    pub unsafe fn yield_cpu() {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
    pub unsafe fn request_timer_return() {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
    pub unsafe fn dispatch_first_task<Traits: PortInstance>() -> ! {
        unimplemented!("tern_port_arm_m requires an Arm target")
    }
}

#[cfg(not(target_arch = "arm"))]
pub use hosted_stubs::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_frame_places_the_architectural_registers() {
        let mut stack = vec![MaybeUninit::<u32>::new(0); 64];
        let sp_index = seed_exception_frame(&mut stack, 0x0800_1235, 0x0800_9001, 42, false);

        // 8 hardware words on top, 8 callee-saved words below them
        assert_eq!(sp_index, 64 - 16);
        let word = |i: usize| unsafe { stack[i].assume_init() };
        // R0 = param
        assert_eq!(word(64 - 8), 42);
        // LR = return trampoline
        assert_eq!(word(64 - 3), 0x0800_9001);
        // PC = entry with the thumb bit cleared
        assert_eq!(word(64 - 2), 0x0800_1234);
        // xPSR = thumb state
        assert_eq!(word(64 - 1), 0x0100_0000);
    }

    #[test]
    fn fpu_frame_reserves_the_extended_banks() {
        let mut stack = vec![MaybeUninit::<u32>::new(0); 64];
        let sp_index = seed_exception_frame(&mut stack, 0x0800_0000, 0, 0, true);

        // 25 hardware words (core + s0-s15 + FPSCR), 24 callee-saved words
        // (r4-r11 + s16-s31): together `MIN_STACK_SIZE_FPU`
        assert_eq!(sp_index, 64 - 49);
        let frame = 64 - 25;
        assert_eq!(unsafe { stack[frame + 7].assume_init() }, 0x0100_0000);
    }
}
