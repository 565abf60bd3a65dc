//! The SysTick-driven tick source.
#[cfg(target_arch = "arm")]
use tern_kernel::{cfg::SENSIBILITY, TickAction};

use crate::PortInstance;

/// Program SysTick to interrupt at [`SENSIBILITY`] Hz and assign the trap
/// priorities: PendSV gets the lowest priority so a context switch never
/// delays anything more urgent, and SysTick sits just above it.
#[cfg(target_arch = "arm")]
pub fn configure<Traits: PortInstance>(bus_freq_hz: u32) {
    // Safety: the port claims the ownership of these peripherals
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: we don't make priority-based critical sections
    unsafe {
        use cortex_m::peripheral::scb::SystemHandler;
        peripherals.SCB.set_priority(SystemHandler::SVCall, 0xff);
        peripherals.SCB.set_priority(SystemHandler::PendSV, 0xff);
        peripherals.SCB.set_priority(SystemHandler::SysTick, 0xfe);
    }

    let reload = bus_freq_hz / SENSIBILITY;
    peripherals
        .SYST
        .set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
    // The counter runs from the reload value down to zero
    peripherals.SYST.set_reload(reload - 1);
    peripherals.SYST.clear_current();
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();
}

#[cfg(not(target_arch = "arm"))]
pub fn configure<Traits: PortInstance>(_bus_freq_hz: u32) {
    unimplemented!("tern_port_arm_m requires an Arm target")
}

/// The SysTick handler body: run the kernel's tick handler and realize the
/// action it requests. A quantum expiry pends the dispatch trap (taken as
/// soon as nothing more urgent runs); a due timer additionally hands the
/// timer's seeded stack to the dispatch trap through
/// [`State::pending_timer`](crate::State).
///
/// # Safety
///
/// Must be called from the SysTick exception handler.
#[cfg(target_arch = "arm")]
pub unsafe fn handle_sys_tick<Traits: PortInstance>() {
    // Safety: tick interrupt context, CPU Lock inactive
    match unsafe { <Traits as tern_kernel::PortToKernel>::timer_tick() } {
        TickAction::None => {}
        TickAction::Dispatch => {
            cortex_m::peripheral::SCB::set_pendsv();
        }
        TickAction::FireTimer(timer) => {
            // Safety: `timer` was just reported due
            unsafe { tern_kernel::prepare_timer_fire::<Traits>(timer) };
            if let Some(state) = tern_kernel::timer_port_state::<Traits>(timer) {
                Traits::port_state()
                    .pending_timer
                    .store(state.as_ptr(), core::sync::atomic::Ordering::Release);
                cortex_m::peripheral::SCB::set_pendsv();
            }
        }
    }
}

#[cfg(not(target_arch = "arm"))]
pub unsafe fn handle_sys_tick<Traits: PortInstance>() {
    unimplemented!("tern_port_arm_m requires an Arm target")
}
