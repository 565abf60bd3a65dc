//! Tasks
use alloc::{boxed::Box, vec::Vec};
use arrayvec::ArrayString;
use core::{fmt, mem::MaybeUninit, sync::atomic::Ordering};

use crate::{
    cfg::{
        ms_to_ticks, priority_index, Priority, MAX_TASK_NAME_LEN, MIN_STACK_SIZE_FPU,
        MIN_STACK_SIZE_NO_FPU, PRIORITY_IDLE, PRIORITY_MAX, QUANTUM,
    },
    error::{BadIdError, CreateTaskError, UpdatePriorityError},
    klock,
    utils::Init,
    KernelState, KernelTraits, PortThreading, System, TaskId,
};

pub mod readyqueue;
use self::readyqueue::Link;

/// The type of a task entry point. The argument is the `param` value passed
/// to [`System::task_create`].
pub type TaskFn = fn(usize);

bitflags::bitflags! {
    pub(crate) struct TaskFlags: u8 {
        /// The task's saved context includes the extended FPU register bank.
        const FLOATING_POINT = 1 << 0;
        /// The saved context on the task's stack is valid and must be
        /// restored on the next dispatch. Set at creation — the seeded
        /// initial frame is itself a restorable context.
        const REGISTERS_SAVED = 1 << 1;
        /// The one-slot notification mailbox is occupied.
        const HAS_NOTIFICATION = 1 << 2;
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The task is in a ready bucket, eligible for dispatch.
    Ready,
    /// The task owns the processor. At most one task is Running at any time.
    Running,
    /// The task is on the time-wait list (delay).
    Waiting,
    /// The task is stopped; it holds no list membership.
    Blocked,
}

/// *Task control block* — the state data of a task.
///
/// Owned by the kernel's task arena; user code refers to it through
/// [`TaskId`]. The stack region is exclusively owned by the TCB and is freed
/// together with it.
pub struct TaskCb<Traits: PortThreading> {
    /// Port-private state, notably the saved stack pointer.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// trampoline code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    /// The owning pointer to the allocated stack region
    /// (`stack_words` + context words, in 32-bit words).
    pub(crate) stack: Box<[MaybeUninit<u32>]>,

    /// The stack depth requested at creation, excluding the context words.
    pub(crate) stack_words: usize,

    /// The entry point of the task.
    pub(crate) entry: TaskFn,

    /// The parameter supplied for `entry`.
    pub(crate) entry_param: usize,

    pub(crate) st: TaskSt,

    /// The task's effective priority. May be temporarily elevated above
    /// `original_priority` by a priority-raise (mutex release, notification);
    /// the scheduler consumes such a boost when it dispatches the task.
    pub(crate) priority: Priority,

    /// The priority before any inheritance boost.
    pub(crate) original_priority: Priority,

    pub(crate) flags: TaskFlags,

    /// The one-slot notification mailbox. Valid while
    /// [`TaskFlags::HAS_NOTIFICATION`] is set.
    pub(crate) notification_message: u32,

    /// Membership in the task's priority bucket. `Some` iff the task is
    /// Ready or Running.
    pub(crate) link: Option<Link>,

    /// Fixed-length debug label.
    pub(crate) name: ArrayString<MAX_TASK_NAME_LEN>,
}

impl<Traits: PortThreading> TaskCb<Traits> {
    /// The task's entry point (for the port's frame seeding).
    #[inline]
    pub fn entry(&self) -> TaskFn {
        self.entry
    }

    /// The parameter passed to the entry point.
    #[inline]
    pub fn entry_param(&self) -> usize {
        self.entry_param
    }

    /// Whether the task carries the extended FPU context.
    #[inline]
    pub fn floating_point(&self) -> bool {
        self.flags.contains(TaskFlags::FLOATING_POINT)
    }

    /// The whole stack region (context words included).
    #[inline]
    pub fn stack_mut(&mut self) -> &mut [MaybeUninit<u32>] {
        &mut self.stack
    }

    /// The task's debug label.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Traits: PortThreading> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &&*self.name)
            .field("port_task_state", &self.port_task_state)
            .field("st", &self.st)
            .field("priority", &self.priority)
            .field("original_priority", &self.original_priority)
            .field("stack_words", &self.stack_words)
            .field("link", &self.link)
            .finish()
    }
}

/// The task slab. Slots have stable indices ([`TaskId`]) and stable control
/// block addresses (`Box`); a vacated slot represents a deleted task.
pub(crate) struct TaskArena<Traits: PortThreading> {
    slots: Vec<Option<Box<TaskCb<Traits>>>>,
}

impl<Traits: PortThreading> Init for TaskArena<Traits> {
    const INIT: Self = Self { slots: Vec::new() };
}

impl<Traits: PortThreading> TaskArena<Traits> {
    pub(crate) fn get(&self, id: TaskId) -> Option<&TaskCb<Traits>> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_deref())
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskCb<Traits>> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_deref_mut())
    }

    /// Like [`Self::get`], for IDs the kernel's own lists vouch for.
    #[inline]
    pub(crate) fn cb(&self, id: TaskId) -> &TaskCb<Traits> {
        self.get(id).unwrap()
    }

    /// Like [`Self::get_mut`], for IDs the kernel's own lists vouch for.
    #[inline]
    pub(crate) fn cb_mut(&mut self, id: TaskId) -> &mut TaskCb<Traits> {
        self.get_mut(id).unwrap()
    }

    fn alloc(&mut self, cb: Box<TaskCb<Traits>>) -> Result<TaskId, CreateTaskError> {
        if let Some(i) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[i] = Some(cb);
            return Ok(TaskId(i as u16));
        }
        if self.slots.len() > u16::MAX as usize || self.slots.try_reserve(1).is_err() {
            return Err(CreateTaskError::AllocationFailed);
        }
        self.slots.push(Some(cb));
        Ok(TaskId((self.slots.len() - 1) as u16))
    }

    fn free(&mut self, id: TaskId) -> Option<Box<TaskCb<Traits>>> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.take())
    }
}

/// The idle task's body. Always present at the lowest priority so a
/// scheduler pass always finds a task to run.
pub(crate) fn idle_task_body<Traits: KernelTraits>(_param: usize) {
    loop {
        // Safety: the idle task runs with CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Where control ends up if a task entry function returns. Tasks must not
/// return; there is no context to return into.
pub extern "C" fn task_exit_trampoline() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

impl<Traits: PortThreading> KernelState<Traits> {
    /// The core of `task_create`: allocate the stack and control block, seed
    /// the initial frame, and insert the task into its priority bucket.
    pub(crate) fn create_task(
        &mut self,
        entry: TaskFn,
        name: &str,
        param: usize,
        stack_words: usize,
        priority: Priority,
        floating_point: bool,
    ) -> Result<TaskId, CreateTaskError> {
        if stack_words == 0 {
            return Err(CreateTaskError::InvalidStackSize);
        }
        if !(PRIORITY_IDLE..=PRIORITY_MAX).contains(&priority) {
            return Err(CreateTaskError::InvalidPriority);
        }

        let context_words = if floating_point {
            MIN_STACK_SIZE_FPU
        } else {
            MIN_STACK_SIZE_NO_FPU
        };
        let mut stack = Vec::new();
        if stack.try_reserve_exact(stack_words + context_words).is_err() {
            return Err(CreateTaskError::AllocationFailed);
        }
        stack.resize(stack_words + context_words, MaybeUninit::uninit());

        let mut name_buf = ArrayString::new();
        for c in name.chars() {
            if name_buf.try_push(c).is_err() {
                break;
            }
        }

        let mut flags = TaskFlags::REGISTERS_SAVED;
        if floating_point {
            flags |= TaskFlags::FLOATING_POINT;
        }

        let mut cb = Box::new(TaskCb {
            port_task_state: Init::INIT,
            stack: stack.into_boxed_slice(),
            stack_words,
            entry,
            entry_param: param,
            st: TaskSt::Ready,
            priority,
            original_priority: priority,
            flags,
            notification_message: 0,
            link: None,
            name: name_buf,
        });

        // Safety: the task is not yet reachable by the scheduler
        unsafe { Traits::initialize_task_state(&mut cb) };

        let id = self.tasks.alloc(cb)?;
        self.ready.insert_head(&mut self.tasks, id);
        Ok(id)
    }

    /// Transition a Waiting or Blocked task into Ready and link it.
    pub(crate) fn make_ready(&mut self, task: TaskId) {
        let cb = self.tasks.cb_mut(task);
        debug_assert!(matches!(cb.st, TaskSt::Waiting | TaskSt::Blocked));
        cb.st = TaskSt::Ready;
        self.ready.insert_head(&mut self.tasks, task);
    }

    /// The core of `task_stop`. Returns `true` if the stopped task is the
    /// running task (the caller must yield).
    pub(crate) fn stop_task(&mut self, task: TaskId) -> Result<bool, BadIdError> {
        let st = self.tasks.get(task).ok_or(BadIdError::BadId)?.st;
        match st {
            TaskSt::Blocked => return Ok(false),
            TaskSt::Waiting => {
                self.timeouts.remove_task(task);
            }
            TaskSt::Ready | TaskSt::Running => {
                self.ready.remove(&mut self.tasks, task);
            }
        }
        self.tasks.cb_mut(task).st = TaskSt::Blocked;

        if self.running_task == Some(task) {
            self.running_task = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The core of `task_resume`. Returns `true` if the resumed task
    /// out-prioritizes the running task (the caller should yield).
    pub(crate) fn resume_task(&mut self, task: TaskId) -> Result<bool, BadIdError> {
        let st = self.tasks.get(task).ok_or(BadIdError::BadId)?.st;
        match st {
            TaskSt::Ready | TaskSt::Running => return Ok(false),
            TaskSt::Waiting => {
                self.timeouts.remove_task(task);
            }
            TaskSt::Blocked => {}
        }
        self.make_ready(task);

        let resumed_priority = self.tasks.cb(task).priority;
        Ok(match self.running_task {
            Some(cur) => resumed_priority > self.tasks.cb(cur).priority,
            None => false,
        })
    }

    /// The core of `task_delete`: unlink from whatever list holds the task
    /// and vacate the slot, freeing the stack and control block. Returns
    /// `true` on self-deletion (the caller must yield and never use the
    /// current context again).
    pub(crate) fn delete_task(&mut self, task: TaskId) -> Result<bool, BadIdError> {
        let st = self.tasks.get(task).ok_or(BadIdError::BadId)?.st;
        match st {
            TaskSt::Waiting => {
                self.timeouts.remove_task(task);
            }
            TaskSt::Ready | TaskSt::Running => {
                self.ready.remove(&mut self.tasks, task);
            }
            TaskSt::Blocked => {}
        }
        self.tasks.free(task);

        if self.running_task == Some(task) {
            self.running_task = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The core of `task_update_priority`: assign a new base priority and
    /// relink the task. Any pending inheritance boost is cancelled.
    pub(crate) fn update_priority(
        &mut self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), UpdatePriorityError> {
        if !(PRIORITY_IDLE..=PRIORITY_MAX).contains(&priority) {
            return Err(UpdatePriorityError::InvalidPriority);
        }
        let cb = self.tasks.get(task).ok_or(UpdatePriorityError::BadId)?;
        let linked = cb.link.is_some();

        if linked {
            self.ready.remove(&mut self.tasks, task);
        }
        let cb = self.tasks.cb_mut(task);
        cb.priority = priority;
        cb.original_priority = priority;
        if linked {
            self.ready.insert_head(&mut self.tasks, task);
        }
        Ok(())
    }

    /// Raise `task`'s effective priority to at least `priority`, relinking it
    /// if it is in a bucket. `original_priority` is untouched; the boost is
    /// consumed by the scheduler at the task's next dispatch.
    pub(crate) fn raise_priority(
        &mut self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), BadIdError> {
        let cb = self.tasks.get(task).ok_or(BadIdError::BadId)?;
        if priority <= cb.priority {
            return Ok(());
        }
        let linked = cb.link.is_some();

        if linked {
            self.ready.remove(&mut self.tasks, task);
        }
        self.tasks.cb_mut(task).priority = priority;
        if linked {
            self.ready.insert_head(&mut self.tasks, task);
        }
        Ok(())
    }

    /// The effective priority of a task.
    pub(crate) fn task_priority(&self, task: TaskId) -> Option<Priority> {
        self.tasks.get(task).map(|cb| cb.priority)
    }

    /// The core of `task_delay`: move the running task onto the time-wait
    /// list. Returns `true` if there was a running task (the caller must
    /// yield).
    pub(crate) fn delay_current(&mut self, deadline: u32) -> bool {
        let cur = match self.running_task {
            Some(cur) => cur,
            None => return false,
        };
        self.ready.remove(&mut self.tasks, cur);
        self.tasks.cb_mut(cur).st = TaskSt::Waiting;
        self.timeouts.insert_task(cur, deadline);
        true
    }

    /// The scheduler pass: select the next task to run per the dispatch
    /// policy and update `running_task`. The register swap around this call
    /// is the port trampoline's job.
    pub(crate) fn choose_running_task(&mut self) {
        let quantum_expired = self.quantum_ticks >= QUANTUM;

        // The priority index the current task defends its tenure with; `None`
        // if there is no current task or it can no longer run.
        let current_pri = self.running_task.and_then(|cur| {
            let cb = self.tasks.cb(cur);
            if cb.st == TaskSt::Running {
                Some(priority_index(cb.priority))
            } else {
                None
            }
        });

        let highest = match self.ready.find_highest() {
            Some(i) => i,
            // Only possible before the idle task exists
            None => return,
        };

        let switch = match current_pri {
            None => true,
            Some(p) => quantum_expired || highest > p,
        };
        if !switch {
            return;
        }
        if quantum_expired {
            self.quantum_ticks = 0;
        }

        // Select the head and rotate the bucket, realizing round-robin among
        // the bucket's members
        let next = self.ready.front(highest).unwrap();
        self.ready.rotate(&self.tasks, highest);

        // Consume one inheritance boost: the boost got the task selected;
        // from here on it runs at (and is linked under) its original priority
        let cb = self.tasks.cb(next);
        if cb.priority != cb.original_priority {
            let original = cb.original_priority;
            self.ready.remove(&mut self.tasks, next);
            self.tasks.cb_mut(next).priority = original;
            self.ready.insert_head(&mut self.tasks, next);
        }

        if Some(next) == self.running_task {
            // Usually a no-op; repairs the state when the current task was
            // made Ready behind the scheduler's back (a resume racing its own
            // delay) and got re-selected
            self.tasks.cb_mut(next).st = TaskSt::Running;
            return;
        }

        // The previous task loses the processor but keeps its bucket link
        if let Some(prev) = self.running_task {
            let cb = self.tasks.cb_mut(prev);
            if cb.st == TaskSt::Running {
                cb.st = TaskSt::Ready;
            }
        }

        self.tasks.cb_mut(next).st = TaskSt::Running;
        self.running_task = Some(next);
    }
}

/// These associated functions implement the task-related portion of the
/// public API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a task and insert it into the ready set.
    ///
    /// `stack_words` is the usable stack depth in 32-bit words; the context
    /// frame (16 words, or 49 with `floating_point`) is allocated on top of
    /// it. `name` is truncated to [`MAX_TASK_NAME_LEN`] bytes.
    pub fn task_create(
        entry: TaskFn,
        name: &str,
        param: usize,
        stack_words: usize,
        priority: Priority,
        floating_point: bool,
    ) -> Result<TaskId, CreateTaskError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state().kernel.write(&mut *lock).create_task(
            entry,
            name,
            param,
            stack_words,
            priority,
            floating_point,
        )
    }

    /// Change a task's priority (base and effective).
    pub fn task_update_priority(
        task: TaskId,
        priority: Priority,
    ) -> Result<(), UpdatePriorityError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .write(&mut *lock)
            .update_priority(task, priority)
    }

    /// Stop (suspend) a task. Stopping the running task yields.
    pub fn task_stop(task: TaskId) -> Result<(), BadIdError> {
        let stopped_self = {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            Traits::state().kernel.write(&mut *lock).stop_task(task)?
        };
        if stopped_self {
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
        Ok(())
    }

    /// Resume a stopped or delayed task. Yields if the resumed task
    /// out-prioritizes the caller (suppressed in interrupt context and while
    /// a timer callback runs, where the return path dispatches anyway).
    pub fn task_resume(task: TaskId) -> Result<(), BadIdError> {
        let should_yield = {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            Traits::state().kernel.write(&mut *lock).resume_task(task)?
        };
        if should_yield
            && !Traits::state().timer_running.load(Ordering::Relaxed)
            && !Traits::is_interrupt_context()
        {
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
        Ok(())
    }

    /// Delete a task, freeing its stack and control block. The handle is
    /// invalid afterwards. Self-deletion yields and does not return.
    pub fn task_delete(task: TaskId) -> Result<(), BadIdError> {
        let deleted_self = {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            Traits::state().kernel.write(&mut *lock).delete_task(task)?
        };
        if deleted_self {
            // The current stack is gone; the dispatch trampoline skips the
            // context save because `running_task` is `None`.
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
        Ok(())
    }

    /// Delay (sleep) the calling task for `duration_ms` milliseconds. A
    /// duration that converts to zero ticks degenerates to a pure yield.
    pub fn task_delay(duration_ms: u32) {
        let ticks = ms_to_ticks(duration_ms);
        if ticks == 0 {
            Self::task_yield();
            return;
        }
        let wait = {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            let deadline = Traits::state()
                .tick_count
                .load(Ordering::Relaxed)
                .saturating_add(ticks);
            Traits::state()
                .kernel
                .write(&mut *lock)
                .delay_current(deadline)
        };
        if wait {
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
    }

    /// Voluntarily request a scheduling decision.
    #[inline]
    pub fn task_yield() {
        // Safety: called from task context with CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }

    /// The task currently owning the processor.
    pub fn current_task() -> Option<TaskId> {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state().kernel.read(&*lock).running_task
    }

    /// A task's effective priority (including a not-yet-consumed boost).
    pub fn task_priority(task: TaskId) -> Result<Priority, BadIdError> {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .kernel
            .read(&*lock)
            .task_priority(task)
            .ok_or(BadIdError::BadId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cfg::PRIORITY_NORMAL, test_stub::StubPort};

    fn body(_: usize) {}

    fn new_state() -> KernelState<StubPort> {
        KernelState::INIT
    }

    fn spawn(state: &mut KernelState<StubPort>, name: &str, priority: Priority) -> TaskId {
        state.create_task(body, name, 0, 16, priority, false).unwrap()
    }

    /// Run one scheduler pass with the quantum forced to expired.
    fn pass_with_expired_quantum(state: &mut KernelState<StubPort>) -> Option<TaskId> {
        state.quantum_ticks = QUANTUM;
        state.choose_running_task();
        state.running_task
    }

    #[test]
    fn create_validates_parameters() {
        let mut state = new_state();
        assert_eq!(
            state.create_task(body, "t", 0, 0, PRIORITY_NORMAL, false),
            Err(CreateTaskError::InvalidStackSize)
        );
        assert_eq!(
            state.create_task(body, "t", 0, 16, 16, false),
            Err(CreateTaskError::InvalidPriority)
        );
        assert_eq!(
            state.create_task(body, "t", 0, 16, -17, false),
            Err(CreateTaskError::InvalidPriority)
        );
    }

    #[test]
    fn create_truncates_name() {
        let mut state = new_state();
        let id = spawn(&mut state, "a-name-well-beyond-the-limit", PRIORITY_NORMAL);
        assert_eq!(state.tasks.cb(id).name(), "a-name-well-");
    }

    #[test]
    fn fpu_stack_gets_larger_context() {
        let mut state = new_state();
        let plain = spawn(&mut state, "plain", PRIORITY_NORMAL);
        let fpu = state
            .create_task(body, "fpu", 0, 16, PRIORITY_NORMAL, true)
            .unwrap();
        assert_eq!(state.tasks.cb(plain).stack.len(), 16 + MIN_STACK_SIZE_NO_FPU);
        assert_eq!(state.tasks.cb(fpu).stack.len(), 16 + MIN_STACK_SIZE_FPU);
        assert!(state.tasks.cb(fpu).floating_point());
    }

    #[test]
    fn bitmap_tracks_bucket_occupancy() {
        let mut state = new_state();
        let a = spawn(&mut state, "a", PRIORITY_NORMAL);
        let b = spawn(&mut state, "b", 2);
        state.ready.assert_bitmap_consistent();

        state.stop_task(a).unwrap();
        state.ready.assert_bitmap_consistent();
        assert_eq!(state.ready.find_highest(), Some(priority_index(2)));

        state.delete_task(b).unwrap();
        state.ready.assert_bitmap_consistent();
        assert_eq!(state.ready.find_highest(), None);

        state.resume_task(a).unwrap();
        state.ready.assert_bitmap_consistent();
        assert_eq!(
            state.ready.find_highest(),
            Some(priority_index(PRIORITY_NORMAL))
        );
    }

    #[test]
    fn round_robin_rotates_equal_priorities() {
        let mut state = new_state();
        let a = spawn(&mut state, "a", PRIORITY_NORMAL);
        let b = spawn(&mut state, "b", PRIORITY_NORMAL);
        let c = spawn(&mut state, "c", PRIORITY_NORMAL);

        // Each expired-quantum pass must hand the processor to a different
        // member of the bucket, visiting all of them in ring order
        let first = pass_with_expired_quantum(&mut state).unwrap();
        let second = pass_with_expired_quantum(&mut state).unwrap();
        let third = pass_with_expired_quantum(&mut state).unwrap();
        let fourth = pass_with_expired_quantum(&mut state).unwrap();

        let mut seen = [first, second, third];
        seen.sort_by_key(|t| t.0);
        let mut all = [a, b, c];
        all.sort_by_key(|t| t.0);
        assert_eq!(seen, all);
        assert_eq!(fourth, first);
    }

    #[test]
    fn higher_priority_preempts_mid_quantum() {
        let mut state = new_state();
        let low = spawn(&mut state, "low", PRIORITY_NORMAL);
        assert_eq!(pass_with_expired_quantum(&mut state), Some(low));

        // Mid-quantum, an equal-priority task must not preempt...
        state.quantum_ticks = 0;
        spawn(&mut state, "peer", PRIORITY_NORMAL);
        state.choose_running_task();
        assert_eq!(state.running_task, Some(low));

        // ...but a strictly higher-priority one must
        let high = spawn(&mut state, "high", 2);
        state.choose_running_task();
        assert_eq!(state.running_task, Some(high));
        assert_eq!(state.tasks.cb(high).st, TaskSt::Running);
        assert_eq!(state.tasks.cb(low).st, TaskSt::Ready);
        // The demoted task keeps its bucket link
        assert!(state.tasks.cb(low).link.is_some());
    }

    #[test]
    fn blocked_current_forces_switch() {
        let mut state = new_state();
        let a = spawn(&mut state, "a", PRIORITY_NORMAL);
        let b = spawn(&mut state, "b", PRIORITY_NORMAL);
        let _ = b;
        assert!(pass_with_expired_quantum(&mut state).is_some());

        let cur = state.running_task.unwrap();
        state.quantum_ticks = 0;
        state.stop_task(cur).unwrap();
        state.choose_running_task();
        let next = state.running_task.unwrap();
        assert_ne!(next, cur);
        assert_eq!(state.tasks.cb(next).st, TaskSt::Running);
        let _ = a;
    }

    #[test]
    fn boost_is_consumed_on_dispatch() {
        let mut state = new_state();
        let low = spawn(&mut state, "low", PRIORITY_NORMAL);
        let high = spawn(&mut state, "high", 2);
        assert_eq!(pass_with_expired_quantum(&mut state), Some(high));

        // Raise `low` above `high`
        state.raise_priority(low, 5).unwrap();
        assert_eq!(state.tasks.cb(low).priority, 5);
        state.quantum_ticks = 0;
        state.choose_running_task();

        // The boost got it dispatched and was consumed in the same pass
        assert_eq!(state.running_task, Some(low));
        assert_eq!(state.tasks.cb(low).priority, PRIORITY_NORMAL);
        assert_eq!(state.tasks.cb(low).original_priority, PRIORITY_NORMAL);
        state.ready.assert_bitmap_consistent();
        assert!(state
            .ready
            .iter_bucket(&state.tasks, priority_index(PRIORITY_NORMAL))
            .contains(&low));

        // With the boost gone, the next pass goes back to `high`
        state.quantum_ticks = 0;
        state.choose_running_task();
        assert_eq!(state.running_task, Some(high));
    }

    #[test]
    fn raise_priority_never_lowers() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", 2);
        state.raise_priority(task, PRIORITY_NORMAL).unwrap();
        assert_eq!(state.tasks.cb(task).priority, 2);
    }

    #[test]
    fn update_priority_moves_bucket_and_cancels_boost() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", PRIORITY_NORMAL);
        state.raise_priority(task, 5).unwrap();

        state.update_priority(task, 1).unwrap();
        let cb = state.tasks.cb(task);
        assert_eq!((cb.priority, cb.original_priority), (1, 1));
        state.ready.assert_bitmap_consistent();
        assert!(state
            .ready
            .iter_bucket(&state.tasks, priority_index(1))
            .contains(&task));

        assert_eq!(
            state.update_priority(task, 16),
            Err(UpdatePriorityError::InvalidPriority)
        );
    }

    #[test]
    fn stop_then_resume_restores_ready_membership() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", PRIORITY_NORMAL);
        let bucket = priority_index(PRIORITY_NORMAL);

        state.stop_task(task).unwrap();
        assert_eq!(state.tasks.cb(task).st, TaskSt::Blocked);
        assert!(!state.ready.iter_bucket(&state.tasks, bucket).contains(&task));

        state.resume_task(task).unwrap();
        assert_eq!(state.tasks.cb(task).st, TaskSt::Ready);
        assert!(state.ready.iter_bucket(&state.tasks, bucket).contains(&task));

        // Resuming a Ready task is a no-op
        state.resume_task(task).unwrap();
        assert_eq!(state.ready.iter_bucket(&state.tasks, bucket), [task]);
    }

    #[test]
    fn delay_round_trips_through_time_wait_list() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", PRIORITY_NORMAL);
        assert_eq!(pass_with_expired_quantum(&mut state), Some(task));

        assert!(state.delay_current(10));
        assert_eq!(state.tasks.cb(task).st, TaskSt::Waiting);
        assert!(state.tasks.cb(task).link.is_none());
        assert_eq!(state.timeouts.earliest_deadline(), 10);

        // Not due yet
        assert_eq!(state.advance_time_waits(9, false), None);
        assert_eq!(state.tasks.cb(task).st, TaskSt::Waiting);

        assert_eq!(state.advance_time_waits(10, false), None);
        assert_eq!(state.tasks.cb(task).st, TaskSt::Ready);
        assert_eq!(state.timeouts.earliest_deadline(), u32::MAX);
    }

    #[test]
    fn stop_removes_pending_delay() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", PRIORITY_NORMAL);
        pass_with_expired_quantum(&mut state);
        state.delay_current(10);

        state.stop_task(task).unwrap();
        assert_eq!(state.timeouts.earliest_deadline(), u32::MAX);
        assert_eq!(state.tasks.cb(task).st, TaskSt::Blocked);

        // The wake never happens
        assert_eq!(state.advance_time_waits(u32::MAX, false), None);
        assert_eq!(state.tasks.cb(task).st, TaskSt::Blocked);
    }

    #[test]
    fn delete_vacates_the_slot() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", PRIORITY_NORMAL);
        state.delete_task(task).unwrap();
        assert!(state.tasks.get(task).is_none());
        assert_eq!(state.stop_task(task), Err(BadIdError::BadId));
        state.ready.assert_bitmap_consistent();
    }

    #[test]
    fn self_delete_clears_running_task() {
        let mut state = new_state();
        let task = spawn(&mut state, "t", PRIORITY_NORMAL);
        assert_eq!(pass_with_expired_quantum(&mut state), Some(task));
        assert!(state.delete_task(task).unwrap());
        assert_eq!(state.running_task, None);
    }
}
