//! The time-wait subsystem: a single kernel-wide list of pending deadlines
//! shared by task delays and software timers, driven from the tick.
//!
//! The list is singly-linked and sorted ascending by deadline. The head's
//! deadline is cached in `earliest_deadline` so the tick handler can reject
//! the common no-work case with one comparison. Deadlines are formed with
//! saturating addition: a deadline of `u32::MAX` ticks effectively never
//! fires.
use alloc::boxed::Box;
use core::sync::atomic::Ordering;
use either::Either;

use crate::{
    cfg::QUANTUM, klock, task::TaskSt, timer::TimerSt, utils::Init, KernelState, KernelTraits,
    PortThreading, TaskId, TickAction, TimerId, UTicks,
};

/// One pending deadline: a delayed task or an armed software timer.
pub(crate) struct TimeoutNode {
    pub(crate) subject: Either<TaskId, TimerId>,
    pub(crate) deadline: UTicks,
    next: Option<Box<TimeoutNode>>,
}

/// The time-wait list.
///
/// Invariants: sorted ascending by `deadline` (FIFO among equals); at most
/// one node per task or timer; `earliest_deadline` equals the head's deadline
/// and `u32::MAX` when the list is empty.
pub(crate) struct TimeoutList {
    head: Option<Box<TimeoutNode>>,
    earliest_deadline: UTicks,
}

impl Init for TimeoutList {
    const INIT: Self = Self {
        head: None,
        earliest_deadline: u32::MAX,
    };
}

impl TimeoutList {
    #[inline]
    pub(crate) fn earliest_deadline(&self) -> UTicks {
        self.earliest_deadline
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = &self.head;
        while let Some(node) = cur {
            n += 1;
            cur = &node.next;
        }
        n
    }

    /// Splice a node into its sorted position. Nodes with equal deadlines
    /// keep insertion order.
    pub(crate) fn insert(&mut self, mut node: Box<TimeoutNode>) {
        debug_assert!(node.next.is_none());

        let mut cur = &mut self.head;
        while cur.as_ref().map_or(false, |n| n.deadline <= node.deadline) {
            cur = &mut cur.as_mut().unwrap().next;
        }
        node.next = cur.take();
        *cur = Some(node);

        self.earliest_deadline = self.head.as_ref().unwrap().deadline;
    }

    /// Register a task delay expiring at `deadline`.
    pub(crate) fn insert_task(&mut self, task: TaskId, deadline: UTicks) {
        self.insert(Box::new(TimeoutNode {
            subject: Either::Left(task),
            deadline,
            next: None,
        }));
    }

    /// Register a timer expiry at `deadline`.
    pub(crate) fn insert_timer(&mut self, timer: TimerId, deadline: UTicks) {
        self.insert(Box::new(TimeoutNode {
            subject: Either::Right(timer),
            deadline,
            next: None,
        }));
    }

    /// The subject of the head node, if its deadline has passed.
    #[inline]
    pub(crate) fn peek_due(&self, now: UTicks) -> Option<Either<TaskId, TimerId>> {
        // The cache makes the common "nothing due" case one comparison
        if self.earliest_deadline > now {
            return None;
        }
        self.head.as_ref().map(|n| n.subject)
    }

    /// Unlink and return the head node. The caller owns the node and may
    /// re-insert it (the auto-reload path does, so the tick handler never
    /// allocates).
    pub(crate) fn pop_first(&mut self) -> Option<Box<TimeoutNode>> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        // The list may just have become empty; guard before reading the new
        // head's deadline
        self.earliest_deadline = self.head.as_ref().map_or(u32::MAX, |n| n.deadline);
        Some(node)
    }

    /// Remove the node belonging to `task`, if any (linear scan).
    pub(crate) fn remove_task(&mut self, task: TaskId) -> Option<Box<TimeoutNode>> {
        self.remove_where(|n| n.subject == Either::Left(task))
    }

    /// Remove the node belonging to `timer`, if any (linear scan).
    pub(crate) fn remove_timer(&mut self, timer: TimerId) -> Option<Box<TimeoutNode>> {
        self.remove_where(|n| n.subject == Either::Right(timer))
    }

    fn remove_where(
        &mut self,
        pred: impl Fn(&TimeoutNode) -> bool,
    ) -> Option<Box<TimeoutNode>> {
        let mut cur = &mut self.head;
        while cur.as_ref().map_or(false, |n| !pred(n)) {
            cur = &mut cur.as_mut().unwrap().next;
        }
        let mut node = cur.take()?;
        *cur = node.next.take();
        self.earliest_deadline = self.head.as_ref().map_or(u32::MAX, |n| n.deadline);
        Some(node)
    }
}

impl<Traits: PortThreading> KernelState<Traits> {
    /// Drain the time-wait list up to `now`.
    ///
    /// Fired task delays move their task back into the ready set. The first
    /// due timer ends the drain: it is re-armed (auto-reload) or retired
    /// (one-shot, status Blocked) and returned so the caller can run its
    /// callback. A due timer encountered while `timer_running` is set stays
    /// on the list — callbacks do not nest, so it fires on a later tick.
    pub(crate) fn advance_time_waits(
        &mut self,
        now: UTicks,
        timer_running: bool,
    ) -> Option<TimerId> {
        while let Some(subject) = self.timeouts.peek_due(now) {
            match subject {
                Either::Left(task) => {
                    let node = self.timeouts.pop_first();
                    debug_assert!(node.is_some());
                    // Only Waiting tasks have nodes here; `stop`/`delete`
                    // remove theirs eagerly
                    debug_assert_eq!(self.tasks.cb(task).st, TaskSt::Waiting);
                    self.make_ready(task);
                }
                Either::Right(timer) => {
                    if timer_running {
                        break;
                    }
                    let mut node = self.timeouts.pop_first().unwrap();
                    let cb = match self.timers.get_mut(timer) {
                        Some(cb) => cb,
                        None => continue,
                    };
                    if cb.auto_reload {
                        node.deadline = node.deadline.saturating_add(cb.period);
                        self.timeouts.insert(node);
                    } else {
                        cb.st = TimerSt::Blocked;
                    }
                    return Some(timer);
                }
            }
        }
        None
    }
}

/// The tick handler. Counts the tick, drains the time-wait list, and decides
/// whether the trampoline should dispatch or enter the timer-fire path.
///
/// Precondition: CPU Lock inactive, interrupt context.
pub(super) fn handle_tick<Traits: KernelTraits>() -> TickAction {
    let state = Traits::state();

    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    let now = state.tick_count.load(Ordering::Relaxed).wrapping_add(1);
    state.tick_count.store(now, Ordering::Relaxed);

    let timer_running = state.timer_running.load(Ordering::Relaxed);
    let kernel = state.kernel.write(&mut *lock);

    if let Some(timer) = kernel.advance_time_waits(now, timer_running) {
        state.timer_running.store(true, Ordering::Relaxed);
        return TickAction::FireTimer(timer);
    }

    kernel.quantum_ticks += 1;
    if kernel.quantum_ticks >= QUANTUM && !timer_running {
        TickAction::Dispatch
    } else {
        TickAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn node(task: u16, deadline: u32) -> Box<TimeoutNode> {
        Box::new(TimeoutNode {
            subject: Either::Left(TaskId(task)),
            deadline,
            next: None,
        })
    }

    fn drain(list: &mut TimeoutList) -> Vec<(u16, u32)> {
        let mut out = Vec::new();
        while let Some(node) = list.pop_first() {
            let task = match node.subject {
                Either::Left(TaskId(i)) => i,
                Either::Right(_) => unreachable!(),
            };
            out.push((task, node.deadline));
        }
        out
    }

    #[quickcheck]
    fn stays_sorted(deadlines: Vec<u32>) {
        let mut list = TimeoutList::INIT;
        for (i, &deadline) in deadlines.iter().enumerate() {
            list.insert(node(i as u16, deadline));
            assert_eq!(
                list.earliest_deadline(),
                list.head.as_ref().unwrap().deadline
            );
        }

        let mut expected: Vec<u32> = deadlines.clone();
        expected.sort();
        let drained: Vec<u32> = drain(&mut list).iter().map(|&(_, d)| d).collect();
        assert_eq!(drained, expected);
        assert_eq!(list.earliest_deadline(), u32::MAX);
    }

    #[test]
    fn fifo_among_equal_deadlines() {
        let mut list = TimeoutList::INIT;
        list.insert(node(0, 7));
        list.insert(node(1, 7));
        list.insert(node(2, 3));
        list.insert(node(3, 7));
        assert_eq!(drain(&mut list), [(2, 3), (0, 7), (1, 7), (3, 7)]);
    }

    #[test]
    fn pop_on_singleton_resets_cache() {
        let mut list = TimeoutList::INIT;
        list.insert(node(0, 42));
        assert_eq!(list.earliest_deadline(), 42);
        assert!(list.pop_first().is_some());
        // The list is empty; the cache must not be read through a dangling
        // head
        assert_eq!(list.earliest_deadline(), u32::MAX);
        assert!(list.pop_first().is_none());
    }

    #[test]
    fn remove_by_subject() {
        let mut list = TimeoutList::INIT;
        list.insert(node(0, 10));
        list.insert(node(1, 20));
        list.insert_timer(TimerId(4), 15);
        assert_eq!(list.len(), 3);

        assert!(list.remove_timer(TimerId(4)).is_some());
        assert!(list.remove_timer(TimerId(4)).is_none());
        assert!(list.remove_task(TaskId(0)).is_some());
        assert_eq!(list.earliest_deadline(), 20);
        assert_eq!(drain(&mut list), [(1, 20)]);
    }

    #[test]
    fn peek_due_honors_now() {
        let mut list = TimeoutList::INIT;
        list.insert(node(0, 10));
        assert_eq!(list.peek_due(9), None);
        assert_eq!(list.peek_due(10), Some(Either::Left(TaskId(0))));
        assert_eq!(list.peek_due(11), Some(Either::Left(TaskId(0))));
    }
}
