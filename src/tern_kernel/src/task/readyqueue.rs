//! Task ready queue implementation (internal use only).
//!
//! Ready tasks are kept in per-priority buckets — closed circular
//! doubly-linked rings threaded through [`TaskCb::link`] by slot index — with
//! a 32-bit bitmap for constant-time highest-priority lookup.
use crate::{
    cfg::{priority_index, MAX_TASK_PRIORITY_COUNT},
    task::TaskArena,
    utils::{Init, PrioBitmap},
    PortThreading, TaskId,
};

/// Membership of a task in its priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) next: TaskId,
    pub(crate) prev: TaskId,
}

/// The ready set: one bucket per priority level plus the occupancy bitmap.
pub(crate) struct ReadyQueue {
    /// The head of each bucket, indexed by priority index. The head position
    /// is where insertion happens; rotation advances the head along the ring.
    ///
    /// Invariant: `heads[i].is_some() == bitmap.get(i)`
    heads: [Option<TaskId>; MAX_TASK_PRIORITY_COUNT],

    /// Bit `i` is set iff `heads[i]` is non-empty.
    bitmap: PrioBitmap,
}

impl Init for ReadyQueue {
    const INIT: Self = Self {
        heads: [None; MAX_TASK_PRIORITY_COUNT],
        bitmap: Init::INIT,
    };
}

impl ReadyQueue {
    /// The priority index of the most urgent occupied bucket.
    #[inline]
    pub(crate) fn find_highest(&self) -> Option<usize> {
        self.bitmap.find_highest()
    }

    /// The task at the head position of the specified bucket.
    #[inline]
    pub(crate) fn front(&self, pri_index: usize) -> Option<TaskId> {
        self.heads[pri_index]
    }

    /// Insert `task` at the head position of the bucket matching its current
    /// priority. The task must not be in any bucket.
    pub(crate) fn insert_head<Traits: PortThreading>(
        &mut self,
        tasks: &mut TaskArena<Traits>,
        task: TaskId,
    ) {
        debug_assert!(tasks.cb(task).link.is_none());
        let pri = priority_index(tasks.cb(task).priority);

        match self.heads[pri] {
            None => {
                tasks.cb_mut(task).link = Some(Link {
                    next: task,
                    prev: task,
                });
                self.bitmap.set(pri);
            }
            Some(head) => {
                let prev = tasks.cb(head).link.unwrap().prev;
                tasks.cb_mut(task).link = Some(Link { next: head, prev });
                tasks.cb_mut(prev).link.as_mut().unwrap().next = task;
                tasks.cb_mut(head).link.as_mut().unwrap().prev = task;
            }
        }
        self.heads[pri] = Some(task);
    }

    /// Unlink `task` from its bucket. No-op if it is not linked.
    pub(crate) fn remove<Traits: PortThreading>(
        &mut self,
        tasks: &mut TaskArena<Traits>,
        task: TaskId,
    ) {
        let pri = priority_index(tasks.cb(task).priority);
        let link = match tasks.cb_mut(task).link.take() {
            Some(link) => link,
            None => return,
        };

        if link.next == task {
            // Last member of the ring
            debug_assert_eq!(self.heads[pri], Some(task));
            self.heads[pri] = None;
            self.bitmap.clear(pri);
        } else {
            tasks.cb_mut(link.prev).link.as_mut().unwrap().next = link.next;
            tasks.cb_mut(link.next).link.as_mut().unwrap().prev = link.prev;
            if self.heads[pri] == Some(task) {
                self.heads[pri] = Some(link.next);
            }
        }
    }

    /// Advance the head of the specified bucket to its `next`, realizing the
    /// round-robin rotation.
    pub(crate) fn rotate<Traits: PortThreading>(
        &mut self,
        tasks: &TaskArena<Traits>,
        pri_index: usize,
    ) {
        if let Some(head) = self.heads[pri_index] {
            self.heads[pri_index] = Some(tasks.cb(head).link.unwrap().next);
        }
    }

    /// Check the `bitmap bit ⇔ bucket non-empty` invariant (test support).
    #[cfg(test)]
    pub(crate) fn assert_bitmap_consistent(&self) {
        for i in 0..MAX_TASK_PRIORITY_COUNT {
            assert_eq!(self.heads[i].is_some(), self.bitmap.get(i));
        }
    }

    /// Enumerate a bucket in rotation order, starting at the head (test
    /// support).
    #[cfg(test)]
    pub(crate) fn iter_bucket<Traits: PortThreading>(
        &self,
        tasks: &TaskArena<Traits>,
        pri_index: usize,
    ) -> alloc::vec::Vec<TaskId> {
        let mut out = alloc::vec::Vec::new();
        if let Some(head) = self.heads[pri_index] {
            let mut cur = head;
            loop {
                out.push(cur);
                cur = tasks.cb(cur).link.unwrap().next;
                if cur == head {
                    break;
                }
            }
        }
        out
    }
}
