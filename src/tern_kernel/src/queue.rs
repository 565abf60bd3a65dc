//! Bounded message queues
//!
//! A queue transfers fixed-size items by value: `send` heap-copies the
//! payload into a slot, `receive` copies it out and frees the slot. Blocking
//! variants cooperatively poll with a tick deadline, like the other wait
//! loops in this kernel.
use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::Ordering;

use crate::{klock, KernelTraits};

struct QueueInner {
    /// One owning slot per in-flight item.
    items: Box<[Option<Box<[u8]>>]>,
    max_len: usize,
    len: usize,
    item_size: usize,
    /// Monotonic read cursor; `read_pos = head_index % max_len`, and writes
    /// go to `(head_index + len) % max_len`.
    head_index: usize,
}

/// A bounded FIFO of copy-by-value items.
pub struct Queue<Traits> {
    inner: klock::CpuLockCell<Traits, QueueInner>,
}

impl<Traits: KernelTraits> Queue<Traits> {
    /// Create a queue holding up to `capacity` items of `item_size` bytes
    /// each.
    pub fn new(capacity: usize, item_size: usize) -> Self {
        Self {
            inner: klock::CpuLockCell::new(QueueInner {
                items: (0..capacity).map(|_| None).collect(),
                max_len: capacity,
                len: 0,
                item_size,
                head_index: 0,
            }),
        }
    }

    /// Enqueue a copy of `item`, waiting up to `timeout_ticks` for space.
    ///
    /// Returns `false` on timeout, on allocation failure, or if `item`'s
    /// length does not match the queue's item size.
    pub fn send(&self, item: &[u8], timeout_ticks: u32) -> bool {
        let state = Traits::state();
        let deadline = state
            .tick_count
            .load(Ordering::Relaxed)
            .saturating_add(timeout_ticks);

        loop {
            {
                let mut lock = klock::lock_cpu::<Traits>().unwrap();
                match self.try_send(&mut lock, item) {
                    SendOutcome::Sent => return true,
                    SendOutcome::Rejected => return false,
                    SendOutcome::Full => {}
                }
            }
            if state.tick_count.load(Ordering::Relaxed) >= deadline {
                return false;
            }
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
    }

    /// Enqueue from interrupt context: a single attempt, `false` when full.
    pub fn send_from_isr(&self, item: &[u8]) -> bool {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        matches!(self.try_send(&mut lock, item), SendOutcome::Sent)
    }

    /// Dequeue the oldest item into `buf`, waiting up to `timeout_ticks`.
    ///
    /// Returns `false` on timeout or if `buf`'s length does not match the
    /// queue's item size.
    pub fn receive(&self, buf: &mut [u8], timeout_ticks: u32) -> bool {
        let state = Traits::state();
        let deadline = state
            .tick_count
            .load(Ordering::Relaxed)
            .saturating_add(timeout_ticks);

        loop {
            {
                let mut lock = klock::lock_cpu::<Traits>().unwrap();
                let queue = self.inner.write(&mut *lock);
                if buf.len() != queue.item_size {
                    return false;
                }
                if queue.len > 0 {
                    let read_pos = queue.head_index % queue.max_len;
                    let payload = queue.items[read_pos].take().unwrap();
                    buf.copy_from_slice(&payload);
                    queue.head_index = queue.head_index.wrapping_add(1);
                    queue.len -= 1;
                    return true;
                }
            }
            if state.tick_count.load(Ordering::Relaxed) >= deadline {
                return false;
            }
            // Safety: CPU Lock released above
            unsafe { Traits::yield_cpu() };
        }
    }

    fn try_send(&self, lock: &mut klock::CpuLockGuard<Traits>, item: &[u8]) -> SendOutcome {
        let queue = self.inner.write(&mut **lock);
        if item.len() != queue.item_size {
            return SendOutcome::Rejected;
        }
        if queue.len == queue.max_len {
            return SendOutcome::Full;
        }

        let mut payload = Vec::new();
        if payload.try_reserve_exact(queue.item_size).is_err() {
            return SendOutcome::Rejected;
        }
        payload.extend_from_slice(item);

        let write_pos = (queue.head_index + queue.len) % queue.max_len;
        debug_assert!(queue.items[write_pos].is_none());
        queue.items[write_pos] = Some(payload.into_boxed_slice());
        queue.len += 1;
        SendOutcome::Sent
    }
}

enum SendOutcome {
    Sent,
    /// No space; the caller may wait and retry.
    Full,
    /// Size mismatch or allocation failure; retrying cannot help.
    Rejected,
}
