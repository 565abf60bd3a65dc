//! Kernel behaviour tests, driven through the simulated port.
//!
//! Each test instantiates its own kernel (`use_port!` generates per-type
//! static state), so the tests are independent and can run in parallel. The
//! test body plays the processor: it performs the work of whatever task the
//! kernel considers running and delivers tick interrupts explicitly; the
//! yield hook stands in for "the other tasks run now" while a kernel service
//! polls in its wait loop.
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};

use tern_kernel::{
    cfg::{PRIORITY_HIGH, PRIORITY_MAX, PRIORITY_NORMAL},
    init_kernel, BadIdError, Mutex, Queue, Semaphore, System, TimerId,
};
use tern_port_std::{
    deliver_tick, deliver_ticks, dispatch, set_yield_hook, take_yield_hook,
};

fn noop(_: usize) {}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn round_robin_shares_the_processor_evenly() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_logging();
    init_kernel::<K>().unwrap();
    let t1 = Sys::task_create(noop, "t1", 0, 32, PRIORITY_NORMAL, false).unwrap();
    let t2 = Sys::task_create(noop, "t2", 0, 32, PRIORITY_NORMAL, false).unwrap();
    let t3 = Sys::task_create(noop, "t3", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();

    let mut counts = std::collections::HashMap::new();
    for _ in 0..30 {
        let current = Sys::current_task().unwrap();
        *counts.entry(current).or_insert(0u32) += 1;
        deliver_tick::<K>();
    }

    // 30 ticks at QUANTUM = 2 split into five full rotations; in this
    // deterministic simulation the ±20% requirement collapses to equality
    assert_eq!(counts.get(&t1), Some(&10));
    assert_eq!(counts.get(&t2), Some(&10));
    assert_eq!(counts.get(&t3), Some(&10));
}

#[test]
fn one_shot_timer_preempts_low_priority_loop() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    static HIGH: OnceLock<tern_kernel::TaskId> = OnceLock::new();
    fn wake_high(_timer: TimerId) {
        Sys::task_resume(*HIGH.get().unwrap()).unwrap();
    }

    init_logging();
    init_kernel::<K>().unwrap();
    let low = Sys::task_create(noop, "low", 0, 32, PRIORITY_NORMAL, false).unwrap();
    let high = Sys::task_create(noop, "high", 0, 32, PRIORITY_HIGH, false).unwrap();
    Sys::task_stop(high).unwrap();
    HIGH.set(high).unwrap();
    Sys::timer_create(wake_high, 0, 5, false).unwrap();
    dispatch::<K>();

    let mut low_count = 0u32;
    let mut high_count = 0u32;
    for _ in 0..12 {
        match Sys::current_task() {
            Some(current) if current == low => low_count += 1,
            Some(current) if current == high => {
                high_count += 1;
                // The high task does its one unit of work and stops itself
                Sys::task_stop(high).unwrap();
            }
            _ => {}
        }
        deliver_tick::<K>();
    }

    // The timer fired once, the woken task ran exactly once and immediately
    // (the timer-return pass dispatched it), and the low task ran the rest
    assert_eq!(high_count, 1);
    assert_eq!(low_count, 11);
}

#[test]
fn delay_wakes_at_the_deadline() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    let task = Sys::task_create(noop, "sleeper", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();
    assert_eq!(Sys::current_task(), Some(task));

    // 10 ms at a 1 kHz tick = 10 ticks
    Sys::task_delay(10);
    assert_ne!(Sys::current_task(), Some(task));

    let mut woke_at = None;
    for tick in 1u32..=14 {
        deliver_tick::<K>();
        if Sys::current_task() == Some(task) {
            woke_at = Some(tick);
            break;
        }
    }

    // Ready at the deadline, dispatched within one quantum of it
    let woke_at = woke_at.expect("the sleeper never woke");
    assert!((10..=10 + tern_kernel::cfg::QUANTUM).contains(&woke_at));
}

#[test]
fn delay_of_zero_only_yields() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    let task = Sys::task_create(noop, "t", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();

    Sys::task_delay(0);
    // No wait was registered; the task is still the running task
    assert_eq!(Sys::current_task(), Some(task));
}

#[test]
fn mutex_release_respects_priority_inheritance() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    static M: Mutex<K> = Mutex::new();
    static LOW_PRIORITY_SEEN: AtomicI32 = AtomicI32::new(i32::MIN);

    init_kernel::<K>().unwrap();
    let low = Sys::task_create(noop, "low", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();
    assert_eq!(Sys::current_task(), Some(low));
    assert!(M.take(0));

    let high = Sys::task_create(noop, "high", 0, 32, PRIORITY_HIGH, false).unwrap();
    dispatch::<K>();
    assert_eq!(Sys::current_task(), Some(high));

    set_yield_hook::<K>(Box::new(move || {
        // Observed between the failed poll and the next dispatch: the waiter
        // has lifted the holder to its own priority
        let p = Sys::task_priority(low).unwrap();
        LOW_PRIORITY_SEEN.fetch_max(p as i32, Ordering::Relaxed);

        deliver_tick::<K>();
        if Sys::current_task() == Some(low) {
            // The boosted holder finally runs and releases
            assert!(M.give());
        }
    }));

    // Runs as `high`: blocks until the hook lets `low` release
    assert!(M.take(100));
    take_yield_hook::<K>();

    assert_eq!(LOW_PRIORITY_SEEN.load(Ordering::Relaxed), PRIORITY_HIGH as i32);
    // The boost was consumed when `low` was dispatched
    assert_eq!(Sys::task_priority(low).unwrap(), PRIORITY_NORMAL);
    // `high` owns the mutex now and may release it
    assert_eq!(Sys::current_task(), Some(high));
    assert!(M.give());
}

#[test]
fn mutex_validates_ownership_and_times_out() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    static M: Mutex<K> = Mutex::new();

    init_kernel::<K>().unwrap();
    let owner = Sys::task_create(noop, "owner", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();

    // Releasing an unheld mutex fails
    assert!(!M.give());

    assert!(M.take(0));
    let _ = owner;

    // A second take from the same context can't succeed; with the hook
    // advancing time it must time out
    set_yield_hook::<K>(Box::new(|| deliver_tick::<K>()));
    assert!(!M.take(3));
    take_yield_hook::<K>();

    // An ISR release does not validate ownership
    assert!(M.give_from_isr());
    assert!(!M.give_from_isr());
}

#[test]
fn auto_reload_timer_fires_periodically() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    static FIRED: AtomicU32 = AtomicU32::new(0);
    fn bump(_timer: TimerId) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    init_kernel::<K>().unwrap();
    let timer = Sys::timer_create(bump, 7, 10, true).unwrap();
    dispatch::<K>();

    deliver_ticks::<K>(105);
    let fired = FIRED.load(Ordering::Relaxed);
    assert!((10..=11).contains(&fired), "fired {} times", fired);
    assert_eq!(Sys::timer_user_id(timer), Ok(7));

    // Stopping ends the periodic firing
    Sys::timer_stop(timer).unwrap();
    deliver_ticks::<K>(50);
    assert_eq!(FIRED.load(Ordering::Relaxed), fired);
}

#[test]
fn queue_transfers_items_in_order_across_blocking() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    static Q: OnceLock<Queue<K>> = OnceLock::new();
    static RECEIVED: StdMutex<Vec<[u8; 4]>> = StdMutex::new(Vec::new());
    static TICKS: AtomicU32 = AtomicU32::new(0);

    init_kernel::<K>().unwrap();
    let producer = Sys::task_create(noop, "producer", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();
    assert_eq!(Sys::current_task(), Some(producer));

    let _ = Q.set(Queue::new(2, 4));
    let queue = Q.get().unwrap();

    // The consumer side starts draining one item per yield after 30 ticks
    set_yield_hook::<K>(Box::new(|| {
        let ticks = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
        deliver_tick::<K>();
        if ticks >= 30 {
            let mut buf = [0u8; 4];
            if Q.get().unwrap().receive(&mut buf, 0) {
                RECEIVED.lock().unwrap().push(buf);
            }
        }
    }));

    for i in 0u32..5 {
        assert!(queue.send(&i.to_le_bytes(), 100), "send {} timed out", i);
    }
    take_yield_hook::<K>();

    // Drain whatever the hook didn't get to
    let mut buf = [0u8; 4];
    while queue.receive(&mut buf, 0) {
        RECEIVED.lock().unwrap().push(buf);
    }

    let received = RECEIVED.lock().unwrap();
    let values: Vec<u32> = received.iter().map(|b| u32::from_le_bytes(*b)).collect();
    assert_eq!(values, [0, 1, 2, 3, 4]);
}

#[test]
fn queue_rejects_when_full_or_mismatched() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    Sys::task_create(noop, "t", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();

    let queue: Queue<K> = Queue::new(2, 4);
    assert!(queue.send_from_isr(&1u32.to_le_bytes()));
    assert!(queue.send_from_isr(&2u32.to_le_bytes()));
    // Full: the ISR variant never blocks
    assert!(!queue.send_from_isr(&3u32.to_le_bytes()));
    // Wrong item size
    assert!(!queue.send(&[0u8; 3], 0));

    let mut buf = [0u8; 4];
    assert!(queue.receive(&mut buf, 0));
    assert_eq!(u32::from_le_bytes(buf), 1);
}

#[test]
fn notification_round_trip() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    let receiver = Sys::task_create(noop, "receiver", 0, 32, PRIORITY_NORMAL, false).unwrap();
    let sender = Sys::task_create(noop, "sender", 0, 32, PRIORITY_HIGH, false).unwrap();
    dispatch::<K>();
    assert_eq!(Sys::current_task(), Some(sender));

    // The post raises the receiver to the sender's priority
    Sys::notify(receiver, 0xdead_beef).unwrap();
    assert_eq!(Sys::task_priority(receiver), Ok(PRIORITY_HIGH));

    // Let the receiver run (the sender stops itself); the boost is consumed
    // by its dispatch
    Sys::task_stop(sender).unwrap();
    assert_eq!(Sys::current_task(), Some(receiver));
    assert_eq!(Sys::task_priority(receiver), Ok(PRIORITY_NORMAL));

    assert_eq!(Sys::notify_take(0), 0xdead_beef);
    // The mailbox is one-slot and now empty; an immediate retry times out
    assert_eq!(Sys::notify_take(0), 0);
}

#[test]
fn isr_notification_raises_to_max() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    let task = Sys::task_create(noop, "t", 0, 32, PRIORITY_NORMAL, false).unwrap();
    Sys::notify_from_isr(task, 1).unwrap();
    assert_eq!(Sys::task_priority(task), Ok(PRIORITY_MAX));

    dispatch::<K>();
    assert_eq!(Sys::current_task(), Some(task));
    assert_eq!(Sys::task_priority(task), Ok(PRIORITY_NORMAL));
    assert_eq!(Sys::notify_take(0), 1);
}

#[test]
fn semaphore_counts_and_times_out() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    static S: Semaphore<K> = Semaphore::new(2);

    init_kernel::<K>().unwrap();
    Sys::task_create(noop, "t", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();

    assert!(S.take(0));
    assert!(S.take(0));
    // Exhausted; a zero timeout fails on the first poll
    assert!(!S.take(0));

    S.give();
    assert!(S.take(0));

    // A cooperative wait succeeds once the hook releases a permit
    set_yield_hook::<K>(Box::new(|| S.give()));
    assert!(S.cooperative_take(10));
    take_yield_hook::<K>();

    // With the hook only advancing time, the wait times out
    set_yield_hook::<K>(Box::new(|| deliver_tick::<K>()));
    assert!(!S.cooperative_take(3));
    take_yield_hook::<K>();
}

#[test]
fn stale_handles_are_rejected() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    let task = Sys::task_create(noop, "t", 0, 32, PRIORITY_NORMAL, false).unwrap();
    let timer = Sys::timer_create(|_| {}, 0, 10, true).unwrap();

    Sys::task_delete(task).unwrap();
    assert_eq!(Sys::task_stop(task), Err(BadIdError::BadId));
    assert_eq!(Sys::task_resume(task), Err(BadIdError::BadId));
    assert_eq!(Sys::task_delete(task), Err(BadIdError::BadId));

    Sys::timer_delete(timer).unwrap();
    assert_eq!(Sys::timer_stop(timer), Err(BadIdError::BadId));
    assert_eq!(Sys::timer_resume(timer), Err(BadIdError::BadId));
}

#[test]
fn stop_resume_of_a_ready_task_preserves_membership() {
    tern_port_std::use_port!(struct K);
    type Sys = System<K>;

    init_kernel::<K>().unwrap();
    let a = Sys::task_create(noop, "a", 0, 32, PRIORITY_NORMAL, false).unwrap();
    let b = Sys::task_create(noop, "b", 0, 32, PRIORITY_NORMAL, false).unwrap();
    dispatch::<K>();

    // Stop and resume a task that is Ready (not running); afterwards the
    // round-robin must still cycle through both tasks
    let ready = if Sys::current_task() == Some(a) { b } else { a };
    Sys::task_stop(ready).unwrap();
    Sys::task_resume(ready).unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..8 {
        seen.insert(Sys::current_task().unwrap());
        deliver_tick::<K>();
    }
    assert!(seen.contains(&a) && seen.contains(&b));
}
