//! Behavioral tests for the zync primitive, driven through the simulator
//! port with real OS threads.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use zync_kernel::error::{PairInitError, ZyncError};
use zync_kernel::zync::{ZyncCfg, ZyncObject, ZyncOpts, ZyncPair, ZyncPool};
use zync_kernel::Timeout;
use zync_port_std::StdPort;

type Obj = ZyncObject<StdPort>;

/// Margin generous enough for a woken thread to get scheduled and run.
const SETTLE: Duration = Duration::from_millis(200);

fn init_test() {
    let _ = env_logger::builder().is_test(true).try_init();
    StdPort::register_current(10);
}

fn settle() {
    std::thread::sleep(SETTLE);
}

#[test]
fn clamping_discards_excess_release() {
    init_test();
    let sem = Obj::new();
    sem.init(ZyncCfg::semaphore(0, 5)).unwrap();

    // Only 5 of the 10 units fit; the excess is lost, not queued
    assert_eq!(sem.zync(false, 10, Timeout::NoWait).unwrap(), 5);
    assert_eq!(sem.value().unwrap(), 5);

    assert_eq!(sem.zync(false, 3, Timeout::NoWait).unwrap(), 0);
    assert_eq!(sem.value().unwrap(), 5);

    // Draining below zero clamps the other way
    assert_eq!(sem.zync(false, -5, Timeout::NoWait).unwrap(), 5);
    assert_eq!(sem.value().unwrap(), 0);
}

#[test]
fn uncontended_acquire_release_conserves_value() {
    init_test();
    let lock = Obj::new();
    lock.init(ZyncCfg::mutex()).unwrap();

    for _ in 0..1000 {
        assert_eq!(lock.zync(false, -1, Timeout::NoWait).unwrap(), 1);
        assert_eq!(lock.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    }

    assert_eq!(lock.value().unwrap(), 1);
    assert_eq!(lock.zync.recursion_depth().unwrap(), 0);
}

#[test]
fn recursive_reentrancy() {
    init_test();
    let lock = Arc::new(Obj::new());
    lock.init(ZyncCfg::mutex().with_opts(ZyncOpts::RECURSIVE))
        .unwrap();

    // First acquisition goes through the atom; the next three are absorbed
    // by the recursion count
    assert_eq!(lock.zync(false, -1, Timeout::NoWait).unwrap(), 1);
    for _ in 0..3 {
        assert_eq!(lock.zync(false, -1, Timeout::NoWait).unwrap(), 1);
    }
    assert_eq!(lock.zync.recursion_depth().unwrap(), 3);
    assert_eq!(lock.value().unwrap(), 0);

    // Unavailable to anyone else at any depth
    let contender = lock.clone();
    let (_, handle) = StdPort::spawn(5, move || {
        assert_eq!(
            contender.zync(false, -1, Timeout::NoWait),
            Err(ZyncError::Timeout)
        );
    });
    handle.join().unwrap();

    // Three releases only unwind the recursion
    for _ in 0..3 {
        assert_eq!(lock.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    }
    assert_eq!(lock.zync.recursion_depth().unwrap(), 0);
    assert_eq!(lock.value().unwrap(), 0);

    // The final release frees the lock
    assert_eq!(lock.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    assert_eq!(lock.value().unwrap(), 1);
}

/// The release half of the recursion shortcut only consults the depth, not
/// the caller's identity. This pins down the current, deliberately
/// permissive behavior.
#[test]
fn recursive_release_by_non_owner_is_permitted() {
    init_test();
    let lock = Arc::new(Obj::new());
    lock.init(ZyncCfg::mutex().with_opts(ZyncOpts::RECURSIVE))
        .unwrap();

    lock.zync(false, -1, Timeout::NoWait).unwrap();
    lock.zync(false, -1, Timeout::NoWait).unwrap();
    assert_eq!(lock.zync.recursion_depth().unwrap(), 1);
    let owner = lock.zync.owner().unwrap();
    assert!(owner.is_some());

    let interloper = lock.clone();
    let (_, handle) = StdPort::spawn(5, move || {
        // Pops a recursion level despite not owning the lock
        assert_eq!(interloper.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    });
    handle.join().unwrap();

    assert_eq!(lock.zync.recursion_depth().unwrap(), 0);
    assert_eq!(lock.value().unwrap(), 0);
    assert_eq!(lock.zync.owner().unwrap(), owner);
}

#[test]
fn priority_donation_tracks_most_urgent_waiter() {
    init_test();
    let lock = Arc::new(Obj::new());
    lock.init(ZyncCfg::mutex().with_opts(ZyncOpts::PRIO_BOOST))
        .unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = lock.clone();
    let (holder_id, holder_handle) = StdPort::spawn(5, move || {
        holder.zync(false, -1, Timeout::Forever).unwrap();
        locked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        holder.zync(false, 1, Timeout::NoWait).unwrap();
    });
    locked_rx.recv().unwrap();
    assert_eq!(StdPort::priority_of(holder_id), 5);

    // A more urgent waiter donates its priority to the holder
    let urgent = lock.clone();
    let (_, urgent_handle) = StdPort::spawn(3, move || {
        urgent.zync(false, -1, Timeout::Forever).unwrap();
        urgent.zync(false, 1, Timeout::NoWait).unwrap();
    });
    settle();
    assert_eq!(StdPort::priority_of(holder_id), 3);

    // A less urgent waiter leaves the donation alone
    let casual = lock.clone();
    let (_, casual_handle) = StdPort::spawn(7, move || {
        casual.zync(false, -1, Timeout::Forever).unwrap();
        casual.zync(false, 1, Timeout::NoWait).unwrap();
    });
    settle();
    assert_eq!(StdPort::priority_of(holder_id), 3);

    // Releasing undoes the donation
    release_tx.send(()).unwrap();
    holder_handle.join().unwrap();
    assert_eq!(StdPort::priority_of(holder_id), 5);

    urgent_handle.join().unwrap();
    casual_handle.join().unwrap();
    assert_eq!(lock.value().unwrap(), 1);
}

#[test]
fn wake_count_matches_release_magnitude() {
    init_test();
    let sem = Arc::new(Obj::new());
    sem.init(ZyncCfg::semaphore(0, 10)).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..3 {
        let sem = sem.clone();
        let done = done.clone();
        let (_, handle) = StdPort::spawn(5, move || {
            sem.zync(false, -1, Timeout::Forever).unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        });
        handles.push(handle);
    }
    settle();
    assert!(sem.atom.get().unwrap().waiters);

    // Two units satisfy exactly two of the three waiters
    assert_eq!(sem.zync(false, 2, Timeout::NoWait).unwrap(), 2);
    settle();
    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert!(sem.atom.get().unwrap().waiters);

    assert_eq!(sem.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert!(!sem.atom.get().unwrap().waiters);
    assert_eq!(sem.value().unwrap(), 0);
}

#[test]
fn broadcast_wakes_all_waiters_and_clears_value() {
    init_test();
    let condvar = Arc::new(Obj::new());
    condvar.init(ZyncCfg::condvar()).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let condvar = condvar.clone();
        let done = done.clone();
        let (_, handle) = StdPort::spawn(5, move || {
            condvar.zync(false, -1, Timeout::Forever).unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        });
        handles.push(handle);
    }
    settle();

    // Returns the woken count, not the (huge) unit count
    assert_eq!(condvar.zync(true, i32::MAX, Timeout::NoWait).unwrap(), 4);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert_eq!(condvar.value().unwrap(), 0);
    assert!(!condvar.atom.get().unwrap().waiters);
}

/// The woken-count return convention is keyed solely off the `reset_atom`
/// flag; an ordinary large negative modification still follows the
/// units-transferred convention.
#[test]
fn broadcast_return_convention_requires_reset_flag() {
    init_test();
    let sem = Obj::new();
    sem.init(ZyncCfg::semaphore(3, 5)).unwrap();

    assert_eq!(sem.zync(false, -2, Timeout::NoWait).unwrap(), 2);
    assert_eq!(sem.value().unwrap(), 1);

    // With the flag, an equivalent release reports zero threads woken
    assert_eq!(sem.zync(true, 2, Timeout::NoWait).unwrap(), 0);
    assert_eq!(sem.value().unwrap(), 0);
}

#[test]
fn timeout_expires_for_unmet_demand() {
    init_test();
    let lock = Obj::new();
    lock.init(ZyncCfg::mutex()).unwrap();
    lock.zync(false, -1, Timeout::NoWait).unwrap();

    let start = Instant::now();
    assert_eq!(
        lock.zync(false, -1, Timeout::Ticks(50)),
        Err(ZyncError::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(lock.value().unwrap(), 0);
}

#[test]
fn zero_timeout_polls_without_blocking() {
    init_test();
    let lock = Obj::new();
    lock.init(ZyncCfg::mutex()).unwrap();
    lock.zync(false, -1, Timeout::NoWait).unwrap();

    let start = Instant::now();
    assert_eq!(
        lock.zync(false, -1, Timeout::NoWait),
        Err(ZyncError::Timeout)
    );
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn partial_credit_is_kept_on_timeout() {
    init_test();
    let sem = Obj::new();
    sem.init(ZyncCfg::semaphore(2, 5)).unwrap();

    // Two of the three units are granted before the wait; the timeout does
    // not roll them back
    assert_eq!(
        sem.zync(false, -3, Timeout::Ticks(50)),
        Err(ZyncError::Timeout)
    );
    assert_eq!(sem.value().unwrap(), 0);
}

#[test]
fn reset_evicts_waiters_with_interrupted() {
    init_test();
    let sem = Arc::new(Obj::new());
    sem.init(ZyncCfg::semaphore(0, 5)).unwrap();

    let waiter = sem.clone();
    let (_, handle) = StdPort::spawn(5, move || {
        assert_eq!(
            waiter.zync(false, -1, Timeout::Forever),
            Err(ZyncError::Interrupted)
        );
    });
    settle();

    assert_eq!(sem.reset().unwrap(), 1);
    handle.join().unwrap();
    assert_eq!(sem.value().unwrap(), 0);
    assert!(!sem.atom.get().unwrap().waiters);
    assert_eq!(sem.zync.recursion_depth().unwrap(), 0);
    assert_eq!(sem.zync.owner().unwrap(), None);
}

#[test]
fn condwait_releases_mutex_and_waits() {
    init_test();
    let mutex = Arc::new(Obj::new());
    mutex.init(ZyncCfg::mutex()).unwrap();
    let condvar = Arc::new(Obj::new());
    condvar.init(ZyncCfg::condvar()).unwrap();

    let (waiting_tx, waiting_rx) = mpsc::channel();
    let waiter_mutex = mutex.clone();
    let waiter_condvar = condvar.clone();
    let (_, handle) = StdPort::spawn(5, move || {
        waiter_mutex.zync(false, -1, Timeout::NoWait).unwrap();
        waiting_tx.send(()).unwrap();
        waiter_condvar
            .condwait(&waiter_mutex, Timeout::Forever)
            .unwrap();
    });

    waiting_rx.recv().unwrap();
    settle();
    // The mutex was handed back inside condwait
    assert_eq!(mutex.value().unwrap(), 1);
    assert!(condvar.atom.get().unwrap().waiters);

    // Signal one unit; the waiter consumes it
    assert_eq!(condvar.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    handle.join().unwrap();
    assert_eq!(condvar.value().unwrap(), 0);
    assert_eq!(mutex.value().unwrap(), 1);
}

#[test]
fn pollable_mirror_tracks_zero_crossings() {
    init_test();
    let sem = Obj::new();
    sem.init(ZyncCfg::semaphore(0, 5)).unwrap();
    assert!(!sem.zync.is_pollable().unwrap());

    sem.zync(false, 2, Timeout::NoWait).unwrap();
    assert!(sem.zync.is_pollable().unwrap());

    sem.zync(false, -1, Timeout::NoWait).unwrap();
    assert!(sem.zync.is_pollable().unwrap());

    sem.zync(false, -1, Timeout::NoWait).unwrap();
    assert!(!sem.zync.is_pollable().unwrap());
}

#[test]
fn pair_pool_exhaustion_is_no_memory() {
    init_test();
    static POOL: ZyncPool<StdPort, 2> = ZyncPool::new();

    let first = ZyncPair::<StdPort>::new();
    let second = ZyncPair::<StdPort>::new();
    let third = ZyncPair::<StdPort>::new();

    first.init(&POOL, ZyncCfg::semaphore(1, 5)).unwrap();
    second.init(&POOL, ZyncCfg::mutex()).unwrap();
    assert_eq!(
        third.init(&POOL, ZyncCfg::mutex()),
        Err(PairInitError::NoMemory)
    );

    // An uninitialized pair has no control block to operate on
    assert_eq!(
        third.zync(false, 1, Timeout::NoWait),
        Err(ZyncError::NoAccess)
    );

    // Reinitialization reuses the slot instead of allocating another
    first.init(&POOL, ZyncCfg::semaphore(3, 5)).unwrap();
    assert_eq!(first.value().unwrap(), 3);
    assert_eq!(first.zync(false, -3, Timeout::NoWait).unwrap(), 3);
    assert_eq!(first.value().unwrap(), 0);
}

#[test]
fn mutex_handoff_between_threads() {
    init_test();
    let lock = Arc::new(Obj::new());
    lock.init(ZyncCfg::mutex().with_opts(ZyncOpts::FAIR)).unwrap();

    lock.zync(false, -1, Timeout::NoWait).unwrap();

    let contender = lock.clone();
    let (_, handle) = StdPort::spawn(5, move || {
        // Blocks until the holder releases, then re-decrements to zero
        assert_eq!(contender.zync(false, -1, Timeout::Ticks(1000)).unwrap(), 1);
        contender.zync(false, 1, Timeout::NoWait).unwrap();
    });
    settle();

    assert_eq!(lock.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    handle.join().unwrap();
    assert_eq!(lock.value().unwrap(), 1);
}

#[test]
fn producers_and_consumer_conserve_units() {
    init_test();
    let sem = Obj::new();
    sem.init(ZyncCfg::semaphore(0, 5)).unwrap();

    for _ in 0..5 {
        assert_eq!(sem.zync(false, 1, Timeout::NoWait).unwrap(), 1);
    }
    assert_eq!(sem.value().unwrap(), 5);

    for _ in 0..5 {
        assert_eq!(sem.zync(false, -1, Timeout::NoWait).unwrap(), 1);
    }
    assert_eq!(
        sem.zync(false, -1, Timeout::NoWait),
        Err(ZyncError::Timeout)
    );
    assert_eq!(sem.value().unwrap(), 0);
}
