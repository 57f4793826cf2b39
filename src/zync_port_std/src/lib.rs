//! Simulator port for the zync kernel, based on [`std::thread`].
//!
//! The port models the kernel's execution environment on a hosted platform:
//!
//!  - The CPU Lock is a global spinlock.
//!  - Threads are `std` threads registered in a global table that carries a
//!    bookkeeping-only priority (no actual preemption takes place; priority
//!    changes are observable through [`StdPort::priority_of`], which is what
//!    the priority-donation machinery needs).
//!  - `pend_current`/`wake_thread` are realized with a per-thread parker.
//!  - The cycle counter is a plain atomic that tests advance explicitly
//!    ([`StdPort::set_cycle_count`]), making the usage accounting exactly
//!    reproducible.
//!
//! There is exactly one simulated CPU.
#![deny(unsafe_op_in_unsafe_fn)]

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use slab::Slab;
use spin::Mutex as SpinMutex;

use zync_kernel::usage::UsageState;
use zync_kernel::{KernelCfg, PendStatus, PortThreading, PortTiming, Priority, UTicks};

mod threading;

/// The duration of one kernel tick in the simulation.
pub const TICK: Duration = Duration::from_millis(1);

/// Identifies a thread registered with [`StdPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

struct ThreadRec {
    priority: Priority,
    idle: bool,
    parker: Arc<threading::Parker>,
}

static CPU_LOCK: AtomicBool = AtomicBool::new(false);
static CYCLE_COUNT: AtomicU64 = AtomicU64::new(0);
static THREADS: Lazy<SpinMutex<Slab<ThreadRec>>> = Lazy::new(|| SpinMutex::new(Slab::new()));
static USAGE_STATE: UsageState<StdPort> = UsageState::new();

std::thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = Cell::new(None);
}

/// The system type of the simulator port.
pub enum StdPort {}

impl StdPort {
    /// Register a thread with the port without binding it to an OS thread.
    /// Useful for bookkeeping-only subjects such as a simulated idle
    /// thread.
    pub fn register_thread(priority: Priority, idle: bool) -> ThreadId {
        let id = ThreadId(THREADS.lock().insert(ThreadRec {
            priority,
            idle,
            parker: Arc::new(threading::Parker::new()),
        }));
        log::trace!("register_thread({priority}, idle = {idle}) = {id:?}");
        id
    }

    /// Bind a previously registered identity to the calling OS thread.
    pub fn adopt_thread(id: ThreadId) {
        CURRENT.with(|current| current.set(Some(id)));
    }

    /// Register the calling OS thread with the port.
    pub fn register_current(priority: Priority) -> ThreadId {
        let id = Self::register_thread(priority, false);
        Self::adopt_thread(id);
        id
    }

    /// Spawn an OS thread registered with the port.
    pub fn spawn(
        priority: Priority,
        f: impl FnOnce() + Send + 'static,
    ) -> (ThreadId, JoinHandle<()>) {
        let id = Self::register_thread(priority, false);
        let handle = std::thread::spawn(move || {
            Self::adopt_thread(id);
            log::trace!("thread {id:?} started");
            f();
        });
        (id, handle)
    }

    /// The bookkeeping priority of a registered thread.
    pub fn priority_of(thread: ThreadId) -> Priority {
        THREADS
            .lock()
            .get(thread.0)
            .expect("thread is not registered with the port")
            .priority
    }

    /// Set the simulated cycle counter.
    pub fn set_cycle_count(value: u64) {
        CYCLE_COUNT.store(value, Ordering::Relaxed);
    }

    /// Advance the simulated cycle counter.
    pub fn advance_cycle_count(cycles: u64) {
        CYCLE_COUNT.fetch_add(cycles, Ordering::Relaxed);
    }

    fn parker_of(thread: ThreadId) -> Arc<threading::Parker> {
        THREADS
            .lock()
            .get(thread.0)
            .expect("thread is not registered with the port")
            .parker
            .clone()
    }
}

unsafe impl PortThreading for StdPort {
    type ThreadId = ThreadId;
    type Deadline = Instant;

    const NUM_CPUS: usize = 1;

    unsafe fn try_enter_cpu_lock() -> bool {
        CPU_LOCK
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK.store(false, Ordering::Release);
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.load(Ordering::Acquire)
    }

    fn current_thread() -> ThreadId {
        CURRENT
            .with(|current| current.get())
            .expect("the calling thread is not registered with the port")
    }

    fn current_cpu() -> usize {
        0
    }

    fn is_idle_thread(thread: ThreadId) -> bool {
        THREADS
            .lock()
            .get(thread.0)
            .expect("thread is not registered with the port")
            .idle
    }

    fn thread_priority(thread: ThreadId) -> Priority {
        Self::priority_of(thread)
    }

    fn set_thread_priority(thread: ThreadId, priority: Priority) {
        log::trace!("set_thread_priority({thread:?}, {priority})");
        THREADS
            .lock()
            .get_mut(thread.0)
            .expect("thread is not registered with the port")
            .priority = priority;
    }

    fn deadline_after(ticks: UTicks) -> Instant {
        Instant::now() + TICK * ticks
    }

    unsafe fn pend_current(deadline: Option<Instant>) -> PendStatus {
        let me = Self::current_thread();
        let parker = Self::parker_of(me);
        log::trace!("pend_current: {me:?} suspending (deadline = {deadline:?})");

        // Safety: our caller holds the CPU Lock; we release it exactly for
        // the duration of the suspension, per the trait contract
        unsafe { Self::leave_cpu_lock() };
        let status = parker.park(deadline);
        while !unsafe { Self::try_enter_cpu_lock() } {
            std::thread::yield_now();
        }

        log::trace!("pend_current: {me:?} resumed ({status:?})");
        status
    }

    unsafe fn wake_thread(thread: ThreadId) {
        log::trace!("wake_thread({thread:?})");
        Self::parker_of(thread).unpark();
    }

    fn yield_cpu() {
        std::thread::yield_now();
    }
}

unsafe impl PortTiming for StdPort {
    fn cycle_count() -> u64 {
        CYCLE_COUNT.load(Ordering::Relaxed)
    }
}

unsafe impl KernelCfg for StdPort {
    fn usage_state() -> &'static UsageState<Self> {
        &USAGE_STATE
    }
}
