//! Wait queues for threads blocked on a zync.
use alloc::collections::VecDeque;
use core::{fmt, ptr::NonNull};

use crate::{
    error::ZyncError,
    klock::{CpuLockCell, CpuLockGuardBorrowMut},
    utils::Init,
    KernelTraits, PendStatus, Priority,
};

/// How a wake-upper completed a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeUp {
    /// Units were deposited into the atom; the waiter must retry its
    /// residual demand and may find the units already taken.
    Retry,
    /// The waiter is released outright, without a unit transfer (the
    /// broadcast-and-clear path).
    Satisfied,
}

/// A wait object describing *which thread* is waiting on *which queue*.
///
/// The lifetime of a `Wait` is coupled to that of the wait operation itself:
/// it lives on the waiting thread's stack for the duration of
/// [`WaitQueue::wait_until`], and the queue only ever holds [`WaitRef`]s to
/// entries whose wait operation is still in progress. Whoever removes an
/// entry from the queue must complete the wait before relinquishing the CPU
/// Lock (see [`complete_wait`]), at which point the `WaitRef` must not be
/// dereferenced anymore.
struct Wait<Traits: KernelTraits> {
    /// The waiting thread.
    thread: Traits::ThreadId,

    /// The result of the wait operation. `None` while the wait is still in
    /// progress.
    result: CpuLockCell<Traits, Option<Result<WakeUp, ZyncError>>>,
}

/// A reference to a [`Wait`] registered in a [`WaitQueue`].
struct WaitRef<Traits: KernelTraits>(NonNull<Wait<Traits>>);

// Safety: `Wait` is only accessed under the CPU Lock, and the pointee is kept
// alive by the waiting thread for as long as it's registered in a queue
unsafe impl<Traits: KernelTraits> Send for WaitRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for WaitRef<Traits> {}

impl<Traits: KernelTraits> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for WaitRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: KernelTraits> Eq for WaitRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    #[allow(dead_code)]
    Fifo,
    /// The wait queue is processed in a thread priority order. Threads with
    /// a numerically lower (more urgent) priority execute first, and ones
    /// with an identical priority follow a FIFO order.
    ThreadPriority,
}

/// A queue of threads waiting to have their demand met.
///
/// The queue decides *in which order* waiters leave; *how many* leave on a
/// given state transition is its owner's business.
pub(crate) struct WaitQueue<Traits: KernelTraits> {
    waits: CpuLockCell<Traits, VecDeque<WaitRef<Traits>>>,
    order: QueueOrder,
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(VecDeque::new()),
            order,
        }
    }
}

impl<Traits: KernelTraits> Init for WaitQueue<Traits> {
    const INIT: Self = Self::new(QueueOrder::ThreadPriority);
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("waits", &self.waits)
            .field("order", &self.order)
            .finish()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub(crate) fn is_empty(&self, lock: CpuLockGuardBorrowMut<'_, Traits>) -> bool {
        self.waits.read(&*lock).is_empty()
    }

    /// The priority of the most urgent waiter, if any.
    pub(crate) fn min_waiter_priority(
        &self,
        lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Option<Priority> {
        self.waits
            .read(&*lock)
            .iter()
            // Safety: queued entries are alive (see `Wait`)
            .map(|wait_ref| Traits::thread_priority(unsafe { wait_ref.0.as_ref() }.thread))
            .min()
    }

    /// Insert the current thread into the queue and wait until its wait
    /// operation is completed by a wake-upper, the deadline passes, or the
    /// wait is cancelled.
    ///
    /// The CPU Lock is released while the thread is actually suspended
    /// (inside [`PortThreading::pend_current`]) and re-acquired before this
    /// method returns.
    ///
    /// [`PortThreading::pend_current`]: crate::PortThreading::pend_current
    pub(crate) fn wait_until(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        deadline: Option<Traits::Deadline>,
    ) -> Result<WakeUp, ZyncError> {
        let wait = Wait {
            thread: Traits::current_thread(),
            result: CpuLockCell::new(None),
        };
        let wait_ref = WaitRef(NonNull::from(&wait));

        self.insert(lock.borrow_mut(), wait_ref);

        loop {
            // Safety: The CPU Lock is active, and `pend_current` releases it
            // only for the duration of the suspension. Our guard is dormant
            // in the meantime; the token it lends out is not used until
            // `pend_current` returns with the lock re-acquired.
            let status = unsafe { Traits::pend_current(deadline) };

            if let Some(result) = wait.result.get(&*lock) {
                // A wake-upper already dequeued us and completed the wait.
                return result;
            }

            if status == PendStatus::TimedOut {
                self.remove(lock.borrow_mut(), wait_ref);
                return Err(ZyncError::Timeout);
            }

            // Spurious wakeup. The wait is still in progress; pend again.
        }
    }

    /// Wake up one waiter, if any, completing its wait with `wake`. Return
    /// `true` if it woke up a thread.
    pub(crate) fn wake_up_one(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        wake: WakeUp,
    ) -> bool {
        let wait_ref = self.waits.write(&mut *lock).pop_front();

        if let Some(wait_ref) = wait_ref {
            // Safety: queued entries are alive (see `Wait`)
            let wait = unsafe { wait_ref.0.as_ref() };
            complete_wait(lock, wait, Ok(wake));
            true
        } else {
            false
        }
    }

    /// Wake up up to `limit` waiters. Return the number of threads woken up.
    pub(crate) fn wake_up_count(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        limit: u32,
        wake: WakeUp,
    ) -> u32 {
        let mut woken = 0;
        while woken < limit && self.wake_up_one(lock.borrow_mut(), wake) {
            woken += 1;
        }
        woken
    }

    /// Wake up all waiters with the given wait result. Return the number of
    /// threads woken up.
    pub(crate) fn wake_up_all_with(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        result: Result<WakeUp, ZyncError>,
    ) -> u32 {
        let mut woken = 0;
        while let Some(wait_ref) = self.waits.write(&mut *lock).pop_front() {
            // Safety: queued entries are alive (see `Wait`)
            let wait = unsafe { wait_ref.0.as_ref() };
            complete_wait(lock.borrow_mut(), wait, result);
            woken += 1;
        }
        woken
    }

    fn insert(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        let insert_at = match self.order {
            QueueOrder::Fifo => None,
            QueueOrder::ThreadPriority => {
                // Safety: queued entries are alive (see `Wait`)
                let priority =
                    Traits::thread_priority(unsafe { wait_ref.0.as_ref() }.thread);
                self.waits.read(&*lock).iter().position(|other| {
                    // Safety: ditto
                    Traits::thread_priority(unsafe { other.0.as_ref() }.thread) > priority
                })
            }
        };

        let waits = self.waits.write(&mut *lock);
        match insert_at {
            Some(i) => waits.insert(i, wait_ref),
            None => waits.push_back(wait_ref),
        }
    }

    fn remove(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        self.waits.write(&mut *lock).retain(|r| *r != wait_ref);
    }
}

/// Complete a wait operation whose entry has already been removed from its
/// queue, storing `result` for the waiter to find and waking it up.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    wait: &Wait<Traits>,
    result: Result<WakeUp, ZyncError>,
) {
    wait.result.replace(&mut *lock, Some(result));

    // Safety: `wait.thread` was obtained from `current_thread` when the wait
    // was registered, so it denotes a live thread known to the port
    unsafe { Traits::wake_thread(wait.thread) };
}
