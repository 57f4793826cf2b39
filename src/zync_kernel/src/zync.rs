//! The zync primitive
//!
//! A *zync* is a single counter-based control block subsuming mutex,
//! semaphore, and condition-variable semantics. Its observable state is a
//! [`ZyncAtom`]: a counter clamped to `[0, max]` plus a waiter flag. Every
//! operation boils down to one call: *modify the counter by `modify`, waking
//! or blocking threads as needed* ([`zync`]).
//!
//! Which classic primitive a zync behaves as is purely a matter of
//! configuration ([`ZyncCfg`]): a mutex is `atom_init = 1, max_val = 1`, a
//! semaphore is an arbitrary initial count and ceiling, and a condition
//! variable is `atom_init = 0` with waiters released by positive
//! modifications. [`condwait`] composes two zyncs to provide the classic
//! wait-with-mutex protocol.
use core::fmt;

use bitflags::bitflags;

use crate::{
    error::{BadContextError, PairInitError, ZyncError},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockGuardBorrowMut},
    timeout::Timeout,
    utils::Init,
    wait::{QueueOrder, WaitQueue, WakeUp},
    KernelTraits, Priority,
};

/// The largest value a zync atom can hold, and the largest usable clamp
/// ceiling.
pub const ZYNC_ATOM_MAX: u32 = i32::MAX as u32;

bitflags! {
    /// Behavioral options of a zync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZyncOpts: u8 {
        /// Donate the most urgent pending thread's priority to the current
        /// owner while the atom is unavailable.
        const PRIO_BOOST = 1 << 0;
        /// Let a wake-upper cede the processor after waking threads instead
        /// of continuing to run.
        const FAIR = 1 << 1;
        /// Allow reentrant acquisition by the owning thread, tracked by a
        /// recursion count.
        const RECURSIVE = 1 << 2;
    }
}

impl Init for ZyncOpts {
    const INIT: Self = Self::empty();
}

/// Configuration of a zync. Applied by [`init`] or [`set_cfg`] and read back
/// by [`cfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZyncCfg {
    /// The value the atom starts from (and returns to on [`reset`]).
    pub atom_init: u32,
    /// The clamp ceiling. `0` selects [`ZYNC_ATOM_MAX`]. Values above
    /// `ZYNC_ATOM_MAX` are truncated when the configuration is applied.
    pub max_val: u32,
    /// Behavioral options.
    pub opts: ZyncOpts,
}

impl ZyncCfg {
    /// The configuration of a mutex: one permit, ceiling one.
    pub const fn mutex() -> Self {
        Self {
            atom_init: 1,
            max_val: 1,
            opts: ZyncOpts::empty(),
        }
    }

    /// The configuration of a counting semaphore.
    pub const fn semaphore(initial: u32, max: u32) -> Self {
        Self {
            atom_init: initial,
            max_val: max,
            opts: ZyncOpts::empty(),
        }
    }

    /// The configuration of a condition variable: no permits; waiters are
    /// released by positive modifications.
    pub const fn condvar() -> Self {
        Self {
            atom_init: 0,
            max_val: 0,
            opts: ZyncOpts::empty(),
        }
    }

    /// Replace the option set.
    pub const fn with_opts(self, opts: ZyncOpts) -> Self {
        Self { opts, ..self }
    }

    /// The ceiling actually used for clamping.
    #[inline]
    fn effective_max(&self) -> u32 {
        if self.max_val == 0 {
            ZYNC_ATOM_MAX
        } else {
            self.max_val
        }
    }

    /// Truncate out-of-range fields. Called whenever a configuration is
    /// applied to a zync.
    fn sanitized(mut self) -> Self {
        if self.max_val > ZYNC_ATOM_MAX {
            self.max_val = ZYNC_ATOM_MAX;
        }
        if self.atom_init > self.effective_max() {
            self.atom_init = self.effective_max();
        }
        self
    }
}

impl Init for ZyncCfg {
    const INIT: Self = Self::semaphore(0, 0);
}

/// A snapshot of a zync atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomState {
    /// The counter value, always within `[0, effective_max]`.
    pub val: u32,
    /// `true` iff there are (or may be) threads whose demand is unmet.
    pub waiters: bool,
}

impl Init for AtomState {
    const INIT: Self = Self {
        val: 0,
        waiters: false,
    };
}

/// The atom of a zync, stored separately from the control block so that it
/// can be embedded in client-owned memory ([`ZyncPair`]).
pub struct ZyncAtom<Traits: KernelTraits> {
    state: CpuLockCell<Traits, AtomState>,
}

impl<Traits: KernelTraits> ZyncAtom<Traits> {
    pub const fn new() -> Self {
        Self {
            state: CpuLockCell::new(AtomState {
                val: 0,
                waiters: false,
            }),
        }
    }

    /// Read a snapshot of the atom.
    pub fn get(&self) -> Result<AtomState, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.state.get(&*lock))
    }
}

impl<Traits: KernelTraits> Init for ZyncAtom<Traits> {
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> Default for ZyncAtom<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for ZyncAtom<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ZyncAtom").field(&self.state).finish()
    }
}

/// *Zync control block* - everything about a zync except its atom.
pub struct Zync<Traits: KernelTraits> {
    cfg: CpuLockCell<Traits, ZyncCfg>,
    wait_queue: WaitQueue<Traits>,

    /// The thread that most recently completed an acquisition. Bookkeeping
    /// for the recursion shortcut and priority donation; not an access
    /// control mechanism.
    owner: CpuLockCell<Traits, Option<Traits::ThreadId>>,

    /// The owner's priority before any donation took place. `Some` iff a
    /// boost may be in effect.
    orig_prio: CpuLockCell<Traits, Option<Priority>>,

    /// Reentrant acquisition depth beyond the first.
    rec_count: CpuLockCell<Traits, u32>,

    /// Mirror of "`val` is nonzero" for an external readiness facility.
    pollable: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Zync<Traits> {
    pub const fn new() -> Self {
        Self {
            cfg: CpuLockCell::new(ZyncCfg::INIT),
            wait_queue: WaitQueue::new(QueueOrder::ThreadPriority),
            owner: CpuLockCell::new(None),
            orig_prio: CpuLockCell::new(None),
            rec_count: CpuLockCell::new(0),
            pollable: CpuLockCell::new(false),
        }
    }
}

impl<Traits: KernelTraits> Init for Zync<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> Default for Zync<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for Zync<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Zync")
            .field("self", &(self as *const _))
            .field("cfg", &self.cfg)
            .field("wait_queue", &self.wait_queue)
            .field("owner", &self.owner)
            .field("orig_prio", &self.orig_prio)
            .field("rec_count", &self.rec_count)
            .field("pollable", &self.pollable)
            .finish()
    }
}

impl<Traits: KernelTraits> Zync<Traits> {
    /// Read back the current configuration.
    pub fn cfg(&self) -> Result<ZyncCfg, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.cfg.get(&*lock))
    }

    /// Whether the atom was last seen in a "ready" (nonzero) state by the
    /// engine. Maintained for an external readiness facility.
    pub fn is_pollable(&self) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.pollable.get(&*lock))
    }

    /// The current reentrant acquisition depth beyond the first.
    pub fn recursion_depth(&self) -> Result<u32, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.rec_count.get(&*lock))
    }

    /// The thread that most recently completed an acquisition, if any.
    pub fn owner(&self) -> Result<Option<Traits::ThreadId>, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owner.get(&*lock))
    }
}

/// (Re-)initialize a zync with the given configuration, discarding all
/// bookkeeping. Must not be called while threads are waiting on it; use
/// [`reset`] to evict waiters first.
pub fn init<Traits: KernelTraits>(
    zync: &Zync<Traits>,
    atom: &ZyncAtom<Traits>,
    cfg: ZyncCfg,
) -> Result<(), BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    init_locked(zync, atom, cfg, lock.borrow_mut());
    Ok(())
}

fn init_locked<Traits: KernelTraits>(
    zync: &Zync<Traits>,
    atom: &ZyncAtom<Traits>,
    cfg: ZyncCfg,
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
) {
    let cfg = cfg.sanitized();
    zync.cfg.replace(&mut *lock, cfg);
    zync.owner.replace(&mut *lock, None);
    zync.orig_prio.replace(&mut *lock, None);
    zync.rec_count.replace(&mut *lock, 0);
    atom.state.replace(
        &mut *lock,
        AtomState {
            val: cfg.atom_init,
            waiters: false,
        },
    );
    zync.pollable.replace(&mut *lock, cfg.atom_init != 0);
}

/// Replace a zync's configuration without touching the atom or the waiters.
pub fn set_cfg<Traits: KernelTraits>(
    zync: &Zync<Traits>,
    cfg: ZyncCfg,
) -> Result<(), BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    zync.cfg.replace(&mut *lock, cfg.sanitized());
    Ok(())
}

/// The universal zync operation: modify the atom by `modify`, waking waiters
/// on release and blocking on unmet acquisition.
///
///  - `modify > 0` is a release of that many units. The value is clamped to
///    the configured ceiling; excess is silently lost. Up to `delta` waiters
///    are woken, where `delta` is the counter movement actually applied.
///    A release never blocks; `timeout` is ignored.
///  - `modify < 0` is an acquisition of that many units. If the demand can't
///    be met in full from the current value, the caller blocks (subject to
///    `timeout`) and retries the residual whenever it's woken.
///  - `modify == 0` is a pure read-modify-write touch (used for its side
///    effects on the `waiters` flag and poll mirror).
///
/// If `reset_atom` is set, the atom value is forced to zero as part of the
/// same transaction and the return value is the number of threads woken
/// rather than the units transferred. `reset_atom` + a large positive
/// `modify` is the broadcast idiom: wake everything, leave the value at zero.
///
/// On success, returns the units transferred (`|modify|` for a completed
/// acquisition, the applied delta for a release), or the woken count when
/// `reset_atom` is set.
///
/// A timed-out or cancelled multi-unit acquisition keeps the units it
/// already consumed; the counter value never rolls back.
pub fn zync<Traits: KernelTraits>(
    zync: &Zync<Traits>,
    atom: &ZyncAtom<Traits>,
    reset_atom: bool,
    modify: i32,
    timeout: Timeout,
) -> Result<u32, ZyncError> {
    let lock = klock::lock_cpu::<Traits>()?;
    zync_with_lock(zync, atom, reset_atom, modify, timeout, lock)
}

fn zync_with_lock<Traits: KernelTraits>(
    zync: &Zync<Traits>,
    atom: &ZyncAtom<Traits>,
    reset_atom: bool,
    modify: i32,
    timeout: Timeout,
    mut lock: CpuLockGuard<Traits>,
) -> Result<u32, ZyncError> {
    let (result, woken) = zync.zync_locked(atom, reset_atom, modify, timeout, lock.borrow_mut())?;

    if woken > 0 && zync.cfg.get(&*lock).opts.contains(ZyncOpts::FAIR) {
        unlock_cpu_and_check_preemption(lock);
    }

    Ok(result)
}

/// Reinitialize the atom to `atom_init` and evict every waiter with
/// [`ZyncError::Interrupted`]. Ownership, recursion depth, and any priority
/// donation are undone. Returns the number of threads evicted.
pub fn reset<Traits: KernelTraits>(
    zync: &Zync<Traits>,
    atom: &ZyncAtom<Traits>,
) -> Result<u32, BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cfg = zync.cfg.get(&*lock);

    // Undo any donation before forgetting who the owner was
    if let Some(orig) = zync.orig_prio.replace(&mut *lock, None) {
        if let Some(owner) = zync.owner.get(&*lock) {
            Traits::set_thread_priority(owner, orig);
        }
    }
    zync.owner.replace(&mut *lock, None);
    zync.rec_count.replace(&mut *lock, 0);

    // The stored configuration is always sanitized
    let val = cfg.atom_init;
    atom.state.replace(
        &mut *lock,
        AtomState {
            val,
            waiters: false,
        },
    );
    zync.pollable.replace(&mut *lock, val != 0);

    let woken = zync
        .wait_queue
        .wake_up_all_with(lock.borrow_mut(), Err(ZyncError::Interrupted));

    if woken > 0 && cfg.opts.contains(ZyncOpts::FAIR) {
        unlock_cpu_and_check_preemption(lock);
    }

    Ok(woken)
}

/// Atomically release `mutex` and begin waiting for one unit of `condvar`,
/// in a single CPU Lock session. The caller does not hold the mutex when
/// this returns, successfully or not; re-acquisition is its own business.
pub fn condwait<Traits: KernelTraits>(
    condvar: &Zync<Traits>,
    condvar_atom: &ZyncAtom<Traits>,
    mutex: &Zync<Traits>,
    mutex_atom: &ZyncAtom<Traits>,
    timeout: Timeout,
) -> Result<(), ZyncError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    mutex.zync_locked(mutex_atom, false, 1, Timeout::NoWait, lock.borrow_mut())?;
    condvar
        .zync_locked(condvar_atom, false, -1, timeout, lock.borrow_mut())
        .map(|_| ())
}

impl<Traits: KernelTraits> Zync<Traits> {
    /// The engine behind [`zync`]. Returns `(result, woken)` where `result`
    /// follows the [`zync`] return-value convention and `woken` is the
    /// number of threads woken up during the call.
    fn zync_locked(
        &self,
        atom: &ZyncAtom<Traits>,
        reset_atom: bool,
        modify: i32,
        timeout: Timeout,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Result<(u32, u32), ZyncError> {
        let cfg = self.cfg.get(&*lock);

        if cfg.opts.contains(ZyncOpts::RECURSIVE)
            && (modify == 1 || modify == -1)
            && self.try_recursion(lock.borrow_mut(), modify)
        {
            return Ok((1, 0));
        }

        let max = cfg.effective_max();
        let mut remaining = modify;
        let mut deadline_slot: Option<Option<Traits::Deadline>> = None;
        let mut woken_total = 0;

        loop {
            let (old, new, delta) =
                atom_transaction(atom, lock.borrow_mut(), max, remaining, reset_atom);

            if delta > 0 {
                // A release. If the atom is leaving the exhausted state, the
                // donation (if any) has served its purpose.
                if old.val == 0 {
                    self.prio_boost_reset(lock.borrow_mut());
                }
                self.owner.replace(&mut *lock, None);
            }

            self.handle_poll(lock.borrow_mut(), old, new);

            if delta > 0 {
                // A plain release deposits units for the woken threads to
                // re-contend for; a `reset_atom` release destroys the value
                // in the same transaction, so the woken threads are released
                // outright instead (broadcast-and-clear)
                let wake = if reset_atom {
                    WakeUp::Satisfied
                } else {
                    WakeUp::Retry
                };
                woken_total += self
                    .wait_queue
                    .wake_up_count(lock.borrow_mut(), delta as u32, wake);

                // Re-evaluate the flag now that the queue may have drained
                let empty = self.wait_queue.is_empty(lock.borrow_mut());
                atom.state.write(&mut *lock).waiters = !empty;
            }

            if remaining >= 0 {
                let result = if reset_atom { woken_total } else { delta as u32 };
                return Ok((result, woken_total));
            }

            // An acquisition; `delta <= 0` units were consumed just now
            remaining -= delta;
            if remaining == 0 {
                self.take_ownership(lock.borrow_mut(), &cfg);
                let result = if reset_atom {
                    woken_total
                } else {
                    modify.unsigned_abs()
                };
                return Ok((result, woken_total));
            }

            // The demand is unmet
            if timeout.is_no_wait() {
                return Err(ZyncError::Timeout);
            }

            // The deadline is computed once per call, so being woken and
            // finding the value stolen does not restart the timeout
            let deadline = *deadline_slot.get_or_insert_with(|| match timeout {
                Timeout::Ticks(ticks) => Some(Traits::deadline_after(ticks)),
                _ => None,
            });

            if cfg.opts.contains(ZyncOpts::PRIO_BOOST) {
                self.prio_boost(lock.borrow_mut());
            }

            match self.wait_queue.wait_until(lock.borrow_mut(), deadline)? {
                WakeUp::Retry => {}
                WakeUp::Satisfied => {
                    // Released by a broadcast; the demand is considered met
                    // without a unit transfer
                    return Ok((modify.unsigned_abs(), woken_total));
                }
            }
        }
    }

    /// The recursion shortcut. Returns `true` if the operation was absorbed
    /// by the recursion count and the atom must not be touched.
    fn try_recursion(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>, modify: i32) -> bool {
        if modify > 0 {
            // Only the depth is consulted here, not the caller's identity; a
            // release by a non-owner pops a recursion level
            let depth = self.rec_count.get(&*lock);
            if depth > 0 {
                self.rec_count.replace(&mut *lock, depth - 1);
                return true;
            }
            false
        } else {
            if self.owner.get(&*lock) == Some(Traits::current_thread()) {
                let depth = self.rec_count.get(&*lock);
                self.rec_count.replace(&mut *lock, depth + 1);
                return true;
            }
            false
        }
    }

    fn take_ownership(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>, cfg: &ZyncCfg) {
        let current = Traits::current_thread();
        self.owner.replace(&mut *lock, Some(current));
        if cfg.opts.contains(ZyncOpts::PRIO_BOOST) && self.orig_prio.get(&*lock).is_none() {
            self.orig_prio
                .replace(&mut *lock, Some(Traits::thread_priority(current)));
        }
    }

    /// Donate priority to the owner on behalf of the current (about to pend)
    /// thread. The donated priority is the most urgent of the owner's saved
    /// original priority, the current thread's priority, and the most urgent
    /// already-queued waiter.
    fn prio_boost(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>) {
        let Some(owner) = self.owner.get(&*lock) else {
            return;
        };
        let current = Traits::current_thread();
        if owner == current {
            return;
        }

        let saved = match self.orig_prio.get(&*lock) {
            Some(priority) => priority,
            None => {
                let priority = Traits::thread_priority(owner);
                self.orig_prio.replace(&mut *lock, Some(priority));
                priority
            }
        };

        let mut target = saved.min(Traits::thread_priority(current));
        if let Some(waiter) = self.wait_queue.min_waiter_priority(lock.borrow_mut()) {
            target = target.min(waiter);
        }
        Traits::set_thread_priority(owner, target);
    }

    /// Undo a donation on behalf of the releasing thread.
    fn prio_boost_reset(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>) {
        if let Some(orig) = self.orig_prio.replace(&mut *lock, None) {
            Traits::set_thread_priority(Traits::current_thread(), orig);
        }
    }

    /// Keep the readiness mirror in sync with zero/nonzero transitions of
    /// the atom value.
    fn handle_poll(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        old: AtomState,
        new: AtomState,
    ) {
        if (new.val != 0) != (old.val != 0) {
            self.pollable.replace(&mut *lock, new.val != 0);
        }
    }
}

/// Apply a clamped modification to an atom in one critical section,
/// returning the old state, the new state, and the signed counter movement
/// actually applied.
fn atom_transaction<Traits: KernelTraits>(
    atom: &ZyncAtom<Traits>,
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    max: u32,
    modify: i32,
    reset_atom: bool,
) -> (AtomState, AtomState, i32) {
    let state = atom.state.write(&mut *lock);
    let old = *state;
    let (val, delta) = modclamp(old.val, modify, max);
    let new = AtomState {
        val: if reset_atom { 0 } else { val },
        // An unmet acquisition leaves demand behind
        waiters: old.waiters || (modify < 0 && delta != modify),
    };
    *state = new;
    (old, new, delta)
}

/// Compute `val + modify` clamped to `[0, max]`. Returns the clamped value
/// and the movement actually applied. `val` and `max` never exceed
/// [`ZYNC_ATOM_MAX`], so the movement always fits in `i32`.
fn modclamp(val: u32, modify: i32, max: u32) -> (u32, i32) {
    let target = (val as i64 + modify as i64).clamp(0, max as i64);
    (target as u32, (target - val as i64) as i32)
}

fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(lock: CpuLockGuard<Traits>) {
    drop(lock);
    Traits::yield_cpu();
}

/// A zync with its atom embedded right next to the control block. The usual
/// shape for kernel-owned synchronization objects.
pub struct ZyncObject<Traits: KernelTraits> {
    pub zync: Zync<Traits>,
    pub atom: ZyncAtom<Traits>,
}

impl<Traits: KernelTraits> ZyncObject<Traits> {
    pub const fn new() -> Self {
        Self {
            zync: Zync::new(),
            atom: ZyncAtom::new(),
        }
    }

    pub fn init(&self, cfg: ZyncCfg) -> Result<(), BadContextError> {
        init(&self.zync, &self.atom, cfg)
    }

    pub fn zync(
        &self,
        reset_atom: bool,
        modify: i32,
        timeout: Timeout,
    ) -> Result<u32, ZyncError> {
        zync(&self.zync, &self.atom, reset_atom, modify, timeout)
    }

    pub fn reset(&self) -> Result<u32, BadContextError> {
        reset(&self.zync, &self.atom)
    }

    /// Release `mutex` and wait on `self` in one atomic step.
    pub fn condwait(&self, mutex: &ZyncObject<Traits>, timeout: Timeout) -> Result<(), ZyncError> {
        condwait(&self.zync, &self.atom, &mutex.zync, &mutex.atom, timeout)
    }

    /// The current atom value.
    pub fn value(&self) -> Result<u32, BadContextError> {
        Ok(self.atom.get()?.val)
    }
}

impl<Traits: KernelTraits> Init for ZyncObject<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> Default for ZyncObject<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for ZyncObject<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ZyncObject")
            .field("zync", &self.zync)
            .field("atom", &self.atom)
            .finish()
    }
}

/// A fixed-capacity arena of control blocks backing [`ZyncPair`]s.
pub struct ZyncPool<Traits: KernelTraits, const N: usize> {
    slots: [Zync<Traits>; N],
    taken: CpuLockCell<Traits, [bool; N]>,
}

impl<Traits: KernelTraits, const N: usize> ZyncPool<Traits, N> {
    pub const fn new() -> Self {
        Self {
            slots: [Zync::INIT; N],
            taken: CpuLockCell::new([false; N]),
        }
    }

    fn allocate(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Option<&'static Zync<Traits>> {
        let taken = self.taken.write(&mut *lock);
        let index = taken.iter().position(|taken| !*taken)?;
        taken[index] = true;
        Some(&self.slots[index])
    }
}

impl<Traits: KernelTraits, const N: usize> Init for ZyncPool<Traits, N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// A zync whose atom lives in client-owned memory while the control block is
/// allocated from a [`ZyncPool`] on first initialization.
pub struct ZyncPair<Traits: KernelTraits> {
    zync: CpuLockCell<Traits, Option<&'static Zync<Traits>>>,
    pub atom: ZyncAtom<Traits>,
}

impl<Traits: KernelTraits> ZyncPair<Traits> {
    pub const fn new() -> Self {
        Self {
            zync: CpuLockCell::new(None),
            atom: ZyncAtom::new(),
        }
    }

    /// (Re-)initialize the pair. The control block is allocated from `pool`
    /// the first time; reinitialization reuses it. Pool exhaustion leaves
    /// the pair unconstructed.
    pub fn init<const N: usize>(
        &self,
        pool: &'static ZyncPool<Traits, N>,
        cfg: ZyncCfg,
    ) -> Result<(), PairInitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let zync = match self.zync.get(&*lock) {
            Some(zync) => zync,
            None => {
                let zync = pool
                    .allocate(lock.borrow_mut())
                    .ok_or(PairInitError::NoMemory)?;
                self.zync.replace(&mut *lock, Some(zync));
                zync
            }
        };
        init_locked(zync, &self.atom, cfg, lock.borrow_mut());
        Ok(())
    }

    pub fn zync(
        &self,
        reset_atom: bool,
        modify: i32,
        timeout: Timeout,
    ) -> Result<u32, ZyncError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let zync = self.zync.get(&*lock).ok_or(ZyncError::NoAccess)?;
        zync_with_lock(zync, &self.atom, reset_atom, modify, timeout, lock)
    }

    /// The current atom value.
    pub fn value(&self) -> Result<u32, BadContextError> {
        Ok(self.atom.get()?.val)
    }
}

impl<Traits: KernelTraits> Init for ZyncPair<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> Default for ZyncPair<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for ZyncPair<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ZyncPair")
            .field("zync", &self.zync.debug_fmt_with_ref(|z, f| z.fmt(f)))
            .field("atom", &self.atom)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn modclamp_stays_in_range(val: u32, modify: i32, max: u32) -> bool {
        let max = max % (ZYNC_ATOM_MAX + 1);
        let val = if max == 0 { 0 } else { val % (max + 1) };
        let (new, delta) = modclamp(val, modify, max);
        new <= max && i64::from(delta) == i64::from(new) - i64::from(val)
    }

    #[quickcheck]
    fn modclamp_saturates_at_ceiling(val: u32, modify: i32, max: u32) -> bool {
        let max = max % (ZYNC_ATOM_MAX + 1);
        let val = if max == 0 { 0 } else { val % (max + 1) };
        let (new, _) = modclamp(val, modify, max);
        let unclamped = i64::from(val) + i64::from(modify);
        if unclamped > i64::from(max) {
            new == max
        } else if unclamped < 0 {
            new == 0
        } else {
            i64::from(new) == unclamped
        }
    }

    #[test]
    fn modclamp_movement_sign() {
        assert_eq!(modclamp(3, 10, 5), (5, 2));
        assert_eq!(modclamp(3, -10, 5), (0, -3));
        assert_eq!(modclamp(3, 0, 5), (3, 0));
        assert_eq!(modclamp(0, i32::MAX, ZYNC_ATOM_MAX), (ZYNC_ATOM_MAX, i32::MAX));
    }

    #[test]
    fn cfg_sanitization() {
        let cfg = ZyncCfg {
            atom_init: u32::MAX,
            max_val: u32::MAX,
            opts: ZyncOpts::empty(),
        }
        .sanitized();
        assert_eq!(cfg.max_val, ZYNC_ATOM_MAX);
        assert_eq!(cfg.atom_init, ZYNC_ATOM_MAX);

        let cfg = ZyncCfg::semaphore(10, 5).sanitized();
        assert_eq!(cfg.atom_init, 5);

        assert_eq!(ZyncCfg::condvar().sanitized().effective_max(), ZYNC_ATOM_MAX);
        assert_eq!(ZyncCfg::mutex().effective_max(), 1);
    }
}
