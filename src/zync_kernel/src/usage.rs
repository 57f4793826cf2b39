//! Thread and CPU cycle-usage accounting
//!
//! The scheduler (through the port) brackets every scheduling slice with
//! [`usage_start`] and [`usage_stop`]. This module folds the elapsed cycle
//! counts into per-thread and per-CPU records and answers queries about
//! them, including for a slice that is still open: queries fold the
//! in-flight cycles in and re-stamp the baseline without closing the window.
//!
//! All records live under the CPU Lock. Timestamps come from the port's
//! monotonic cycle counter ([`PortTiming::cycle_count`]); a stored baseline
//! of `0` means "not measuring", so a genuine zero timestamp is stamped
//! as `1`.
//!
//! [`PortTiming::cycle_count`]: crate::PortTiming::cycle_count
use alloc::collections::BTreeMap;
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::UsageError,
    klock::{self, CpuLockCell, CpuLockGuardBorrowMut},
    utils::Init,
    KernelTraits, PortThreading,
};

/// The largest number of CPUs the accounting tables can describe. Ports with
/// `NUM_CPUS` above this are not supported by this module.
pub const MAX_CPUS: usize = 8;

/// Accumulated statistics of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadUsage {
    /// Cycles attributed to the thread since tracking was enabled.
    pub total: u64,
    /// Cycles attributed to the current (or last) scheduling window.
    pub current: u64,
    /// The longest single window observed.
    pub longest: u64,
    /// The number of windows opened since tracking was enabled.
    pub num_windows: u32,
    /// Whether cycles are folded into this record at all.
    pub track_usage: bool,
}

impl Init for ThreadUsage {
    const INIT: Self = Self {
        total: 0,
        current: 0,
        longest: 0,
        num_windows: 0,
        track_usage: false,
    };
}

/// Accumulated statistics of one CPU. `Id` is the port's thread identifier
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuUsage<Id> {
    /// Baseline timestamp of the open slice. `0` means no slice is open.
    pub usage0: u64,
    /// Non-idle cycles accumulated while CPU tracking was enabled.
    pub total: u64,
    /// Non-idle cycles of the current (or last) busy slice.
    pub current: u64,
    /// The longest single busy slice observed.
    pub longest: u64,
    /// The number of closed busy slices.
    pub num_windows: u32,
    /// Cycles spent in the idle thread.
    pub idle_total: u64,
    /// Whether cycles are folded into this record at all.
    pub track_usage: bool,
    /// The thread the open slice belongs to.
    pub current_thread: Option<Id>,
}

impl<Id> Init for CpuUsage<Id> {
    const INIT: Self = Self {
        usage0: 0,
        total: 0,
        current: 0,
        longest: 0,
        num_windows: 0,
        idle_total: 0,
        track_usage: false,
        current_thread: None,
    };
}

/// The accounting state. Instantiated exactly once by the port and exposed
/// through [`KernelCfg::usage_state`].
///
/// [`KernelCfg::usage_state`]: crate::KernelCfg::usage_state
pub struct UsageState<Traits: PortThreading> {
    cpus: CpuLockCell<Traits, ArrayVec<CpuUsage<Traits::ThreadId>, MAX_CPUS>>,
    threads: CpuLockCell<Traits, BTreeMap<Traits::ThreadId, ThreadUsage>>,
}

impl<Traits: PortThreading> UsageState<Traits> {
    pub const fn new() -> Self {
        Self {
            cpus: CpuLockCell::new(ArrayVec::new_const()),
            threads: CpuLockCell::new(BTreeMap::new()),
        }
    }
}

impl<Traits: PortThreading> Init for UsageState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> Default for UsageState<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for UsageState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsageState")
            .field("cpus", &self.cpus)
            .field("threads", &self.threads)
            .finish()
    }
}

/// The answer to a per-thread query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStats {
    pub total_cycles: u64,
    pub current_cycles: u64,
    pub peak_cycles: u64,
    /// `total / num_windows`, or zero before the first window.
    pub average_cycles: u64,
}

/// The answer to a per-CPU query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStats {
    pub total_cycles: u64,
    pub current_cycles: u64,
    pub peak_cycles: u64,
    /// `total / num_windows` over closed busy slices.
    pub average_cycles: u64,
    /// Cycles spent in the idle thread, excluded from `total_cycles`.
    pub idle_cycles: u64,
    /// Busy and idle cycles combined.
    pub execution_cycles: u64,
}

/// Stamp a timestamp so that it's distinguishable from the "not measuring"
/// sentinel.
#[inline]
fn nonzero_stamp(t: u64) -> u64 {
    t.max(1)
}

/// Open a scheduling slice for `thread` on the current CPU.
///
/// Called by the scheduler on every context switch-in. The baseline is
/// re-stamped unconditionally; if `thread`'s record is tracked, a fresh
/// window is opened for it.
pub fn usage_start<Traits: KernelTraits>(thread: Traits::ThreadId) -> Result<(), UsageError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::usage_state();
    let cpu = Traits::current_cpu();
    debug_assert!(cpu < Traits::NUM_CPUS && cpu < MAX_CPUS);
    let now = nonzero_stamp(Traits::cycle_count());

    {
        let cpus = state.cpus.write(&mut *lock);
        grow_to(cpus, cpu + 1);
        let rec = &mut cpus[cpu];
        rec.usage0 = now;
        rec.current_thread = Some(thread);
    }

    {
        let threads = state.threads.write(&mut *lock);
        if let Some(rec) = threads.get_mut(&thread) {
            if rec.track_usage {
                rec.num_windows += 1;
                rec.current = 0;
            }
        }
    }

    Ok(())
}

/// Close the current CPU's open slice, folding the elapsed cycles into the
/// outgoing thread's record and the CPU aggregates.
///
/// Called by the scheduler on every context switch-out.
pub fn usage_stop<Traits: KernelTraits>() -> Result<(), UsageError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    fold_cpu::<Traits>(lock.borrow_mut(), Traits::current_cpu(), true);
    Ok(())
}

/// Fold the open slice of `cpu` (if any) into the records. `close` closes
/// the slice; otherwise the baseline is re-stamped and the slice stays open
/// (the query path).
fn fold_cpu<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    cpu: usize,
    close: bool,
) {
    let state = Traits::usage_state();
    let now = Traits::cycle_count();

    let (cycles, thread) = {
        let cpus = state.cpus.write(&mut *lock);
        let Some(rec) = cpus.get_mut(cpu) else {
            return;
        };
        if rec.usage0 == 0 {
            return;
        }

        let cycles = now.saturating_sub(rec.usage0);
        rec.usage0 = if close { 0 } else { nonzero_stamp(now) };

        let thread = rec.current_thread;
        if close {
            rec.current_thread = None;
        }

        if let Some(thread) = thread {
            if rec.track_usage {
                if Traits::is_idle_thread(thread) {
                    rec.idle_total += cycles;
                } else {
                    rec.total += cycles;
                    rec.current += cycles;
                    rec.longest = rec.longest.max(rec.current);
                    if close {
                        rec.num_windows += 1;
                        rec.current = 0;
                    }
                }
            }
        }

        (cycles, thread)
    };

    if let Some(thread) = thread {
        let threads = state.threads.write(&mut *lock);
        if let Some(rec) = threads.get_mut(&thread) {
            if rec.track_usage {
                rec.total += cycles;
                rec.current += cycles;
                rec.longest = rec.longest.max(rec.current);
            }
        }
    }
}

/// The CPU `thread` currently has an open slice on, if any.
fn running_on<Traits: KernelTraits>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    thread: Traits::ThreadId,
) -> Option<usize> {
    Traits::usage_state()
        .cpus
        .read(&*lock)
        .iter()
        .position(|rec| rec.usage0 != 0 && rec.current_thread == Some(thread))
}

fn thread_stats_of(rec: &ThreadUsage) -> ThreadStats {
    ThreadStats {
        total_cycles: rec.total,
        current_cycles: rec.current,
        peak_cycles: rec.longest,
        average_cycles: if rec.num_windows == 0 {
            0
        } else {
            rec.total / u64::from(rec.num_windows)
        },
    }
}

fn cpu_stats_of<Id>(rec: &CpuUsage<Id>) -> CpuStats {
    CpuStats {
        total_cycles: rec.total,
        current_cycles: rec.current,
        peak_cycles: rec.longest,
        average_cycles: if rec.num_windows == 0 {
            0
        } else {
            rec.total / u64::from(rec.num_windows)
        },
        idle_cycles: rec.idle_total,
        execution_cycles: rec.total + rec.idle_total,
    }
}

/// Query a thread's statistics, folding in the open slice (without closing
/// it) if the thread is currently running.
pub fn thread_usage<Traits: KernelTraits>(
    thread: Traits::ThreadId,
) -> Result<ThreadStats, UsageError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    if let Some(cpu) = running_on::<Traits>(lock.borrow_mut(), thread) {
        fold_cpu::<Traits>(lock.borrow_mut(), cpu, false);
    }

    let threads = Traits::usage_state().threads.read(&*lock);
    let rec = threads.get(&thread).ok_or(UsageError::BadParam)?;
    Ok(thread_stats_of(rec))
}

/// Query a CPU's statistics, folding in the open slice (without closing it)
/// if one is open.
pub fn cpu_usage<Traits: KernelTraits>(cpu: usize) -> Result<CpuStats, UsageError> {
    if cpu >= Traits::NUM_CPUS || cpu >= MAX_CPUS {
        return Err(UsageError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    fold_cpu::<Traits>(lock.borrow_mut(), cpu, false);

    let cpus = Traits::usage_state().cpus.read(&*lock);
    Ok(cpu_stats_of(cpus.get(cpu).unwrap_or(&CpuUsage::INIT)))
}

/// Start folding cycles into `thread`'s record, creating it if necessary.
/// Opens a fresh window; a no-op if tracking is already on.
pub fn thread_stats_enable<Traits: KernelTraits>(
    thread: Traits::ThreadId,
) -> Result<(), UsageError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let threads = Traits::usage_state().threads.write(&mut *lock);
    let rec = threads.entry(thread).or_insert(ThreadUsage::INIT);
    if !rec.track_usage {
        rec.track_usage = true;
        rec.num_windows += 1;
        rec.current = 0;
    }
    Ok(())
}

/// Stop folding cycles into `thread`'s record. In-flight cycles are folded
/// in first so nothing already earned is lost.
pub fn thread_stats_disable<Traits: KernelTraits>(
    thread: Traits::ThreadId,
) -> Result<(), UsageError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    if let Some(cpu) = running_on::<Traits>(lock.borrow_mut(), thread) {
        fold_cpu::<Traits>(lock.borrow_mut(), cpu, false);
    }

    let threads = Traits::usage_state().threads.write(&mut *lock);
    threads
        .get_mut(&thread)
        .ok_or(UsageError::BadParam)?
        .track_usage = false;
    Ok(())
}

/// Turn CPU-level tracking on for every CPU at once.
pub fn cpu_stats_enable_all<Traits: KernelTraits>() -> Result<(), UsageError> {
    toggle_all_cpus::<Traits>(true)
}

/// Turn CPU-level tracking off for every CPU at once. In-flight cycles are
/// folded in first.
pub fn cpu_stats_disable_all<Traits: KernelTraits>() -> Result<(), UsageError> {
    toggle_all_cpus::<Traits>(false)
}

fn toggle_all_cpus<Traits: KernelTraits>(enable: bool) -> Result<(), UsageError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::usage_state();
    let num_cpus = Traits::NUM_CPUS.min(MAX_CPUS);
    let this_cpu = Traits::current_cpu();
    debug_assert!(this_cpu < num_cpus);

    {
        let cpus = state.cpus.write(&mut *lock);
        grow_to(cpus, num_cpus);

        // The flag is toggled for every CPU at once, so this CPU's flag
        // speaks for all of them
        if cpus[this_cpu].track_usage == enable {
            return Ok(());
        }
    }

    for cpu in 0..num_cpus {
        // Folding before the toggle re-stamps the baseline, so cycles
        // accumulated under the old flag state stay under the old flag state
        fold_cpu::<Traits>(lock.borrow_mut(), cpu, false);
        state.cpus.write(&mut *lock)[cpu].track_usage = enable;
    }

    Ok(())
}

fn grow_to<Id>(cpus: &mut ArrayVec<CpuUsage<Id>, MAX_CPUS>, len: usize) {
    while cpus.len() < len {
        cpus.push(CpuUsage::INIT);
    }
}

/// Uniform statistics interface implemented by the accounting-capable
/// kernel object handles.
pub trait ObjectStats {
    /// The raw record type.
    type Raw;
    /// The query answer type.
    type Query;

    /// Copy out the raw record, folding in the open slice first.
    fn stats_raw(&self) -> Result<Self::Raw, UsageError>;
    /// Compute the derived statistics.
    fn stats_query(&self) -> Result<Self::Query, UsageError>;
    /// Zero the accumulators. An open slice is re-stamped rather than left
    /// with a stale baseline; the tracking flag is preserved.
    fn stats_reset(&self) -> Result<(), UsageError>;
    /// Turn tracking on.
    fn stats_enable(&self) -> Result<(), UsageError>;
    /// Turn tracking off.
    fn stats_disable(&self) -> Result<(), UsageError>;
}

/// [`ObjectStats`] handle for one thread.
pub struct ThreadStatsObject<Traits: KernelTraits>(pub Traits::ThreadId);

impl<Traits: KernelTraits> ObjectStats for ThreadStatsObject<Traits> {
    type Raw = ThreadUsage;
    type Query = ThreadStats;

    fn stats_raw(&self) -> Result<ThreadUsage, UsageError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if let Some(cpu) = running_on::<Traits>(lock.borrow_mut(), self.0) {
            fold_cpu::<Traits>(lock.borrow_mut(), cpu, false);
        }

        let threads = Traits::usage_state().threads.read(&*lock);
        threads.get(&self.0).copied().ok_or(UsageError::BadParam)
    }

    fn stats_query(&self) -> Result<ThreadStats, UsageError> {
        thread_usage::<Traits>(self.0)
    }

    fn stats_reset(&self) -> Result<(), UsageError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::usage_state();

        // Discard the in-flight cycles instead of folding them into the
        // record we're about to zero
        if let Some(cpu) = running_on::<Traits>(lock.borrow_mut(), self.0) {
            let now = nonzero_stamp(Traits::cycle_count());
            state.cpus.write(&mut *lock)[cpu].usage0 = now;
        }

        let threads = state.threads.write(&mut *lock);
        let rec = threads.get_mut(&self.0).ok_or(UsageError::BadParam)?;
        let track_usage = rec.track_usage;
        *rec = ThreadUsage {
            track_usage,
            ..ThreadUsage::INIT
        };
        Ok(())
    }

    fn stats_enable(&self) -> Result<(), UsageError> {
        thread_stats_enable::<Traits>(self.0)
    }

    fn stats_disable(&self) -> Result<(), UsageError> {
        thread_stats_disable::<Traits>(self.0)
    }
}

/// [`ObjectStats`] handle for one CPU.
pub struct CpuStatsObject<Traits: KernelTraits> {
    pub cpu: usize,
    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits: KernelTraits> CpuStatsObject<Traits> {
    pub const fn new(cpu: usize) -> Self {
        Self {
            cpu,
            _phantom: core::marker::PhantomData,
        }
    }

    fn check_range(&self) -> Result<(), UsageError> {
        if self.cpu >= Traits::NUM_CPUS || self.cpu >= MAX_CPUS {
            Err(UsageError::BadParam)
        } else {
            Ok(())
        }
    }
}

impl<Traits: KernelTraits> ObjectStats for CpuStatsObject<Traits> {
    type Raw = CpuUsage<Traits::ThreadId>;
    type Query = CpuStats;

    fn stats_raw(&self) -> Result<Self::Raw, UsageError> {
        self.check_range()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        fold_cpu::<Traits>(lock.borrow_mut(), self.cpu, false);
        let cpus = Traits::usage_state().cpus.read(&*lock);
        Ok(cpus.get(self.cpu).copied().unwrap_or(CpuUsage::INIT))
    }

    fn stats_query(&self) -> Result<CpuStats, UsageError> {
        cpu_usage::<Traits>(self.cpu)
    }

    fn stats_reset(&self) -> Result<(), UsageError> {
        self.check_range()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let now = nonzero_stamp(Traits::cycle_count());
        let cpus = Traits::usage_state().cpus.write(&mut *lock);
        grow_to(cpus, self.cpu + 1);
        let rec = &mut cpus[self.cpu];
        rec.total = 0;
        rec.current = 0;
        rec.longest = 0;
        rec.num_windows = 0;
        rec.idle_total = 0;
        if rec.usage0 != 0 {
            rec.usage0 = now;
        }
        Ok(())
    }

    fn stats_enable(&self) -> Result<(), UsageError> {
        self.check_range()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        fold_cpu::<Traits>(lock.borrow_mut(), self.cpu, false);
        let cpus = Traits::usage_state().cpus.write(&mut *lock);
        grow_to(cpus, self.cpu + 1);
        cpus[self.cpu].track_usage = true;
        Ok(())
    }

    fn stats_disable(&self) -> Result<(), UsageError> {
        self.check_range()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        fold_cpu::<Traits>(lock.borrow_mut(), self.cpu, false);
        let cpus = Traits::usage_state().cpus.write(&mut *lock);
        grow_to(cpus, self.cpu + 1);
        cpus[self.cpu].track_usage = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_never_collides_with_sentinel() {
        assert_eq!(nonzero_stamp(0), 1);
        assert_eq!(nonzero_stamp(1), 1);
        assert_eq!(nonzero_stamp(u64::MAX), u64::MAX);
    }

    #[test]
    fn averages() {
        let rec = ThreadUsage {
            total: 900,
            current: 300,
            longest: 500,
            num_windows: 3,
            track_usage: true,
        };
        let stats = thread_stats_of(&rec);
        assert_eq!(stats.average_cycles, 300);
        assert_eq!(stats.peak_cycles, 500);

        let stats = thread_stats_of(&ThreadUsage::INIT);
        assert_eq!(stats.average_cycles, 0);

        let rec: CpuUsage<u32> = CpuUsage {
            total: 1000,
            idle_total: 250,
            num_windows: 4,
            ..CpuUsage::INIT
        };
        let stats = cpu_stats_of(&rec);
        assert_eq!(stats.average_cycles, 250);
        assert_eq!(stats.execution_cycles, 1250);
        assert_eq!(stats.idle_cycles, 250);
    }
}
