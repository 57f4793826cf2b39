//! A unified counter-based synchronization kernel.
//!
//! This crate provides two subsystems, both generic over a *port* that
//! supplies the execution environment:
//!
//!  - [`zync`]: a single counter-based primitive covering mutex, semaphore,
//!    and condition-variable semantics, with optional priority inheritance,
//!    fair hand-off, and reentrancy.
//!  - [`usage`]: per-thread and per-CPU cycle-usage accounting driven by
//!    scheduler start/stop notifications.
//!
//! # The port trait family
//!
//! A port implements [`PortThreading`] (CPU Lock, thread identity and
//! priorities, deadlines, the pend/wake primitive), [`PortTiming`] (the
//! cycle counter), and [`KernelCfg`] (the kernel state singleton). The
//! umbrella trait [`KernelTraits`] has a blanket implementation and is what
//! the kernel code is written against.
//!
//! The kernel is `#![no_std]` and uses `alloc` for its id-keyed bookkeeping
//! collections.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod error;
mod klock;
pub mod timeout;
pub mod usage;
pub mod utils;
mod wait;
pub mod zync;

pub use crate::timeout::{Timeout, UTicks};

use core::fmt;

/// A thread's scheduling priority. A lower value means a more urgent
/// priority.
pub type Priority = i32;

/// The outcome of [`PortThreading::pend_current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendStatus {
    /// The thread was woken by [`PortThreading::wake_thread`]. The wakeup
    /// may be spurious; the kernel re-checks its wait state and pends again
    /// if the wait is still in progress.
    Woken,
    /// The deadline passed.
    TimedOut,
}

/// Implemented by a port to provide the threading environment.
///
/// # Safety
///
/// Implementing this trait is a contract with the kernel: the CPU Lock
/// methods must implement a system-wide mutual exclusion, `pend_current`
/// must release the CPU Lock exactly while the thread is suspended and
/// re-acquire it before returning, and `wake_thread` must eventually cause
/// a pending `pend_current` on that thread to return. Breaking any of these
/// lets the kernel mutate shared state without mutual exclusion.
pub unsafe trait PortThreading: Sized + 'static {
    /// The port's thread identifier type.
    type ThreadId: Copy + Ord + Eq + fmt::Debug + Send + 'static;

    /// An absolute point in time, as understood by `pend_current`.
    type Deadline: Copy + fmt::Debug + Send + 'static;

    /// The number of CPUs threads can be scheduled on.
    const NUM_CPUS: usize;

    /// Enter a CPU Lock state, returning `false` if it was already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state.
    ///
    /// # Safety
    ///
    /// The CPU Lock must be active, held by the caller.
    unsafe fn leave_cpu_lock();

    /// Whether the CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// The calling thread's identifier.
    fn current_thread() -> Self::ThreadId;

    /// The index of the CPU the calling thread runs on, in
    /// `0..Self::NUM_CPUS`.
    fn current_cpu() -> usize;

    /// Whether `thread` is the idle thread of some CPU.
    fn is_idle_thread(thread: Self::ThreadId) -> bool;

    /// The thread's current scheduling priority.
    fn thread_priority(thread: Self::ThreadId) -> Priority;

    /// Change the thread's scheduling priority (used for priority
    /// donation).
    fn set_thread_priority(thread: Self::ThreadId, priority: Priority);

    /// Convert a relative timeout to a deadline.
    fn deadline_after(ticks: UTicks) -> Self::Deadline;

    /// Suspend the calling thread until [`Self::wake_thread`] is called for
    /// it or the deadline passes.
    ///
    /// # Safety
    ///
    /// The caller must hold the CPU Lock. The implementation releases the
    /// CPU Lock for the duration of the suspension and re-acquires it
    /// before returning; the caller's guard must be treated as dormant
    /// across the call.
    unsafe fn pend_current(deadline: Option<Self::Deadline>) -> PendStatus;

    /// Wake up `thread` if it's suspended in `pend_current`, or make its
    /// next `pend_current` return immediately otherwise.
    ///
    /// # Safety
    ///
    /// `thread` must denote a live thread known to the port.
    unsafe fn wake_thread(thread: Self::ThreadId);

    /// Offer to relinquish the processor to another runnable thread. Called
    /// after a fair wake-up, outside the CPU Lock.
    fn yield_cpu();
}

/// Implemented by a port to provide the cycle counter backing the usage
/// accounting.
///
/// # Safety
///
/// `cycle_count` must be monotonic; the accounting arithmetic assumes time
/// never goes backwards.
pub unsafe trait PortTiming: Sized + 'static {
    /// The current value of a monotonic, system-wide cycle counter. The
    /// unit is opaque to the kernel.
    fn cycle_count() -> u64;
}

/// Associates a port with the static kernel state it owns.
///
/// # Safety
///
/// `usage_state` must return the same instance every time.
pub unsafe trait KernelCfg: PortThreading + PortTiming + Sized {
    /// The usage-accounting state singleton.
    fn usage_state() -> &'static usage::UsageState<Self>;
}

/// The umbrella trait binding the whole port trait family together.
pub trait KernelTraits: PortThreading + PortTiming + KernelCfg + 'static {}

impl<T: PortThreading + PortTiming + KernelCfg + 'static> KernelTraits for T {}
