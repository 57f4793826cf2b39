//! Behavioral tests for the usage-accounting subsystem, driven with the
//! simulator port's explicit cycle counter so every delta is exact.
//!
//! The accounting state and the cycle counter are process-wide, so these
//! tests take a serializing mutex instead of relying on the harness's
//! default parallelism.
use std::sync::{Mutex, MutexGuard};

use zync_kernel::error::UsageError;
use zync_kernel::usage::{self, CpuStatsObject, ObjectStats, ThreadStatsObject};
use zync_port_std::StdPort;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn init_test() {
    let _ = env_logger::builder().is_test(true).try_init();
    StdPort::register_current(10);
}

#[test]
fn thread_cycles_are_conserved_across_windows() {
    let _guard = serial();
    init_test();

    let thread = StdPort::register_thread(5, false);
    usage::thread_stats_enable::<StdPort>(thread).unwrap();

    StdPort::set_cycle_count(1_000);
    usage::usage_start::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(1_500);
    usage::usage_stop::<StdPort>().unwrap();

    StdPort::set_cycle_count(2_000);
    usage::usage_start::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(2_600);

    // A mid-window query folds the in-flight cycles in without closing the
    // window
    let mid = usage::thread_usage::<StdPort>(thread).unwrap();
    assert_eq!(mid.total_cycles, 1_100);
    assert_eq!(mid.current_cycles, 600);

    StdPort::set_cycle_count(3_000);
    usage::usage_stop::<StdPort>().unwrap();

    let stats = usage::thread_usage::<StdPort>(thread).unwrap();
    assert_eq!(stats.total_cycles, 1_500);
    assert_eq!(stats.current_cycles, 1_000);
    assert_eq!(stats.peak_cycles, 1_000);

    // Three windows: one opened by the enable call, one per switch-in
    let raw = ThreadStatsObject::<StdPort>(thread).stats_raw().unwrap();
    assert_eq!(raw.num_windows, 3);
    assert_eq!(stats.average_cycles, 500);
}

#[test]
fn idle_cycles_are_excluded_from_busy_aggregates() {
    let _guard = serial();
    init_test();

    usage::cpu_stats_disable_all::<StdPort>().unwrap();
    CpuStatsObject::<StdPort>::new(0).stats_reset().unwrap();
    usage::cpu_stats_enable_all::<StdPort>().unwrap();

    let idle = StdPort::register_thread(100, true);
    let worker = StdPort::register_thread(5, false);
    usage::thread_stats_enable::<StdPort>(idle).unwrap();

    StdPort::set_cycle_count(10_000);
    usage::usage_start::<StdPort>(worker).unwrap();
    StdPort::set_cycle_count(10_700);
    usage::usage_stop::<StdPort>().unwrap();

    usage::usage_start::<StdPort>(idle).unwrap();
    StdPort::set_cycle_count(11_000);
    usage::usage_stop::<StdPort>().unwrap();

    let stats = usage::cpu_usage::<StdPort>(0).unwrap();
    assert_eq!(stats.total_cycles, 700);
    assert_eq!(stats.idle_cycles, 300);
    assert_eq!(stats.execution_cycles, 1_000);
    assert_eq!(stats.peak_cycles, 700);
    assert_eq!(stats.average_cycles, 700);
    // The busy slice was closed, so nothing is in flight
    assert_eq!(stats.current_cycles, 0);

    // The idle thread's own record still sees its cycles
    let idle_stats = usage::thread_usage::<StdPort>(idle).unwrap();
    assert_eq!(idle_stats.total_cycles, 300);

    usage::cpu_stats_disable_all::<StdPort>().unwrap();
}

#[test]
fn disable_folds_in_flight_cycles_first() {
    let _guard = serial();
    init_test();

    let thread = StdPort::register_thread(5, false);
    usage::thread_stats_enable::<StdPort>(thread).unwrap();

    StdPort::set_cycle_count(50_000);
    usage::usage_start::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(50_400);
    usage::thread_stats_disable::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(50_900);
    usage::usage_stop::<StdPort>().unwrap();

    // The 400 cycles before the disable were kept; the 500 after were not
    let raw = ThreadStatsObject::<StdPort>(thread).stats_raw().unwrap();
    assert_eq!(raw.total, 400);
    assert_eq!(raw.current, 400);
    assert!(!raw.track_usage);
}

#[test]
fn stats_reset_zeroes_but_keeps_tracking() {
    let _guard = serial();
    init_test();

    let thread = StdPort::register_thread(5, false);
    let object = ThreadStatsObject::<StdPort>(thread);
    object.stats_enable().unwrap();

    StdPort::set_cycle_count(1_000);
    usage::usage_start::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(1_400);
    usage::usage_stop::<StdPort>().unwrap();

    object.stats_reset().unwrap();
    let raw = object.stats_raw().unwrap();
    assert_eq!(raw.total, 0);
    assert_eq!(raw.num_windows, 0);
    assert!(raw.track_usage);

    // Accumulation continues after the reset
    StdPort::set_cycle_count(2_000);
    usage::usage_start::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(2_300);
    usage::usage_stop::<StdPort>().unwrap();
    assert_eq!(usage::thread_usage::<StdPort>(thread).unwrap().total_cycles, 300);
}

#[test]
fn stats_reset_mid_window_discards_in_flight_cycles() {
    let _guard = serial();
    init_test();

    let thread = StdPort::register_thread(5, false);
    let object = ThreadStatsObject::<StdPort>(thread);
    object.stats_enable().unwrap();

    StdPort::set_cycle_count(5_000);
    usage::usage_start::<StdPort>(thread).unwrap();
    StdPort::set_cycle_count(5_600);
    // Re-stamps the open window's baseline; the 600 in-flight cycles are
    // discarded along with the accumulators
    object.stats_reset().unwrap();
    StdPort::set_cycle_count(5_900);
    usage::usage_stop::<StdPort>().unwrap();

    let raw = object.stats_raw().unwrap();
    assert_eq!(raw.total, 300);
}

#[test]
fn unknown_subjects_are_bad_param() {
    let _guard = serial();
    init_test();

    // Registered with the port but no usage record was ever created
    let stranger = StdPort::register_thread(5, false);
    assert_eq!(
        usage::thread_usage::<StdPort>(stranger),
        Err(UsageError::BadParam)
    );
    assert_eq!(
        usage::thread_stats_disable::<StdPort>(stranger),
        Err(UsageError::BadParam)
    );

    assert_eq!(usage::cpu_usage::<StdPort>(99), Err(UsageError::BadParam));
    assert_eq!(
        CpuStatsObject::<StdPort>::new(99).stats_reset(),
        Err(UsageError::BadParam)
    );
}

#[test]
fn cpu_toggle_is_idempotent() {
    let _guard = serial();
    init_test();

    usage::cpu_stats_disable_all::<StdPort>().unwrap();

    usage::cpu_stats_enable_all::<StdPort>().unwrap();
    // Already in the desired state on this CPU; the fast exit is taken
    usage::cpu_stats_enable_all::<StdPort>().unwrap();
    let raw = CpuStatsObject::<StdPort>::new(0).stats_raw().unwrap();
    assert!(raw.track_usage);

    usage::cpu_stats_disable_all::<StdPort>().unwrap();
    usage::cpu_stats_disable_all::<StdPort>().unwrap();
    let raw = CpuStatsObject::<StdPort>::new(0).stats_raw().unwrap();
    assert!(!raw.track_usage);
}
