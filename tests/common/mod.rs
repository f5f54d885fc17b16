//! Shared test harness.
//!
//! The scheduler is a process-wide singleton, so tests that run a pool
//! are serialised behind a global lock: each `run` initialises the
//! scheduler, lets the test body schedule its initial behaviours, then
//! runs the pool to quiescence before the next test may start.

#![allow(dead_code)]

use std::sync::Mutex;

static HARNESS: Mutex<()> = Mutex::new(());

/// Initialise a pool with `workers` workers, call `f` to schedule the
/// initial behaviours, and run to quiescence.
pub fn run(workers: usize, f: impl FnOnce()) {
    let _guard = HARNESS.lock().unwrap_or_else(|e| e.into_inner());
    let scheduler = boc_runtime::init(workers);
    f();
    scheduler.run();
}

/// Like [`run`], but calls `after` once the pool has quiesced, before
/// another test may reinitialise the scheduler. Use this for assertions
/// that read global scheduler state (for example statistics).
pub fn run_and_then(workers: usize, f: impl FnOnce(), after: impl FnOnce()) {
    let _guard = HARNESS.lock().unwrap_or_else(|e| e.into_inner());
    let scheduler = boc_runtime::init(workers);
    f();
    scheduler.run();
    after();
}

/// Like [`run`], but repeats the whole init/schedule/run cycle `times`
/// times to shake out schedule-dependent behaviour.
pub fn run_repeated(times: usize, workers: usize, mut f: impl FnMut()) {
    let _guard = HARNESS.lock().unwrap_or_else(|e| e.into_inner());
    for _ in 0..times {
        let scheduler = boc_runtime::init(workers);
        f();
        scheduler.run();
    }
}
