//! Thread pool behaviour: termination, external event sources, LIFO
//! scheduling, behaviour re-run and reuse, and the raw work surface.

mod common;

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use boc_runtime::{
    when, Behaviour, BehaviourCore, Closure, Completion, CownPtr, Scheduler, Work, Write,
};

#[test]
fn test_empty_pool_terminates() {
    common::run(4, || {});
}

#[test]
fn test_pool_reinitialises_after_run() {
    let total = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let t = total.clone();
        common::run(2, move || {
            when((), move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            });
        });
    }
    assert_eq!(total.load(Ordering::SeqCst), 5);
}

#[test]
fn test_external_event_source_keeps_pool_alive() {
    let delivered = Arc::new(AtomicBool::new(false));

    common::run(2, || {
        let scheduler = Scheduler::get();
        scheduler.add_external_event_source();

        let delivered = delivered.clone();
        thread::spawn(move || {
            // With no queued work the pool would otherwise terminate well
            // within this window.
            thread::sleep(Duration::from_millis(100));
            when((), move |_| {
                delivered.store(true, Ordering::SeqCst);
            });
            Scheduler::get().remove_external_event_source();
        });
    });

    // run() returning proves the pool outlived the quiet period; the
    // injected behaviour must have run before termination.
    assert!(delivered.load(Ordering::SeqCst));
}

#[test]
fn test_schedule_lifo_from_external_thread() {
    let ran = Arc::new(AtomicBool::new(false));

    common::run(2, || {
        let scheduler = Scheduler::get();
        scheduler.add_external_event_source();

        let ran = ran.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let r = ran.clone();
            let work = Closure::make(move |_| {
                r.store(true, Ordering::SeqCst);
                true
            })
            .unwrap();
            unsafe { Scheduler::get().schedule_lifo(0, work) };
            Scheduler::get().remove_external_event_source();
        });
    });

    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_closure_reschedules_itself() {
    // A plain work item that re-enqueues itself a fixed number of times
    // before letting go of its allocation.
    let runs = Arc::new(AtomicUsize::new(0));

    // One worker: the closure must never overlap with itself.
    common::run(1, || {
        let runs = runs.clone();
        let work = Closure::make(move |work| {
            if runs.fetch_add(1, Ordering::SeqCst) < 4 {
                unsafe { Scheduler::get().schedule(work) };
                false
            } else {
                true
            }
        })
        .unwrap();
        unsafe { Scheduler::get().schedule(work) };
    });

    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[test]
fn test_behaviour_rerun_keeps_cowns_held() {
    let c = CownPtr::new(0u64);
    let interleaved = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicUsize::new(0));

    common::run(4, || {
        let mut remaining = 3u32;
        let batch = vec![Behaviour::prepare(Write(c.clone()), move |mut v| {
            *v += 1;
            remaining -= 1;
            if remaining == 0 {
                Completion::Done
            } else {
                Completion::Rerun
            }
        })];
        Behaviour::schedule_batch(batch);

        // A competing writer: if the re-running behaviour ever dropped
        // the cown between runs, this could observe an intermediate
        // value.
        let interleaved = interleaved.clone();
        let observed = observed.clone();
        when(Write(c.clone()), move |v| {
            observed.store(*v as usize, Ordering::SeqCst);
            if *v != 3 {
                interleaved.store(true, Ordering::SeqCst);
            }
        });
    });

    assert_eq!(observed.load(Ordering::SeqCst), 3);
    assert!(!interleaved.load(Ordering::SeqCst));
}

/// Payload of the raw reuse test behaviour.
struct ReusePayload {
    runs: Arc<AtomicUsize>,
}

unsafe fn reuse_invoke(work: NonNull<Work>) {
    let payload = BehaviourCore::body_from_work::<ReusePayload>(work);
    (*payload).runs.fetch_add(1, Ordering::SeqCst);
    // Keep the allocation; the test schedules it again.
    BehaviourCore::finished(work, true);
}

#[test]
fn test_raw_behaviour_reuse() {
    use boc_runtime::slot::Slot;

    let c = CownPtr::new(0u8);
    let runs = Arc::new(AtomicUsize::new(0));

    let core = BehaviourCore::make(1, reuse_invoke, Layout::new::<ReusePayload>()).unwrap();
    unsafe {
        core.as_ref().get_slots().write(Slot::new(c.raw_cown(), false));
        core.as_ref().get_body::<ReusePayload>().write(ReusePayload {
            runs: runs.clone(),
        });
    }

    for cycle in 1..=3usize {
        common::run(2, || unsafe {
            // Each cycle reuses the same allocation; finished(reuse)
            // reset the slots, so only the cown must be refilled if it
            // changed. It did not.
            BehaviourCore::schedule_many(&[core]);
        });
        assert_eq!(runs.load(Ordering::SeqCst), cycle);
    }

    unsafe {
        std::ptr::drop_in_place(core.as_ref().get_body::<ReusePayload>());
        core.as_ref().dealloc();
    }
    assert_eq!(c.strong_count(), 1);
}

#[test]
fn test_steal_spreads_load() {
    // One spawner behaviour fans out many compute behaviours. They all
    // land on the spawner's core, so any other worker that runs one must
    // have stolen it.
    let done = Arc::new(AtomicUsize::new(0));
    let spawn_done = done.clone();

    common::run_and_then(
        4,
        move || {
            when((), move |_| {
                for _ in 0..64 {
                    let done = spawn_done.clone();
                    when((), move |_| {
                        // Enough work to keep a single core busy for a
                        // while.
                        let mut acc = 0u64;
                        for i in 0..50_000u64 {
                            acc = acc.wrapping_add(i * i);
                        }
                        std::hint::black_box(acc);
                        done.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        },
        || {
            let stats = Scheduler::get().stats();
            // 64 compute behaviours + the spawner, plus token runs.
            assert!(stats.works_run >= 65);
            assert!(stats.steals > 0);
        },
    );

    assert_eq!(done.load(Ordering::SeqCst), 64);
}

#[test]
fn test_current_core_inside_behaviour() {
    let saw_core = Arc::new(AtomicBool::new(false));

    common::run(2, || {
        let saw_core = saw_core.clone();
        when((), move |_| {
            saw_core.store(
                Scheduler::get().current_core().is_some(),
                Ordering::SeqCst,
            );
        });
    });

    assert!(saw_core.load(Ordering::SeqCst));
    assert_eq!(Scheduler::get().current_core(), None);
}
