//! End-to-end scheduling behaviour: ordering, atomic groups, duplicate
//! requests, and deadlock freedom on overlapping cown sets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use boc_runtime::{when, Behaviour, CownPtr, Read, Write};

#[test]
fn test_single_writer_single_cown() {
    let c = CownPtr::new(0u64);
    let result = c.clone();

    common::run(2, || {
        when(Write(c.clone()), |mut v| *v = 42);
    });

    // Quiescent: the only outstanding reference is ours.
    assert_eq!(result.strong_count(), 2);
    drop(c);
    assert_eq!(result.strong_count(), 1);

    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    common::run(2, move || {
        when(Read(result.clone()), move |v| {
            o.store(*v as usize, Ordering::SeqCst);
        });
    });
    assert_eq!(observed.load(Ordering::SeqCst), 42);
}

#[test]
fn test_zero_cown_behaviour_runs() {
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    common::run(2, || {
        when((), move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_submission_order_on_one_cown() {
    let c = CownPtr::new(Vec::new());
    let probe = c.clone();

    common::run(1, || {
        for i in 0..10u32 {
            when(Write(c.clone()), move |mut v| v.push(i));
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    common::run(1, move || {
        when(Read(probe.clone()), move |v| {
            s.lock().unwrap().extend_from_slice(&v);
        });
    });
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u32>>());
}

#[test]
fn test_duplicate_cown_in_one_request() {
    let c = CownPtr::new(0u32);
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let before = c.strong_count();

    common::run(2, || {
        when((Write(c.clone()), Write(c.clone())), move |(mut a, _b)| {
            *a += 1;
            r.fetch_add(1, Ordering::SeqCst);
        });
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(c.strong_count(), before);
}

#[test]
fn test_batch_is_atomic_on_shared_cown() {
    let c = CownPtr::new(Vec::new());
    let probe = c.clone();

    common::run(4, || {
        // Competing singleton writers...
        for _ in 0..20 {
            when(Write(c.clone()), |mut v| v.push(0u32));
        }
        // ...and one atomically scheduled group of three.
        let batch = vec![
            Behaviour::prepare_once(Write(c.clone()), |mut v| v.push(1)),
            Behaviour::prepare_once(Write(c.clone()), |mut v| v.push(2)),
            Behaviour::prepare_once(Write(c.clone()), |mut v| v.push(3)),
        ];
        Behaviour::schedule_batch(batch);
        for _ in 0..20 {
            when(Write(c.clone()), |mut v| v.push(0u32));
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    common::run(1, move || {
        when(Read(probe.clone()), move |v| {
            s.lock().unwrap().extend_from_slice(&v);
        });
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 43);
    // The group's writes appear contiguously, in batch order.
    let start = seen
        .iter()
        .position(|&x| x == 1)
        .expect("batch member missing");
    assert_eq!(&seen[start..start + 3], &[1, 2, 3]);
}

#[test]
fn test_overlapping_pairs_complete() {
    // Two writers racing on (a, b) and (b, a), scheduled concurrently
    // from separate spawner behaviours. One global acquisition order
    // means neither can deadlock, whichever worker installs first.
    for _ in 0..20 {
        let done = Arc::new(AtomicUsize::new(0));

        common::run(4, || {
            let a = CownPtr::new(0u32);
            let b = CownPtr::new(0u32);

            for flip in [false, true] {
                let a = a.clone();
                let b = b.clone();
                let done = done.clone();
                when((), move |_| {
                    let pair = if flip {
                        (Write(b.clone()), Write(a.clone()))
                    } else {
                        (Write(a.clone()), Write(b.clone()))
                    };
                    let done = done.clone();
                    when(pair, move |(mut x, mut y)| {
                        *x += 1;
                        *y += 1;
                        done.fetch_add(1, Ordering::SeqCst);
                    });
                });
            }
        });

        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}

#[test]
fn test_dining_philosophers() {
    const SEATS: usize = 5;
    const ROUNDS: usize = 20;

    let eaten = Arc::new(AtomicUsize::new(0));

    common::run(4, || {
        let forks: Vec<CownPtr<u64>> = (0..SEATS).map(|_| CownPtr::new(0)).collect();

        fn dine(
            left: CownPtr<u64>,
            right: CownPtr<u64>,
            rounds: usize,
            eaten: Arc<AtomicUsize>,
        ) {
            if rounds == 0 {
                return;
            }
            when(
                (Write(left.clone()), Write(right.clone())),
                move |(mut l, mut r)| {
                    *l += 1;
                    *r += 1;
                    eaten.fetch_add(1, Ordering::SeqCst);
                    dine(left, right, rounds - 1, eaten);
                },
            );
        }

        for seat in 0..SEATS {
            let left = forks[seat].clone();
            let right = forks[(seat + 1) % SEATS].clone();
            dine(left, right, ROUNDS, eaten.clone());
        }
    });

    assert_eq!(eaten.load(Ordering::SeqCst), SEATS * ROUNDS);
}

#[test]
fn test_nested_scheduling_from_behaviours() {
    // A behaviour scheduling further behaviours on the cown it holds:
    // the inner behaviour must run strictly after the outer completes.
    let c = CownPtr::new(Vec::new());
    let probe = c.clone();

    common::run(2, || {
        let inner_c = c.clone();
        when(Write(c.clone()), move |mut v| {
            v.push(1u32);
            when(Write(inner_c.clone()), |mut v| v.push(2));
        });
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    common::run(1, move || {
        when(Read(probe.clone()), move |v| {
            s.lock().unwrap().extend_from_slice(&v);
        });
    });
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}
