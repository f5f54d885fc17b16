//! Reference transfer (`Move` requests): the caller's strong reference is
//! consumed by scheduling, exactly once.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use boc_runtime::{when, CownPtr, Move, Write};

#[test]
fn test_move_consumes_callers_reference() {
    let c = CownPtr::new(5u32);
    let extra = c.clone();
    assert_eq!(c.strong_count(), 2);

    let ran = Arc::new(AtomicUsize::new(0));
    common::run(2, || {
        let ran = ran.clone();
        when(Move(extra), move |mut v| {
            *v += 1;
            ran.fetch_add(1, Ordering::SeqCst);
        });
        // The handle moved into the request is gone; the chain now holds
        // the reference it carried.
        assert_eq!(c.strong_count(), 2);
    });

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    // After completion only the caller's remaining handle survives.
    assert_eq!(c.strong_count(), 1);
}

#[test]
fn test_move_to_busy_cown() {
    // The moved reference lands behind an existing chain entry; the
    // scheduler must release the surplus rather than leak it.
    let c = CownPtr::new(0u32);
    let extra = c.clone();

    common::run(2, || {
        when(Write(c.clone()), |mut v| *v += 1);
        when(Move(extra), |mut v| *v += 1);
    });

    assert_eq!(c.strong_count(), 1);

    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    common::run(1, move || {
        when(Write(c), move |v| {
            o.store(*v as usize, Ordering::SeqCst);
        });
    });
    assert_eq!(observed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_move_with_plain_request_in_one_behaviour() {
    let a = CownPtr::new(1u32);
    let b = CownPtr::new(2u32);
    let moved = b.clone();
    assert_eq!(b.strong_count(), 2);

    common::run(2, || {
        when((Write(a.clone()), Move(moved)), |(mut x, mut y)| {
            *x += 10;
            *y += 10;
        });
    });

    assert_eq!(a.strong_count(), 1);
    assert_eq!(b.strong_count(), 1);
}

#[test]
fn test_move_repeated_cycles_balance() {
    let c = CownPtr::new(0u32);
    for _ in 0..10 {
        let extra = c.clone();
        common::run(2, || {
            when(Move(extra), |mut v| *v += 1);
        });
        assert_eq!(c.strong_count(), 1);
    }

    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    common::run(1, move || {
        when(Write(c), move |v| o.store(*v as usize, Ordering::SeqCst));
    });
    assert_eq!(observed.load(Ordering::SeqCst), 10);
}
