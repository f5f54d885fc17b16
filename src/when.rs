//! Typed behaviour scheduling.
//!
//! This module is the user-facing surface over [`BehaviourCore`]: request
//! wrappers saying *how* each cown is wanted, guard types giving the body
//! access to the owned values, and [`when`] to schedule a closure against
//! a set of cowns.
//!
//! ```rust,ignore
//! use boc_runtime::{when, CownPtr, Read, Write};
//!
//! let account = CownPtr::new(100i64);
//! let audit = CownPtr::new(Vec::new());
//!
//! when((Write(account.clone()), Write(audit.clone())), |(mut acc, mut log)| {
//!     *acc -= 20;
//!     log.push(*acc);
//! });
//!
//! when(Read(account), |acc| println!("balance: {}", *acc));
//! ```
//!
//! Requests compose as tuples; the behaviour acquires every named cown
//! atomically, in one global order, so overlapping `when`s can never
//! deadlock. [`Move`] transfers the caller's reference to the scheduler
//! along with the request. Groups of behaviours can be scheduled as one
//! atomic unit with [`Behaviour::schedule_batch`].

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use std::alloc::Layout;

use crate::behaviour::BehaviourCore;
use crate::cown::{CownData, CownPtr};
use crate::slot::Slot;
use crate::threadpool;
use crate::work::Work;

/// What a behaviour body wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The behaviour is finished; release its cowns and free it.
    Done,
    /// Re-enqueue the behaviour without releasing its cowns; the body
    /// runs again while holding the same access.
    Rerun,
}

/// Request exclusive (write) access to a cown.
pub struct Write<T: 'static>(pub CownPtr<T>);

/// Request shared (read) access to a cown.
pub struct Read<T: 'static>(pub CownPtr<T>);

/// Request exclusive access, transferring this handle's strong reference
/// to the scheduler.
pub struct Move<T: 'static>(pub CownPtr<T>);

/// Exclusive access to a cown's value inside a behaviour body.
///
/// Guards are only meaningful while the body runs; they cannot be sent to
/// another thread or another behaviour.
pub struct WriteGuard<T: 'static> {
    data: NonNull<CownData<T>>,
    _not_send: PhantomData<*mut T>,
}

impl<T> Deref for WriteGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.as_ref().value.get() }
    }
}

impl<T> DerefMut for WriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.as_ref().value.get() }
    }
}

/// Shared access to a cown's value inside a behaviour body.
pub struct ReadGuard<T: 'static> {
    data: NonNull<CownData<T>>,
    _not_send: PhantomData<*mut T>,
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.as_ref().value.get() }
    }
}

/// Type-erased cown address carried in a behaviour payload.
pub struct RawCown<T: 'static>(NonNull<CownData<T>>);

impl<T> Clone for RawCown<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RawCown<T> {}

// The payload crosses threads with the behaviour; access is serialised by
// the scheduler.
unsafe impl<T: Send> Send for RawCown<T> {}

/// A set of cown access requests.
///
/// Implemented by [`Write`], [`Read`], [`Move`], the empty set `()`, and
/// tuples of requests. `Guards` is what the behaviour body receives, in
/// request order.
pub trait Requests: Send + 'static {
    /// Cown addresses stored in the payload.
    type Raw: Copy + Send + 'static;
    /// Handles owned by the payload, released when the behaviour is
    /// freed.
    type Owners: Send + 'static;
    /// Access handed to the body on each run.
    type Guards;

    /// Number of slots this request set occupies.
    const COUNT: usize;

    /// Fill `slots` (at least `COUNT` of them) and split into the payload
    /// parts.
    ///
    /// # Safety
    ///
    /// `slots` must point at `COUNT` uninitialised slots inside a
    /// behaviour allocation.
    unsafe fn fill(self, slots: *mut Slot) -> (Self::Raw, Self::Owners);

    /// Materialise the body's guards from the stored addresses.
    ///
    /// # Safety
    ///
    /// Must only be called while the owning behaviour holds its cowns.
    unsafe fn guards(raw: Self::Raw) -> Self::Guards;
}

impl<T: Send + 'static> Requests for Write<T> {
    type Raw = RawCown<T>;
    type Owners = Option<CownPtr<T>>;
    type Guards = WriteGuard<T>;

    const COUNT: usize = 1;

    unsafe fn fill(self, slots: *mut Slot) -> (Self::Raw, Self::Owners) {
        slots.write(Slot::new(self.0.cown(), false));
        (RawCown(self.0.data()), Some(self.0))
    }

    unsafe fn guards(raw: Self::Raw) -> Self::Guards {
        WriteGuard {
            data: raw.0,
            _not_send: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Requests for Read<T> {
    type Raw = RawCown<T>;
    type Owners = Option<CownPtr<T>>;
    type Guards = ReadGuard<T>;

    const COUNT: usize = 1;

    unsafe fn fill(self, slots: *mut Slot) -> (Self::Raw, Self::Owners) {
        slots.write(Slot::new(self.0.cown(), true));
        (RawCown(self.0.data()), Some(self.0))
    }

    unsafe fn guards(raw: Self::Raw) -> Self::Guards {
        ReadGuard {
            data: raw.0,
            _not_send: PhantomData,
        }
    }
}

impl<T: Send + 'static> Requests for Move<T> {
    type Raw = RawCown<T>;
    type Owners = Option<CownPtr<T>>;
    type Guards = WriteGuard<T>;

    const COUNT: usize = 1;

    unsafe fn fill(self, slots: *mut Slot) -> (Self::Raw, Self::Owners) {
        slots.write(Slot::new(self.0.cown(), false));
        (*slots).set_move();
        // The handle's reference now belongs to the slot.
        (RawCown(self.0.into_transferred()), None)
    }

    unsafe fn guards(raw: Self::Raw) -> Self::Guards {
        WriteGuard {
            data: raw.0,
            _not_send: PhantomData,
        }
    }
}

impl Requests for () {
    type Raw = ();
    type Owners = ();
    type Guards = ();

    const COUNT: usize = 0;

    unsafe fn fill(self, _slots: *mut Slot) -> ((), ()) {
        ((), ())
    }

    unsafe fn guards(_raw: ()) -> () {}
}

macro_rules! impl_requests_for_tuple {
    ($($req:ident . $idx:tt),+) => {
        impl<$($req: Requests),+> Requests for ($($req,)+) {
            type Raw = ($($req::Raw,)+);
            type Owners = ($($req::Owners,)+);
            type Guards = ($($req::Guards,)+);

            const COUNT: usize = 0 $(+ $req::COUNT)+;

            #[allow(non_snake_case)]
            unsafe fn fill(self, slots: *mut Slot) -> (Self::Raw, Self::Owners) {
                let mut offset = 0usize;
                $(
                    let $req = self.$idx.fill(slots.add(offset));
                    offset += $req::COUNT;
                )+
                let _ = offset;
                (($($req.0,)+), ($($req.1,)+))
            }

            unsafe fn guards(raw: Self::Raw) -> Self::Guards {
                ($($req::guards(raw.$idx),)+)
            }
        }
    };
}

impl_requests_for_tuple!(A.0);
impl_requests_for_tuple!(A.0, B.1);
impl_requests_for_tuple!(A.0, B.1, C.2);
impl_requests_for_tuple!(A.0, B.1, C.2, D.3);
impl_requests_for_tuple!(A.0, B.1, C.2, D.3, E.4);

/// Payload placed after the slots in a behaviour allocation.
struct Payload<R: Requests, F> {
    raw: R::Raw,
    owners: R::Owners,
    f: F,
}

/// A behaviour built by [`Behaviour::prepare`], awaiting scheduling.
///
/// Must be scheduled; a prepared behaviour that is never passed to
/// [`Behaviour::schedule_batch`] leaks its allocation and its cown
/// references.
pub struct Prepared {
    core: NonNull<BehaviourCore>,
}

unsafe impl Send for Prepared {}

/// Scheduling entry points for typed behaviours.
pub struct Behaviour;

impl Behaviour {
    /// Build a behaviour over `requests` whose body may run more than
    /// once: each run returns a [`Completion`], and `Rerun` keeps the
    /// cowns held for the next run.
    pub fn prepare<R, F>(requests: R, f: F) -> Prepared
    where
        R: Requests,
        F: FnMut(R::Guards) -> Completion + Send + 'static,
    {
        let core = BehaviourCore::make(
            R::COUNT,
            Self::invoke::<R, F>,
            Layout::new::<Payload<R, F>>(),
        )
        .unwrap_or_else(|e| e.handle());

        unsafe {
            let (raw, owners) = requests.fill(core.as_ref().get_slots());
            core.as_ref()
                .get_body::<Payload<R, F>>()
                .write(Payload { raw, owners, f });
        }
        Prepared { core }
    }

    /// Build a run-once behaviour.
    pub fn prepare_once<R, F>(requests: R, f: F) -> Prepared
    where
        R: Requests,
        F: FnOnce(R::Guards) + Send + 'static,
    {
        let mut f = Some(f);
        Self::prepare(requests, move |guards| {
            if let Some(f) = f.take() {
                f(guards);
            }
            Completion::Done
        })
    }

    /// Schedule a group of prepared behaviours as one atomic unit: on
    /// every cown the group touches, its members are adjacent in the wait
    /// chain, in `batch` order.
    pub fn schedule_batch(batch: Vec<Prepared>) {
        let bodies: Vec<NonNull<BehaviourCore>> = batch.iter().map(|p| p.core).collect();
        unsafe { BehaviourCore::schedule_many(&bodies) };
    }

    unsafe fn invoke<R, F>(work: NonNull<Work>)
    where
        R: Requests,
        F: FnMut(R::Guards) -> Completion + Send + 'static,
    {
        let payload = BehaviourCore::body_from_work::<Payload<R, F>>(work);
        match ((*payload).f)(R::guards((*payload).raw)) {
            Completion::Done => {
                std::ptr::drop_in_place(payload);
                BehaviourCore::finished(work, false);
            }
            Completion::Rerun => {
                threadpool::schedule_work(work, true);
            }
        }
    }
}

/// Schedule `f` to run with the requested access once every cown is
/// available.
///
/// Returns immediately; the body runs on a scheduler worker. Ordering is
/// exactly submission order with respect to any behaviour sharing a cown.
pub fn when<R, F>(requests: R, f: F)
where
    R: Requests,
    F: FnOnce(R::Guards) + Send + 'static,
{
    Behaviour::schedule_batch(vec![Behaviour::prepare_once(requests, f)]);
}
