//! Behaviour cores and the group-scheduling algorithm.
//!
//! A [`BehaviourCore`] is a scheduled behaviour: a pending count, an
//! inline array of [`Slot`]s, and a trailing payload, all living in one
//! allocation directly after the behaviour's [`Work`] header:
//!
//! ```text
//! | Work | BehaviourCore | Slot ... Slot | payload |
//! ```
//!
//! Address arithmetic converts between the pieces, so the scheduler can
//! move between a queued `Work`, its behaviour, and its slots without
//! any indirection.
//!
//! The wait chains hung off each cown form a DAG of behaviours, in the
//! manner of the MCS queue lock: each cown acts as a lock tail, each slot
//! as a wait node. Unlike a queue lock, nobody spins waiting to run —
//! the behaviour carries its code and is handed to the thread pool when
//! its last dependency resolves.
//!
//! [`BehaviourCore::schedule_many`] enqueues a whole group of behaviours
//! atomically: no other behaviour can slip between group members on any
//! shared cown. Two-phase locking over the slots makes cross-cown cycles
//! impossible: chains are installed on every cown in one global sort
//! order (phase 2), and only then is each tail published as ready
//! (phase 3), so a later group can never overtake an earlier one on any
//! shared cown.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::cown::Cown;
use crate::error::AllocError;
use crate::log;
use crate::slot::Slot;
use crate::threadpool;
use crate::work::{Work, WorkFn};

/// The behaviour header inside a combined work/behaviour allocation.
#[repr(C)]
pub struct BehaviourCore {
    /// Outstanding dependencies. Initialised to `count + 1`: the extra
    /// one is held by the scheduling thread itself and released only when
    /// every slot has been published, so the behaviour cannot run (or be
    /// freed) while its own acquire phase is still in flight.
    exec_count_down: AtomicUsize,
    /// Number of slots.
    count: usize,
    /// Layout of the whole allocation, needed to free it.
    layout: Layout,
}

const _: () =
    assert!(std::mem::size_of::<BehaviourCore>() % std::mem::size_of::<usize>() == 0);
const _: () = assert!(std::mem::size_of::<Work>() % std::mem::size_of::<usize>() == 0);

/// Per-chain bookkeeping carried between the phases of `schedule_many`.
struct ChainInfo {
    cown: *mut Cown,
    first_body_index: usize,
    first_slot: *mut Slot,
    last_slot: *mut Slot,
    transfer_count: usize,
    had_no_predecessor: bool,
    ref_count: usize,
    read_only_can_run: bool,
    first_writer: *mut BehaviourCore,
    /// Body indices of the leading run of readers, used both for the
    /// reader count and to credit each of those bodies when the read
    /// front opens immediately.
    first_reader_bodies: Vec<usize>,
}

impl BehaviourCore {
    /// Allocate a behaviour with `count` slots and room for a payload of
    /// the given layout. The slots are left uninitialised; the caller
    /// fills them through [`BehaviourCore::get_slots`] before scheduling.
    ///
    /// `invoke` receives the behaviour's `Work` pointer when the
    /// behaviour runs; it must finish by calling
    /// [`BehaviourCore::finished`] (or re-enqueueing the work to run
    /// again).
    pub fn make(
        count: usize,
        invoke: WorkFn,
        payload: Layout,
    ) -> Result<NonNull<BehaviourCore>, AllocError> {
        let slots_end = mem::size_of::<Work>()
            + mem::size_of::<BehaviourCore>()
            + count * mem::size_of::<Slot>();
        let body_offset = align_up(slots_end, payload.align());
        let size = body_offset + payload.size();
        let align = mem::align_of::<Work>().max(payload.align());
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| AllocError::new(Layout::new::<Work>()))?;

        unsafe {
            let base = alloc::alloc(layout);
            if base.is_null() {
                return Err(AllocError::new(layout));
            }
            (base as *mut Work).write(Work::new(invoke));
            let behaviour = base.add(mem::size_of::<Work>()) as *mut BehaviourCore;
            behaviour.write(BehaviourCore {
                exec_count_down: AtomicUsize::new(count + 1),
                count,
                layout,
            });
            Ok(NonNull::new_unchecked(behaviour))
        }
    }

    /// Number of slots.
    pub fn get_count(&self) -> usize {
        self.count
    }

    /// Pointer to the inline slot array.
    pub fn get_slots(&self) -> *mut Slot {
        unsafe {
            (self as *const BehaviourCore as *mut u8).add(mem::size_of::<BehaviourCore>())
                as *mut Slot
        }
    }

    /// Pointer to the trailing payload.
    ///
    /// `T` must be the payload type the behaviour was made for; its
    /// alignment determines the payload offset.
    pub fn get_body<T>(&self) -> *mut T {
        let slots_end = self.get_slots() as usize + self.count * mem::size_of::<Slot>();
        align_up(slots_end, mem::align_of::<T>()) as *mut T
    }

    /// The behaviour's work header.
    pub fn as_work(&self) -> NonNull<Work> {
        unsafe {
            NonNull::new_unchecked(
                (self as *const BehaviourCore as *mut u8).sub(mem::size_of::<Work>())
                    as *mut Work,
            )
        }
    }

    /// Recover the behaviour from its work header.
    ///
    /// # Safety
    ///
    /// `work` must have been produced by [`BehaviourCore::make`].
    pub unsafe fn from_work(work: NonNull<Work>) -> NonNull<BehaviourCore> {
        NonNull::new_unchecked(
            (work.as_ptr() as *mut u8).add(mem::size_of::<Work>()) as *mut BehaviourCore
        )
    }

    /// Payload pointer straight from a work header.
    ///
    /// # Safety
    ///
    /// Same contract as [`BehaviourCore::from_work`], with `T` matching
    /// the payload type.
    pub unsafe fn body_from_work<T>(work: NonNull<Work>) -> *mut T {
        Self::from_work(work).as_ref().get_body::<T>()
    }

    /// Remove `n` outstanding dependencies; when none remain, hand the
    /// behaviour's work to the scheduler. `fifo = false` requests
    /// front-of-queue placement on the current core.
    pub(crate) fn resolve(&self, n: usize, fifo: bool) {
        // The final decrement is not performed; reaching it means no one
        // else can observe the count, so the store would be dead.
        if self.exec_count_down.load(Ordering::Acquire) == n
            || self.exec_count_down.fetch_sub(n, Ordering::AcqRel) == n
        {
            if log::would_log(log::LogLevel::Trace) {
                log::trace(&format!("behaviour {:p} runnable", self));
            }
            unsafe { threadpool::schedule_work(self.as_work(), fifo) };
        }
    }

    /// Settle the reference-count debt on `cown`: `transfer` references
    /// were handed to us by the caller, `required` are needed by the
    /// chain. Acquires or releases the difference.
    unsafe fn acquire_with_transfer(cown: *mut Cown, transfer: usize, required: usize) {
        let cown = NonNull::new_unchecked(cown);
        if transfer > required {
            for _ in 0..transfer - required {
                Cown::release(cown);
            }
        } else {
            for _ in 0..required - transfer {
                Cown::acquire(cown);
            }
        }
    }

    /// Attach a reader-headed chain. Returns the reference count the
    /// chain acquired (1 when these are the first readers in) and whether
    /// the readers may start now.
    unsafe fn handle_read_only_enqueue(
        prev_slot: *mut Slot,
        chain_first_slot: *mut Slot,
        first_consecutive_readers: usize,
        cown: &Cown,
    ) -> (usize, bool) {
        if !prev_slot.is_null()
            && (*prev_slot).set_next_slot_reader_contended(chain_first_slot)
        {
            // Linked behind a writer or a blocked reader; the predecessor
            // wakes us.
            return (0, false);
        }

        // Predecessor is an open read front (or absent): join it.
        let first_reader = cown.read_ref_count.add_read(first_consecutive_readers);
        (usize::from(first_reader), true)
    }

    /// Release every slot after the behaviour has executed, waking
    /// successors.
    ///
    /// # Safety
    ///
    /// The behaviour must have been scheduled and run exactly once since
    /// its slots were last reset.
    pub unsafe fn release_all(&self) {
        let slots = self.get_slots();
        for i in 0..self.count {
            (*slots.add(i)).release();
        }
    }

    /// Make the behaviour look like it was never scheduled, so it can be
    /// scheduled again.
    fn reset(&self) {
        let slots = self.get_slots();
        for i in 0..self.count {
            unsafe { (*slots.add(i)).reset_status() };
        }
        self.exec_count_down
            .store(self.count + 1, Ordering::Release);
    }

    /// Completion entry point, called by the behaviour's invoke function
    /// as its last act. Releases all slots, then frees the allocation —
    /// or resets it for reuse when `reuse` is true (the caller later
    /// frees it with [`BehaviourCore::dealloc`]).
    ///
    /// # Safety
    ///
    /// `work` must have been produced by [`BehaviourCore::make`], the
    /// behaviour must have just run, and the payload must already be
    /// dropped unless `reuse` is requested.
    pub unsafe fn finished(work: NonNull<Work>, reuse: bool) {
        let behaviour = Self::from_work(work);
        behaviour.as_ref().release_all();
        if reuse {
            behaviour.as_ref().reset();
        } else {
            let layout = behaviour.as_ref().layout;
            Work::dealloc_raw(work, layout);
        }
    }

    /// Free a behaviour that was finished with `reuse = true`.
    ///
    /// # Safety
    ///
    /// The behaviour must not be scheduled and its payload must already
    /// be dropped.
    pub unsafe fn dealloc(&self) {
        Work::dealloc_raw(self.as_work(), self.layout);
    }

    /// Atomically schedule a group of behaviours.
    ///
    /// Each behaviour's slots must be filled with the cowns it wants and
    /// the requested access mode. Within the group, behaviours are
    /// ordered by their position in `bodies`; on every shared cown the
    /// group's members are installed as one contiguous chain segment, so
    /// nothing scheduled elsewhere can interleave with them.
    ///
    /// # Safety
    ///
    /// Every body must come from [`BehaviourCore::make`], with every slot
    /// initialised and not currently scheduled. Ownership of the bodies
    /// passes to the scheduler.
    pub unsafe fn schedule_many(bodies: &[NonNull<BehaviourCore>]) {
        if log::would_log(log::LogLevel::Debug) {
            log::debug(&format!("schedule_many: {} bodies", bodies.len()));
        }

        let cown_count: usize = bodies.iter().map(|b| b.as_ref().count).sum();

        // Dependencies resolved per body by this call. Starts at one: the
        // guard slot in exec_count_down, released once phase 3 is done.
        let mut ec = vec![1usize; bodies.len()];

        // One entry per requested cown: (body index, slot).
        let mut requests: Vec<(usize, *mut Slot)> = Vec::with_capacity(cown_count);
        for (i, body) in bodies.iter().enumerate() {
            let slots = body.as_ref().get_slots();
            for j in 0..body.as_ref().count {
                requests.push((i, slots.add(j)));
            }
        }

        // Sort by cown, then submission order, with writers ahead of
        // readers within one body. One global acquisition order is what
        // makes cycles between concurrent groups impossible; the
        // writer-first rule means a body that wants both access modes on
        // one cown keeps the write and drops the read.
        if cown_count > 1 {
            requests.sort_by_key(|&(body_index, slot)| unsafe {
                (
                    (*(*slot).cown()).order(),
                    body_index,
                    (*slot).is_read_only(),
                )
            });
        }

        // Phase 1 — prepare. For every run of same-cown requests, build
        // the chain segment: link adjacent slots, coalesce duplicates
        // within a body, and record what the later phases need.
        let mut chains: Vec<ChainInfo> = Vec::with_capacity(cown_count);
        let mut i = 0;
        while i < cown_count {
            let (first_body_index, first_slot) = requests[i];
            let cown = (*first_slot).cown();
            let mut body = bodies[first_body_index].as_ptr();
            let mut transfer_count = (*first_slot).take_move();
            let mut first_writer: *mut BehaviourCore = if (*first_slot).is_read_only() {
                std::ptr::null_mut()
            } else {
                body
            };
            let mut first_reader_bodies = Vec::new();
            if first_writer.is_null() {
                first_reader_bodies.push(first_body_index);
            }
            let mut curr_slot = first_slot;

            loop {
                i += 1;
                if i >= cown_count || (*requests[i].1).cown() != cown {
                    break;
                }
                let (body_index, slot_next) = requests[i];
                let body_next = bodies[body_index].as_ptr();
                transfer_count += (*slot_next).take_move();

                if body_next == body {
                    // Duplicate cown within one behaviour: it cannot wait
                    // for itself, so drop the slot and credit the body.
                    ec[body_index] += 1;
                    (*slot_next).set_cown_null();
                    continue;
                }

                if (*slot_next).is_read_only() {
                    (*curr_slot).set_next_slot_reader_uncontended(slot_next);
                    if first_writer.is_null() {
                        first_reader_bodies.push(body_index);
                    }
                } else {
                    if first_writer.is_null() {
                        first_writer = body_next;
                    }
                    (*curr_slot).set_next_slot_writer_uncontended(body_next);
                }

                if (*curr_slot).is_read_only() {
                    (*curr_slot).set_behaviour(body);
                }
                body = body_next;
                curr_slot = slot_next;
            }

            if (*curr_slot).is_read_only() {
                (*curr_slot).set_behaviour(body);
            }

            // The tail is the slot exchanged into the cown; it must read
            // as Wait until phase 3 publishes it.
            (*curr_slot).reset_status();

            chains.push(ChainInfo {
                cown,
                first_body_index,
                first_slot,
                last_slot: curr_slot,
                transfer_count,
                had_no_predecessor: false,
                ref_count: 0,
                read_only_can_run: false,
                first_writer,
                first_reader_bodies,
            });
        }

        // Phase 2 — acquire. Swap each chain onto its cown's tail, in
        // sorted cown order. A predecessor still in its own acquire phase
        // is waited out; this is the cross-group serialisation point.
        for chain in chains.iter_mut() {
            let cown = &*chain.cown;
            let prev = cown.last_slot.swap(chain.last_slot, Ordering::AcqRel);

            if prev.is_null() {
                chain.had_no_predecessor = true;
                if (*chain.first_slot).is_read_only() {
                    let (rc, can_run) = Self::handle_read_only_enqueue(
                        std::ptr::null_mut(),
                        chain.first_slot,
                        chain.first_reader_bodies.len(),
                        cown,
                    );
                    chain.ref_count = rc;
                    chain.read_only_can_run = can_run;
                }
                continue;
            }

            let backoff = Backoff::new();
            while (*prev).is_wait_2pl() {
                backoff.snooze();
            }

            if (*chain.first_slot).is_read_only() {
                let (rc, can_run) = Self::handle_read_only_enqueue(
                    prev,
                    chain.first_slot,
                    chain.first_reader_bodies.len(),
                    cown,
                );
                chain.ref_count = rc;
                chain.read_only_can_run = can_run;
                continue;
            }

            let first_body = bodies[chain.first_body_index].as_ptr();
            if !(*prev).set_next_slot_writer_contended(first_body) {
                // The predecessor is an open read front; this writer must
                // park on the cown instead (phase 4).
                chain.read_only_can_run = true;
            }
        }

        // Phase 3 — release. Publish every tail, which is what lets
        // later groups link behind us. Until this point the behaviours
        // cannot run: the guard dependency is still unresolved.
        for chain in &chains {
            let tail = &*chain.last_slot;
            if (chain.had_no_predecessor || chain.read_only_can_run)
                && chain.first_writer.is_null()
            {
                tail.set_read_available_uncontended();
            } else {
                tail.set_ready();
            }
        }

        // Phase 4 — process and resolve. Settle each chain's reference
        // counting, decide whether its head can start, and resolve each
        // body for every dependency satisfied here.
        for chain in &chains {
            let cown = &*chain.cown;
            let first_body = bodies[chain.first_body_index].as_ptr();

            let mut ref_count = chain.ref_count;
            if chain.had_no_predecessor {
                // The chain entry itself holds one reference.
                ref_count += 1;
            }
            Self::acquire_with_transfer(chain.cown, chain.transfer_count, ref_count);

            if chain.had_no_predecessor || chain.read_only_can_run {
                if !(*chain.first_slot).is_read_only() {
                    if cown.read_ref_count.try_write() {
                        ec[chain.first_body_index] += 1;
                    } else {
                        // A read front is still draining; its last reader
                        // wakes us.
                        cown.next_writer.store(first_body, Ordering::Release);
                    }
                    continue;
                }

                if !chain.first_writer.is_null() {
                    // Reader-headed chain with an embedded writer: park
                    // the writer behind the readers just counted in.
                    let writable = cown.read_ref_count.try_write();
                    debug_assert!(!writable);
                    cown.next_writer.store(chain.first_writer, Ordering::Release);
                }
            }

            if chain.read_only_can_run {
                for &body_index in &chain.first_reader_bodies {
                    ec[body_index] += 1;
                }
            }
        }

        for (k, body) in bodies.iter().enumerate() {
            body.as_ref().resolve(ec[k], true);
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
