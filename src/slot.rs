//! Wait-chain slots.
//!
//! A [`Slot`] is one cown request inside a behaviour: a node in that
//! cown's MCS-style wait chain. The slot packs the cown pointer with two
//! request flags, and runs a small state machine in its `status` word that
//! carries the chain links.
//!
//! Status states:
//!
//! - `Wait` — the owning behaviour has not finished its acquire phase;
//!   successors spin on this.
//! - `Ready` — acquire phase complete; a successor may link itself.
//! - `ReadAvailable` — acquire complete and the cown is in read mode with
//!   no writer in front; subsequent readers may start immediately.
//! - `ChainClosed` — the successor has taken over the chain; when the
//!   behaviour holding this slot completes it can drop out without
//!   notifying anyone.
//! - `Next(Slot)` / `Next(Behaviour)` — link to the next reader slot or
//!   the next writer behaviour, tagged in the pointer's bottom bit.
//!
//! The only contended transition is from `Ready`, where the owner racing
//! to `ReadAvailable` and a successor racing to `Next(_)` are resolved by
//! a single compare-exchange.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::behaviour::BehaviourCore;
use crate::cown::{Cown, ReadStatus};
use crate::log;

// Low bits of the cown word.
const COWN_MOVE_FLAG: usize = 0x1;
const COWN_READER_FLAG: usize = 0x2;
const COWN_POINTER_MASK: usize = !(COWN_MOVE_FLAG | COWN_READER_FLAG);

// Status word values below the pointer range.
const STATUS_WAIT: usize = 0x0;
const STATUS_READY: usize = 0x1;
const STATUS_READ_AVAILABLE: usize = 0x2;
const STATUS_CHAIN_CLOSED: usize = 0x3;
// Bottom bit of a linked pointer: set means next is a reader slot, clear
// means next is a writer behaviour.
const STATUS_READ_FLAG: usize = 0x1;
const STATUS_NEXT_MASK: usize = !0x3;

/// Decoded view of a slot's status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotStatus {
    /// Acquire phase incomplete.
    Wait,
    /// Acquire phase complete, no successor yet.
    Ready,
    /// Read front is open; later readers start immediately.
    ReadAvailable,
    /// Successor has taken over the chain.
    ChainClosed,
    /// Next entry is a reader slot.
    NextSlot(*mut Slot),
    /// Next entry is a writer behaviour.
    NextBehaviour(*mut BehaviourCore),
}

impl SlotStatus {
    pub(crate) fn decode(word: usize) -> Self {
        match word {
            STATUS_WAIT => SlotStatus::Wait,
            STATUS_READY => SlotStatus::Ready,
            STATUS_READ_AVAILABLE => SlotStatus::ReadAvailable,
            STATUS_CHAIN_CLOSED => SlotStatus::ChainClosed,
            w if w & STATUS_READ_FLAG != 0 => {
                SlotStatus::NextSlot((w & STATUS_NEXT_MASK) as *mut Slot)
            }
            w => SlotStatus::NextBehaviour((w & STATUS_NEXT_MASK) as *mut BehaviourCore),
        }
    }
}

/// One cown request inside a behaviour; a node in the cown's wait chain.
///
/// Slots live inside the behaviour allocation and are never freed on
/// their own. The embedder fills each slot with [`Slot::new`] before the
/// behaviour is scheduled.
#[repr(C)]
pub struct Slot {
    /// Cown pointer packed with the MOVE and READER flags. Mutated only by
    /// the thread driving the behaviour's scheduling; ordering is
    /// piggybacked on `status` publications.
    cown_word: AtomicUsize,
    status: AtomicUsize,
    /// Behaviour owning this slot; set for reader slots only. Writers are
    /// reached directly through chain links.
    behaviour: AtomicPtr<BehaviourCore>,
}

const _: () = assert!(std::mem::size_of::<Slot>() % std::mem::size_of::<usize>() == 0);

impl Slot {
    /// Construct a slot requesting `cown` for writing (`reader = false`)
    /// or reading (`reader = true`).
    pub fn new(cown: NonNull<Cown>, reader: bool) -> Self {
        let addr = cown.as_ptr() as usize;
        debug_assert_eq!(addr & !COWN_POINTER_MASK, 0);
        Self {
            cown_word: AtomicUsize::new(addr | if reader { COWN_READER_FLAG } else { 0 }),
            status: AtomicUsize::new(STATUS_WAIT),
            behaviour: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The requested cown; null when the slot was coalesced as a
    /// duplicate.
    pub fn cown(&self) -> *mut Cown {
        (self.cown_word.load(Ordering::Relaxed) & COWN_POINTER_MASK) as *mut Cown
    }

    /// True when the slot requests shared (read) access.
    pub fn is_read_only(&self) -> bool {
        self.cown_word.load(Ordering::Relaxed) & COWN_READER_FLAG != 0
    }

    /// Mark the slot as carrying one strong reference transferred from
    /// the caller.
    pub fn set_move(&self) {
        self.cown_word
            .fetch_or(COWN_MOVE_FLAG, Ordering::Relaxed);
    }

    /// Consume the transfer flag. Returns how many references were
    /// transferred (0 or 1).
    pub(crate) fn take_move(&self) -> usize {
        debug_assert!(self.status.load(Ordering::Relaxed) <= STATUS_READY);
        let word = self.cown_word.load(Ordering::Relaxed);
        if word & COWN_MOVE_FLAG == 0 {
            return 0;
        }
        self.cown_word
            .store(word & !COWN_MOVE_FLAG, Ordering::Relaxed);
        1
    }

    /// Null the cown pointer; used when a behaviour requests the same
    /// cown more than once and all but one slot is coalesced away.
    pub(crate) fn set_cown_null(&self) {
        self.cown_word.store(0, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> SlotStatus {
        SlotStatus::decode(self.status.load(Ordering::Acquire))
    }

    /// True while the owning behaviour's acquire phase is incomplete.
    pub(crate) fn is_wait_2pl(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_WAIT
    }

    /// True while no successor has responded on this slot.
    pub(crate) fn no_successor_response(&self) -> bool {
        self.status.load(Ordering::Acquire) < STATUS_CHAIN_CLOSED
    }

    /// Publish the end of the acquire phase.
    pub(crate) fn set_ready(&self) {
        self.status.store(STATUS_READY, Ordering::Release);
    }

    /// Reset to `Wait` so the slot can be scheduled (again).
    pub(crate) fn reset_status(&self) {
        self.status.store(STATUS_WAIT, Ordering::Release);
    }

    /// Open the read front on a chain head that never saw contention.
    pub(crate) fn set_read_available_uncontended(&self) {
        debug_assert!(self.is_read_only());
        debug_assert_eq!(self.status.load(Ordering::Relaxed), STATUS_WAIT);
        self.status.store(STATUS_READ_AVAILABLE, Ordering::Release);
    }

    /// Open the read front on a slot that may concurrently gain a
    /// successor. Returns false if a successor won the race.
    #[must_use]
    pub(crate) fn set_read_available_contended(&self) -> bool {
        debug_assert!(self.is_read_only());
        debug_assert_ne!(self.status.load(Ordering::Relaxed), STATUS_WAIT);
        self.status.load(Ordering::Acquire) == STATUS_READY
            && self
                .status
                .compare_exchange(
                    STATUS_READY,
                    STATUS_READ_AVAILABLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    /// True when the linked successor is a reader slot.
    pub(crate) fn is_next_slot_read_only(&self) -> bool {
        debug_assert!(!self.no_successor_response());
        self.status.load(Ordering::Acquire) & STATUS_READ_FLAG != 0
    }

    /// The linked reader slot.
    pub(crate) fn next_slot(&self) -> *mut Slot {
        debug_assert!(self.is_next_slot_read_only());
        (self.status.load(Ordering::Acquire) & STATUS_NEXT_MASK) as *mut Slot
    }

    /// The linked writer behaviour.
    pub(crate) fn next_behaviour(&self) -> *mut BehaviourCore {
        debug_assert!(!self.is_next_slot_read_only());
        (self.status.load(Ordering::Acquire) & STATUS_NEXT_MASK) as *mut BehaviourCore
    }

    /// Link a reader successor while this slot is still private to the
    /// scheduling thread (chain segment construction).
    pub(crate) fn set_next_slot_reader_uncontended(&self, next: *mut Slot) {
        debug_assert_eq!(next as usize & !STATUS_NEXT_MASK, 0);
        debug_assert_eq!(self.status.load(Ordering::Relaxed), STATUS_WAIT);
        self.status
            .store(next as usize | STATUS_READ_FLAG, Ordering::Release);
    }

    /// Link a reader successor onto a published slot.
    ///
    /// Returns false if the slot moved to `ReadAvailable` first, in which
    /// case this slot is marked `ChainClosed` and the successor joins the
    /// open read front instead.
    #[must_use]
    pub(crate) fn set_next_slot_reader_contended(&self, next: *mut Slot) -> bool {
        debug_assert_eq!(next as usize & !STATUS_NEXT_MASK, 0);
        debug_assert!(self.no_successor_response());
        debug_assert!(!self.is_wait_2pl());

        let new_status = next as usize | STATUS_READ_FLAG;
        let success = self.status.load(Ordering::Acquire) == STATUS_READY
            && self
                .status
                .compare_exchange(STATUS_READY, new_status, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if !success {
            self.status.store(STATUS_CHAIN_CLOSED, Ordering::Release);
        }
        success
    }

    /// Link a writer successor while this slot is still private to the
    /// scheduling thread.
    pub(crate) fn set_next_slot_writer_uncontended(&self, next: *mut BehaviourCore) {
        debug_assert_eq!(next as usize & !STATUS_NEXT_MASK, 0);
        debug_assert_eq!(self.status.load(Ordering::Relaxed), STATUS_WAIT);
        self.status.store(next as usize, Ordering::Release);
    }

    /// Link a writer successor onto a published slot.
    ///
    /// Returns false if this slot is a reader that moved to
    /// `ReadAvailable` first; the slot is then marked `ChainClosed` and
    /// the writer must park itself on the cown's `next_writer` instead.
    /// A writer predecessor never contends, since `ReadAvailable` is never
    /// set on a writer slot.
    #[must_use]
    pub(crate) fn set_next_slot_writer_contended(&self, next: *mut BehaviourCore) -> bool {
        debug_assert_eq!(next as usize & !STATUS_NEXT_MASK, 0);

        if !self.is_read_only() {
            self.status.store(next as usize, Ordering::Release);
            return true;
        }

        let success = self.status.load(Ordering::Acquire) == STATUS_READY
            && self
                .status
                .compare_exchange(
                    STATUS_READY,
                    next as usize,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if !success {
            self.status.store(STATUS_CHAIN_CLOSED, Ordering::Release);
        }
        success
    }

    /// Behaviour owning this reader slot.
    pub(crate) fn get_behaviour(&self) -> *mut BehaviourCore {
        debug_assert!(self.is_read_only());
        self.behaviour.load(Ordering::Acquire)
    }

    /// Record the behaviour owning this reader slot.
    pub(crate) fn set_behaviour(&self, behaviour: *mut BehaviourCore) {
        debug_assert!(self.is_read_only());
        self.behaviour.store(behaviour, Ordering::Release);
    }

    /// Release this slot after the owning behaviour has executed.
    ///
    /// Hands the cown to the successor, or closes the chain and drops the
    /// scheduler's reference when there is none.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per scheduled slot, from the behaviour
    /// completion path, after the acquire phase finished.
    pub(crate) unsafe fn release(&self) {
        // A coalesced duplicate has nothing to release.
        if self.cown().is_null() {
            return;
        }

        debug_assert!(!self.is_wait_2pl());
        let cown = &*self.cown();

        if self.no_successor_response() {
            let this = self as *const Slot as *mut Slot;
            if cown
                .last_slot
                .compare_exchange(this, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Chain fully drained.
                if log::would_log(log::LogLevel::Trace) {
                    log::trace(&format!("cown {:p} chain drained", self.cown()));
                }
                if self.is_read_only() {
                    self.drop_read();
                }
                // Drop the reference the scheduler held for the chain.
                Cown::release(NonNull::new_unchecked(self.cown()));
                return;
            }

            // Lost the race: a successor is mid-link. Wait for it to
            // respond on our status word.
            let backoff = Backoff::new();
            while self.no_successor_response() {
                backoff.snooze();
            }
        }

        if self.is_read_only() {
            self.drop_read();
            return;
        }

        if !self.is_next_slot_read_only() {
            // Writer handing over to the next writer.
            (*self.next_behaviour()).resolve(1, true);
            return;
        }

        // Writer waking a chain of readers: open the read front, walk the
        // chain making each reader available, and count them in.
        let first_reader = cown.read_ref_count.add_read(1);
        debug_assert!(first_reader);

        // The open read front holds its own reference on the cown.
        Cown::acquire(NonNull::new_unchecked(self.cown()));

        let mut writer_at_end = false;
        let mut curr = self.next_slot();
        let mut extra_readers = 0usize;
        loop {
            // A chain tail linked to us mid-schedule may not be published
            // yet; wait out its release phase before interpreting it.
            let backoff = Backoff::new();
            while (*curr).is_wait_2pl() {
                backoff.snooze();
            }
            if (*curr).set_read_available_contended() {
                break;
            }
            if !(*curr).is_next_slot_read_only() {
                writer_at_end = true;
                break;
            }
            curr = (*curr).next_slot();
            extra_readers += 1;
        }
        cown.read_ref_count.add_read_walk(extra_readers);

        if writer_at_end {
            // Park the trailing writer; the bit is guaranteed to be set
            // because the readers counted above are still in.
            let writable = cown.read_ref_count.try_write();
            debug_assert!(!writable);
            cown.next_writer
                .store((*curr).next_behaviour(), Ordering::Release);
        }

        let last = curr;
        let mut curr = self.next_slot();
        while !ptr::eq(curr, last) {
            let next = (*curr).next_slot();
            (*(*curr).get_behaviour()).resolve(1, false);
            curr = next;
        }
        (*(*last).get_behaviour()).resolve(1, false);
    }

    /// Leave the read front, waking the parked writer when this was the
    /// last reader out.
    ///
    /// # Safety
    ///
    /// Caller must hold an active read on the slot's cown.
    pub(crate) unsafe fn drop_read(&self) {
        debug_assert!(self.is_read_only());
        let cown = &*self.cown();
        match cown.read_ref_count.release_read() {
            ReadStatus::NotLast => {}
            status => {
                if status == ReadStatus::LastReaderWaitingWriter {
                    self.wakeup_next_writer();
                }
                // Release the read front's reference on the cown.
                Cown::release(NonNull::new_unchecked(self.cown()));
            }
        }
    }

    /// Wake the writer parked behind a drained read front.
    ///
    /// The writer's enqueue may still be publishing `next_writer`; spin
    /// until it lands.
    ///
    /// # Safety
    ///
    /// Caller must have observed `LastReaderWaitingWriter`.
    unsafe fn wakeup_next_writer(&self) {
        let cown = &*self.cown();
        let mut writer = cown.next_writer.load(Ordering::Acquire);
        if writer.is_null() {
            let backoff = Backoff::new();
            loop {
                writer = cown.next_writer.load(Ordering::Acquire);
                if !writer.is_null() {
                    break;
                }
                backoff.snooze();
            }
        }
        cown.next_writer.store(ptr::null_mut(), Ordering::Release);
        (*writer).resolve(1, true);
    }
}
