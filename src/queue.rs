//! Multiple-producer multiple-consumer queue with steal-all.
//!
//! This is the scheduler queue attached to each core. It is an intrusive
//! FIFO over [`Work`] items, linked through their `next_in_queue` field.
//!
//! The queue has two ends:
//!
//! - the back end is used by any thread via [`MpmcQueue::enqueue`], FIFO
//!   with respect to `dequeue`;
//! - the front end is used by any thread via [`MpmcQueue::dequeue`] and
//!   [`MpmcQueue::dequeue_all`]. A `dequeue` may miss an element whose
//!   producer has exchanged the back but not yet published the link, and
//!   spuriously report empty; callers must be prepared to retry later.
//!
//! The empty queue has the back pointing at the front cell, so moving from
//! empty to non-empty takes no branch. The front cell is boxed so its
//! address survives moves of the queue value itself.
//!
//! The queue never loses an item; reordering is possible only between
//! concurrent producers, never between one producer's successive enqueues.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::work::Work;

/// Intrusive MPMC FIFO over [`Work`].
pub struct MpmcQueue {
    /// Points at the front cell when empty, otherwise at the last
    /// element's `next_in_queue`.
    back: AtomicPtr<AtomicPtr<Work>>,
    /// Multi-threaded consumer end. Boxed for address stability.
    front: Box<AtomicPtr<Work>>,
}

// Queued Work pointers are handed between threads by design.
unsafe impl Send for MpmcQueue {}
unsafe impl Sync for MpmcQueue {}

/// A detached run of queue elements, produced by [`MpmcQueue::dequeue_all`].
pub struct Segment {
    start: *mut Work,
    end: *mut AtomicPtr<Work>,
}

impl Segment {
    /// Remove the first element of the segment in place.
    ///
    /// Returns `None` when the segment is drained down to its final
    /// element or an element whose link is not yet published; use
    /// [`Segment::take_last`] for the final element.
    pub fn take_one(&mut self) -> Option<NonNull<Work>> {
        let n = NonNull::new(self.start)?;
        let next = unsafe { n.as_ref().next_in_queue.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        self.start = next;
        Some(n)
    }

    /// Take the final element, if the segment provably ends at it.
    pub fn take_last(&mut self) -> Option<NonNull<Work>> {
        let n = NonNull::new(self.start)?;
        if ptr::eq(
            unsafe { &n.as_ref().next_in_queue } as *const AtomicPtr<Work>,
            self.end,
        ) {
            self.start = ptr::null_mut();
            return Some(n);
        }
        None
    }
}

impl MpmcQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let front = Box::new(AtomicPtr::new(ptr::null_mut()));
        let back = AtomicPtr::new(&*front as *const AtomicPtr<Work> as *mut AtomicPtr<Work>);
        Self { back, front }
    }

    fn front_cell(&self) -> *mut AtomicPtr<Work> {
        &*self.front as *const AtomicPtr<Work> as *mut AtomicPtr<Work>
    }

    /// Make the queue appear empty to other removal operations, returning
    /// the previous head (or null).
    fn acquire_front(&self) -> *mut Work {
        if self.front.load(Ordering::Relaxed).is_null() {
            return ptr::null_mut();
        }
        // Like locking the queue for other removals.
        self.front.swap(ptr::null_mut(), Ordering::Acquire)
    }

    /// Append a pre-linked run of elements in one exchange.
    ///
    /// # Safety
    ///
    /// `start` must be the head of a chain whose final element's
    /// `next_in_queue` is `end`; every element must stay alive until
    /// dequeued.
    pub unsafe fn enqueue_segment(&self, start: NonNull<Work>, end: &AtomicPtr<Work>) {
        end.store(ptr::null_mut(), Ordering::Relaxed);

        let prev = self
            .back
            .swap(end as *const AtomicPtr<Work> as *mut AtomicPtr<Work>, Ordering::AcqRel);

        // The cell we write into published a null link before it was
        // exchanged in, and an element with a null link cannot be removed,
        // so this store is the only writer.
        debug_assert!((*prev).load(Ordering::Relaxed).is_null());
        (*prev).store(start.as_ptr(), Ordering::Release);
    }

    /// Enqueue one item at the back (FIFO end).
    ///
    /// # Safety
    ///
    /// `node` must stay alive until dequeued and must not already be in a
    /// queue.
    pub unsafe fn enqueue(&self, node: NonNull<Work>) {
        let end = &node.as_ref().next_in_queue as *const AtomicPtr<Work>;
        self.enqueue_segment(node, &*end);
    }

    /// Enqueue one item at the front (LIFO end), so it is dequeued next.
    ///
    /// # Safety
    ///
    /// Same contract as [`MpmcQueue::enqueue`].
    pub unsafe fn enqueue_front(&self, node: NonNull<Work>) {
        let old_front = self.acquire_front();
        if old_front.is_null() {
            // Queue empty (or mid-removal); post to the back instead.
            self.enqueue(node);
            return;
        }
        node.as_ref()
            .next_in_queue
            .store(old_front, Ordering::Relaxed);
        self.front.store(node.as_ptr(), Ordering::Release);
    }

    /// Take one element from the queue.
    ///
    /// May spuriously return `None` while a producer is mid-publication;
    /// callers retry later.
    pub fn dequeue(&self) -> Option<NonNull<Work>> {
        let old_front = self.acquire_front();
        let old_front = NonNull::new(old_front)?;

        let new_front = unsafe { old_front.as_ref().next_in_queue.load(Ordering::Acquire) };
        if !new_front.is_null() {
            self.front.store(new_front, Ordering::Release);
            return Some(old_front);
        }

        // Single element: attempt to close the queue back to empty.
        let next_ptr =
            unsafe { &old_front.as_ref().next_in_queue } as *const AtomicPtr<Work> as *mut _;
        if self
            .back
            .compare_exchange(next_ptr, self.front_cell(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(old_front);
        }

        // A producer is appending behind this element; put the head back
        // and let a later dequeue see the completed link.
        self.front.store(old_front.as_ptr(), Ordering::Release);
        None
    }

    /// Detach every element currently in the queue.
    ///
    /// May spuriously return `None` when racing another removal.
    pub fn dequeue_all(&self) -> Option<Segment> {
        let old_front = self.acquire_front();
        if old_front.is_null() {
            return None;
        }
        let old_back = self.back.swap(self.front_cell(), Ordering::AcqRel);
        Some(Segment {
            start: old_front,
            end: old_back,
        })
    }

    /// True when the queue is structurally empty.
    pub fn is_empty(&self) -> bool {
        self.back.load(Ordering::Relaxed) == self.front_cell()
    }
}

impl Default for MpmcQueue {
    fn default() -> Self {
        Self::new()
    }
}
