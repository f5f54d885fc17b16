//! Work items and closures.
//!
//! A [`Work`] is the scheduler's unit: an intrusive queue link plus an
//! invoke function pointer. The invoke function receives the `Work`
//! pointer itself and is the sole authority over the allocation's fate —
//! it may free the block, re-enqueue it, or leave it alive to be finished
//! later. The queue link is a separate field and is never reused by the
//! item after dequeue.
//!
//! [`Closure`] packs an arbitrary Rust closure immediately after the
//! `Work` header in a single allocation, so a scheduled closure costs one
//! allocation and one indirect call.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicPtr;

use crate::error::AllocError;

/// Invoke function for a work item.
///
/// # Safety
///
/// Receives the pointer to the `Work` it was registered with; the function
/// owns the allocation from that point on.
pub type WorkFn = unsafe fn(NonNull<Work>);

/// A schedulable unit of work.
///
/// The layout is stable: embedding types place their state immediately
/// after the `Work` header in the same allocation and recover it with
/// pointer arithmetic.
#[repr(C)]
pub struct Work {
    /// Intrusive link used while the item sits in a queue.
    pub(crate) next_in_queue: AtomicPtr<Work>,
    invoke: WorkFn,
}

// Work items migrate between worker threads through the scheduler queues.
unsafe impl Send for Work {}
unsafe impl Sync for Work {}

impl Work {
    /// Construct a header in place. Embedding types write this at the base
    /// of their own allocation.
    pub(crate) fn new(invoke: WorkFn) -> Self {
        Self {
            next_in_queue: AtomicPtr::new(ptr::null_mut()),
            invoke,
        }
    }

    /// Run the work item.
    ///
    /// # Safety
    ///
    /// `work` must point to a live `Work` that is not queued and is not
    /// being run by another thread. The invoke function may free the
    /// allocation, so `work` must not be used after this call.
    pub unsafe fn run(work: NonNull<Work>) {
        (work.as_ref().invoke)(work)
    }

    /// Layout of a `Work` followed by a `T` trailer, and the trailer's
    /// offset from the base.
    fn trailer_layout<T>() -> Result<(Layout, usize), AllocError> {
        let (layout, offset) = Layout::new::<Work>()
            .extend(Layout::new::<T>())
            .map_err(|_| AllocError::new(Layout::new::<Work>()))?;
        Ok((layout.pad_to_align(), offset))
    }

    /// Allocate a `| Work | T |` block, moving `trailer` into place.
    pub(crate) fn alloc_with_trailer<T>(
        invoke: WorkFn,
        trailer: T,
    ) -> Result<NonNull<Work>, AllocError> {
        let (layout, offset) = Self::trailer_layout::<T>()?;
        unsafe {
            let base = alloc::alloc(layout);
            if base.is_null() {
                return Err(AllocError::new(layout));
            }
            (base as *mut Work).write(Work::new(invoke));
            (base.add(offset) as *mut T).write(trailer);
            Ok(NonNull::new_unchecked(base as *mut Work))
        }
    }

    /// Pointer to the `T` trailer of a block built by `alloc_with_trailer`.
    ///
    /// # Safety
    ///
    /// `work` must have been allocated by `alloc_with_trailer::<T>` with
    /// the same `T`.
    pub(crate) unsafe fn trailer<T>(work: NonNull<Work>) -> *mut T {
        // The layout computation cannot fail if the allocation succeeded.
        let offset = std::mem::size_of::<Work>();
        let offset = (offset + std::mem::align_of::<T>() - 1) & !(std::mem::align_of::<T>() - 1);
        (work.as_ptr() as *mut u8).add(offset) as *mut T
    }

    /// Free a `| Work | T |` block without dropping the trailer.
    ///
    /// # Safety
    ///
    /// `work` must have been allocated by `alloc_with_trailer::<T>`, the
    /// trailer must already have been dropped (or be trivially droppable),
    /// and the item must not be queued.
    pub(crate) unsafe fn dealloc_with_trailer<T>(work: NonNull<Work>) {
        let (layout, _) = Self::trailer_layout::<T>().unwrap_or_else(|e| e.handle());
        alloc::dealloc(work.as_ptr() as *mut u8, layout);
    }

    /// Free a block whose layout is recorded elsewhere.
    ///
    /// # Safety
    ///
    /// `layout` must be the layout the block was allocated with, and the
    /// item must not be queued.
    pub(crate) unsafe fn dealloc_raw(work: NonNull<Work>, layout: Layout) {
        alloc::dealloc(work.as_ptr() as *mut u8, layout);
    }
}

/// Builds a work item from a Rust closure.
pub struct Closure;

impl Closure {
    /// Allocate a work item that runs `f` with the work pointer.
    ///
    /// If `f` returns `true` the closure is destroyed and the block freed;
    /// if it returns `false` the block is left alive and `f` is free to
    /// have re-enqueued it (the fairness token works this way).
    pub fn make<F>(f: F) -> Result<NonNull<Work>, AllocError>
    where
        F: FnMut(NonNull<Work>) -> bool + Send + 'static,
    {
        Work::alloc_with_trailer(Self::invoke::<F>, f)
    }

    unsafe fn invoke<F>(work: NonNull<Work>)
    where
        F: FnMut(NonNull<Work>) -> bool + Send + 'static,
    {
        let f = Work::trailer::<F>(work);
        if (*f)(work) {
            ptr::drop_in_place(f);
            Work::dealloc_with_trailer::<F>(work);
        }
    }
}
