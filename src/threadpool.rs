//! Cores, worker threads, and the scheduler.
//!
//! One [`Core`] exists per worker thread, holding that worker's queue and
//! its fairness state. The [`Scheduler`] owns the set of cores, boots the
//! workers, and runs the pause/wake protocol that lets the pool quiesce
//! when no work remains.
//!
//! # Worker loop
//!
//! Each worker repeats:
//!
//! 1. if the fairness flag is raised, make one steal attempt even though
//!    local work may exist;
//! 2. take local work;
//! 3. otherwise become a thief: take from the current victim core and
//!    rotate the victim;
//! 4. after a bounded spin with no work anywhere, attempt to pause. The
//!    pause is refused if any queue holds work; the pool terminates when
//!    every worker is paused and no external event source is registered.
//!
//! # Fairness
//!
//! Each core owns a token work item. Draining the token from the queue
//! raises `should_steal_for_fairness` on its home core, forcing the next
//! loop iteration to attempt a steal even with local work pending, then
//! the token re-enqueues itself. When its queue is empty the token parks
//! instead, and the next FIFO enqueue re-seeds it; an idle queue is
//! therefore structurally empty, which is what lets pause decisions be
//! made from queue emptiness alone.

use std::cell::RefCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::error::fatal;
use crate::log;
use crate::queue::MpmcQueue;
use crate::stats::{CoreStats, SchedulerStats};
use crate::work::Work;

/// One scheduler core: a queue plus fairness state, serviced by one
/// worker thread.
pub(crate) struct Core {
    /// Core number (reserved for diagnostics).
    #[allow(dead_code)]
    index: usize,
    pub(crate) queue: MpmcQueue,
    /// Raised by the fairness token; consumed by the worker.
    should_steal_for_fairness: CachePadded<AtomicBool>,
    /// True while the token is out of the queue waiting to be re-seeded.
    token_parked: AtomicBool,
    /// The token work item, allocated once per core.
    token: AtomicPtr<Work>,
    pub(crate) stats: CoreStats,
}

/// Trailer of the fairness token work item.
struct TokenPayload {
    core: NonNull<Core>,
}

unsafe impl Send for TokenPayload {}

/// Body of the fairness token: raise the flag, then re-enqueue or park.
unsafe fn token_invoke(work: NonNull<Work>) {
    let core = (*Work::trailer::<TokenPayload>(work)).core.as_ref();
    core.should_steal_for_fairness
        .store(true, Ordering::Relaxed);
    core.token_parked.store(true, Ordering::Release);
    if !core.queue.is_empty() {
        core.seed_token();
    }
}

impl Core {
    fn new(index: usize) -> Self {
        Self {
            index,
            queue: MpmcQueue::new(),
            should_steal_for_fairness: CachePadded::new(AtomicBool::new(false)),
            token_parked: AtomicBool::new(true),
            token: AtomicPtr::new(ptr::null_mut()),
            stats: CoreStats::default(),
        }
    }

    /// Put the parked token back in the queue, if it is parked.
    fn seed_token(&self) {
        if self.token_parked.swap(false, Ordering::AcqRel) {
            let token = self.token.load(Ordering::Acquire);
            if let Some(token) = NonNull::new(token) {
                unsafe { self.queue.enqueue(token) };
            }
        }
    }

    /// FIFO-enqueue a work item and keep the fairness token live.
    unsafe fn enqueue(&self, work: NonNull<Work>) {
        self.queue.enqueue(work);
        self.seed_token();
    }
}

thread_local! {
    /// Set while the current thread is a scheduler worker.
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

#[derive(Clone)]
struct WorkerContext {
    index: usize,
    cores: Arc<[Core]>,
}

/// State owned by one worker thread.
struct Worker {
    index: usize,
    cores: Arc<[Core]>,
    victim: usize,
    work_stealing: bool,
    spin_timeout: Duration,
}

impl Worker {
    fn run_loop(mut self, scheduler: &'static Scheduler) {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(WorkerContext {
                index: self.index,
                cores: self.cores.clone(),
            })
        });

        while let Some(work) = self.get_work(scheduler) {
            self.cores[self.index].stats.work_run();
            unsafe { Work::run(work) };
        }

        CURRENT.with(|c| *c.borrow_mut() = None);
    }

    fn core(&self) -> &Core {
        &self.cores[self.index]
    }

    /// Block until there is work to run, or the pool terminates.
    fn get_work(&mut self, scheduler: &'static Scheduler) -> Option<NonNull<Work>> {
        if self
            .core()
            .should_steal_for_fairness
            .swap(false, Ordering::Relaxed)
        {
            if let Some(work) = self.try_steal() {
                return Some(work);
            }
        }

        if let Some(work) = self.core().queue.dequeue() {
            return Some(work);
        }

        // The local queue looks empty; behave as if the fairness token
        // fired and try one steal before spinning.
        if let Some(work) = self.try_steal() {
            return Some(work);
        }

        self.steal(scheduler)
    }

    /// One steal attempt from the current victim, rotating the victim
    /// either way.
    fn try_steal(&mut self) -> Option<NonNull<Work>> {
        if !self.work_stealing {
            return None;
        }
        let mut work = None;
        if self.victim != self.index {
            work = self.cores[self.victim].queue.dequeue();
            if work.is_some() {
                self.core().stats.steal();
                if log::would_log(log::LogLevel::Trace) {
                    log::trace(&format!(
                        "worker {} stole from core {}",
                        self.index, self.victim
                    ));
                }
            }
        }
        self.victim = (self.victim + 1) % self.cores.len();
        work
    }

    /// Spin over the local queue and victims; after the quiescence
    /// timeout, try to pause. Returns `None` when the pool terminates.
    fn steal(&mut self, scheduler: &'static Scheduler) -> Option<NonNull<Work>> {
        let mut spin_start = Instant::now();
        let backoff = Backoff::new();

        while scheduler.running.load(Ordering::Acquire) {
            // Another thread may have pushed onto our queue.
            if let Some(work) = self.core().queue.dequeue() {
                return Some(work);
            }
            if let Some(work) = self.try_steal() {
                return Some(work);
            }

            if spin_start.elapsed() < self.spin_timeout {
                backoff.snooze();
                continue;
            }

            // Nothing anywhere for a while: pause until woken.
            self.core().stats.pause();
            if !scheduler.pause() {
                return None;
            }
            backoff.reset();
            spin_start = Instant::now();
        }

        None
    }
}

struct PoolState {
    cores: Option<Arc<[Core]>>,
    total_workers: usize,
    sleeping: usize,
    active: bool,
    work_stealing: bool,
    spin_timeout: Duration,
}

/// The thread pool driving behaviour execution.
///
/// The scheduler is a process-wide singleton, reached through
/// [`Scheduler::get`]. A typical embedding:
///
/// ```rust,ignore
/// use boc_runtime::Scheduler;
///
/// let scheduler = Scheduler::get();
/// scheduler.init(4);
/// // ... schedule initial behaviours ...
/// scheduler.run(); // blocks until quiescent
/// ```
pub struct Scheduler {
    state: Mutex<PoolState>,
    wake: Condvar,
    /// Mirror of `PoolState::sleeping`, readable without the lock.
    sleeping_hint: AtomicUsize,
    /// Cleared to stop the workers.
    running: AtomicBool,
    /// While non-zero, the pool refuses to terminate even when idle.
    external_event_sources: AtomicUsize,
    /// Round-robin cursor for work injected from non-worker threads.
    inject_index: AtomicUsize,
    /// Snapshot from the most recently completed run.
    last_stats: Mutex<SchedulerStats>,
}

static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

impl Scheduler {
    /// The process-wide scheduler.
    pub fn get() -> &'static Scheduler {
        SCHEDULER.get_or_init(|| Scheduler {
            state: Mutex::new(PoolState {
                cores: None,
                total_workers: 0,
                sleeping: 0,
                active: false,
                work_stealing: true,
                spin_timeout: Duration::from_micros(500),
            }),
            wake: Condvar::new(),
            sleeping_hint: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            external_event_sources: AtomicUsize::new(0),
            inject_index: AtomicUsize::new(0),
            last_stats: Mutex::new(SchedulerStats::default()),
        })
    }

    /// Construct `num_workers` cores and make the pool ready to accept
    /// work. Workers do not start until [`Scheduler::run`].
    pub fn init(&self, num_workers: usize) {
        self.init_with_config(&RuntimeConfig {
            scheduler: crate::config::SchedulerConfig {
                num_workers,
                ..Default::default()
            },
            ..Default::default()
        });
    }

    /// [`Scheduler::init`] with full configuration.
    pub fn init_with_config(&self, config: &RuntimeConfig) {
        let num_workers = config.scheduler.num_workers;
        if num_workers == 0 {
            fatal!("scheduler requires at least one worker");
        }

        let mut state = self.state.lock();
        if state.cores.is_some() {
            fatal!("scheduler already initialised");
        }

        let cores: Arc<[Core]> = (0..num_workers).map(Core::new).collect();
        for core in cores.iter() {
            let token = Work::alloc_with_trailer(
                token_invoke,
                TokenPayload {
                    core: NonNull::from(core),
                },
            )
            .unwrap_or_else(|e| e.handle());
            core.token.store(token.as_ptr(), Ordering::Release);
        }

        state.cores = Some(cores);
        state.total_workers = num_workers;
        state.sleeping = 0;
        state.work_stealing = config.scheduler.work_stealing;
        state.spin_timeout = config.scheduler.spin_timeout;
        self.sleeping_hint.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::Release);

        log::debug(&format!("scheduler initialised: {} workers", num_workers));
    }

    /// Start the workers and block until the pool terminates.
    ///
    /// Termination happens when every queue is empty, every worker is
    /// paused, and no external event source is registered. The pool can
    /// be initialised and run again afterwards.
    pub fn run(&self) {
        let (cores, total, work_stealing, spin_timeout) = {
            let mut state = self.state.lock();
            let Some(cores) = state.cores.clone() else {
                fatal!("scheduler run before init");
            };
            if state.active {
                fatal!("scheduler already running");
            }
            state.active = true;
            (
                cores,
                state.total_workers,
                state.work_stealing,
                state.spin_timeout,
            )
        };
        self.running.store(true, Ordering::Release);

        let scheduler: &'static Scheduler = Self::get();
        let mut handles = Vec::with_capacity(total);
        for index in 0..total {
            let worker = Worker {
                index,
                cores: cores.clone(),
                victim: (index + 1) % total,
                work_stealing,
                spin_timeout,
            };
            let handle = thread::Builder::new()
                .name(format!("boc-worker-{}", index))
                .spawn(move || worker.run_loop(scheduler))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        self.teardown();
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        let Some(cores) = state.cores.take() else {
            return;
        };

        let mut stats = SchedulerStats::default();
        for core in cores.iter() {
            stats.add(&core.stats);
            // Only a token can still sit in a queue at termination.
            while let Some(work) = core.queue.dequeue() {
                debug_assert_eq!(work.as_ptr(), core.token.load(Ordering::Relaxed));
                let _ = work;
            }
            let token = core.token.swap(ptr::null_mut(), Ordering::AcqRel);
            if let Some(token) = NonNull::new(token) {
                unsafe { Work::dealloc_with_trailer::<TokenPayload>(token) };
            }
        }

        state.active = false;
        state.total_workers = 0;
        state.sleeping = 0;
        self.sleeping_hint.store(0, Ordering::SeqCst);
        *self.last_stats.lock() = stats;

        if log::would_log(log::LogLevel::Debug) {
            log::LogBuilder::new(log::LogLevel::Debug)
                .message("scheduler terminated")
                .field_uint("works_run", stats.works_run)
                .field_uint("steals", stats.steals)
                .field_uint("pauses", stats.pauses)
                .field_uint("lifo_enqueues", stats.lifo_enqueues)
                .emit();
        }
    }

    /// Aggregate scheduler statistics: live counters while a pool is
    /// initialised, otherwise the snapshot from the last completed run.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        match state.cores.as_ref() {
            Some(cores) => {
                let mut stats = SchedulerStats::default();
                for core in cores.iter() {
                    stats.add(&core.stats);
                }
                stats
            }
            None => *self.last_stats.lock(),
        }
    }

    /// Push a work item for execution.
    ///
    /// From a worker thread this enqueues FIFO on the worker's own core;
    /// from any other thread the item is injected round-robin across the
    /// cores.
    ///
    /// # Safety
    ///
    /// `work` must stay alive until it runs, and must not already be
    /// queued. A non-worker thread scheduling while the pool is running
    /// must hold an external event source registration, or the pool may
    /// terminate under the injection.
    pub unsafe fn schedule(&self, work: NonNull<Work>) {
        schedule_work(work, true);
    }

    /// Push a work item on a specific core's front and wake its worker.
    /// This is the entry point for external event sources: the item runs
    /// ahead of everything already queued on that core.
    ///
    /// # Safety
    ///
    /// Same contract as [`Scheduler::schedule`]; `core` must be a valid
    /// index.
    pub unsafe fn schedule_lifo(&self, core: usize, work: NonNull<Work>) {
        let cores = {
            let state = self.state.lock();
            let Some(cores) = state.cores.clone() else {
                fatal!("schedule_lifo before scheduler init");
            };
            cores
        };
        if core >= cores.len() {
            fatal!("schedule_lifo: core {} out of range", core);
        }
        cores[core].queue.enqueue_front(work);
        cores[core].stats.lifo();
        self.unpause();
    }

    /// The core index of the calling worker thread, if any.
    pub fn current_core(&self) -> Option<usize> {
        CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.index))
    }

    /// Register an external producer of work. While any source is
    /// registered the pool will not terminate, even with every queue
    /// empty.
    pub fn add_external_event_source(&self) {
        let old = self.external_event_sources.fetch_add(1, Ordering::SeqCst);
        if log::would_log(log::LogLevel::Debug) {
            log::debug(&format!("external event sources: {}", old + 1));
        }
    }

    /// Deregister an external producer. Dropping the last source lets an
    /// idle pool terminate.
    pub fn remove_external_event_source(&self) {
        let old = self.external_event_sources.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0, "unbalanced remove_external_event_source");
        if old == 1 {
            // Idle workers must re-evaluate termination.
            self.unpause();
        }
    }

    /// Inject work from a non-worker thread.
    unsafe fn inject(&self, work: NonNull<Work>) {
        let cores = {
            let state = self.state.lock();
            let Some(cores) = state.cores.clone() else {
                fatal!("schedule before scheduler init");
            };
            cores
        };
        let index = self.inject_index.fetch_add(1, Ordering::Relaxed) % cores.len();
        cores[index].enqueue(work);
        self.unpause();
    }

    /// Wake sleeping workers if there are any.
    pub(crate) fn unpause(&self) {
        // Pairs with the fence in `pause`: either this thread sees the
        // sleeper's hint, or the sleeper sees the enqueued work.
        fence(Ordering::SeqCst);
        if self.sleeping_hint.load(Ordering::SeqCst) > 0 {
            let _state = self.state.lock();
            self.wake.notify_all();
        }
    }

    /// Attempt to pause the calling worker. Returns false when the pool
    /// has terminated and the worker should exit.
    fn pause(&self) -> bool {
        let mut state = self.state.lock();

        state.sleeping += 1;
        self.sleeping_hint
            .store(state.sleeping, Ordering::SeqCst);
        // Publish the hint before re-checking the queues, so a concurrent
        // enqueuer either wakes us or we see its work.
        fence(Ordering::SeqCst);

        if self.has_pending_work(&state) {
            state.sleeping -= 1;
            self.sleeping_hint
                .store(state.sleeping, Ordering::SeqCst);
            return true;
        }

        if state.sleeping == state.total_workers
            && self.external_event_sources.load(Ordering::SeqCst) == 0
        {
            // Quiescent: no work can appear any more.
            self.running.store(false, Ordering::Release);
            state.sleeping -= 1;
            self.sleeping_hint
                .store(state.sleeping, Ordering::SeqCst);
            self.wake.notify_all();
            return false;
        }

        self.wake.wait(&mut state);

        state.sleeping -= 1;
        self.sleeping_hint
            .store(state.sleeping, Ordering::SeqCst);
        self.running.load(Ordering::Acquire)
    }

    fn has_pending_work(&self, state: &PoolState) -> bool {
        state
            .cores
            .as_ref()
            .map(|cores| cores.iter().any(|core| !core.queue.is_empty()))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Scheduler")
            .field("workers", &state.total_workers)
            .field("sleeping", &state.sleeping)
            .field("active", &state.active)
            .finish()
    }
}

/// Hand a work item to the scheduler, from anywhere.
///
/// On a worker thread, `fifo` selects between the back and the front of
/// the worker's own queue; front-of-queue placement is used when waking
/// chained readers so they start without requeueing delay. Off-worker,
/// the item is injected round-robin.
///
/// # Safety
///
/// `work` must stay alive until it runs, and must not already be queued.
pub(crate) unsafe fn schedule_work(work: NonNull<Work>, fifo: bool) {
    let scheduler = Scheduler::get();
    let ctx = CURRENT.with(|c| c.borrow().clone());
    match ctx {
        Some(ctx) => {
            let core = &ctx.cores[ctx.index];
            if fifo {
                core.enqueue(work);
            } else {
                core.queue.enqueue_front(work);
                core.stats.lifo();
            }
            scheduler.unpause();
        }
        None => scheduler.inject(work),
    }
}
