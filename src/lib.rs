//! # Behaviour-Oriented Concurrency Runtime
//!
//! A runtime for the Behaviour-Oriented Concurrency model. Programs
//! schedule closures ("behaviours") that atomically acquire a set of
//! concurrent owners ("cowns"), run with exclusive write or shared read
//! access to them, and release them in a way that preserves a strict
//! happens-before order between behaviours sharing any cown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        BOC RUNTIME                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐   ┌────────────┐   ┌───────────────────┐     │
//! │  │   when()   │   │  CownPtr   │   │  BehaviourCore    │     │
//! │  │ (when.rs)  │   │ (cown.rs)  │   │ (behaviour.rs)    │     │
//! │  └────────────┘   └────────────┘   └───────────────────┘     │
//! │         │               │                   │                │
//! │         └───────────────┼───────────────────┘                │
//! │                         │                                    │
//! │  ┌────────────┐   ┌────────────┐   ┌───────────────────┐     │
//! │  │    Slot    │   │ MpmcQueue  │   │    Scheduler      │     │
//! │  │ (slot.rs)  │   │ (queue.rs) │   │ (threadpool.rs)   │     │
//! │  └────────────┘   └────────────┘   └───────────────────┘     │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each cown heads an MCS-style wait chain of behaviour slots. Scheduling
//! installs a behaviour's slots on all of its cowns in one global order
//! (two-phase locking at slot granularity), so wait-for cycles cannot
//! form; completed behaviours hand their cowns directly to the next chain
//! entry. Runnable behaviours go to a work-stealing thread pool with a
//! per-core fairness token.
//!
//! ## Example
//!
//! ```rust,ignore
//! use boc_runtime::{when, CownPtr, Read, Write, Scheduler};
//!
//! let scheduler = Scheduler::get();
//! scheduler.init(4);
//!
//! let counter = CownPtr::new(0u64);
//!
//! for _ in 0..10 {
//!     when(Write(counter.clone()), |mut c| *c += 1);
//! }
//! when(Read(counter), |c| assert_eq!(*c, 10));
//!
//! scheduler.run(); // blocks until all behaviours have completed
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod behaviour;
pub mod config;
pub mod cown;
pub mod error;
pub mod log;
pub mod queue;
pub mod slot;
pub mod stats;
pub mod threadpool;
pub mod when;
pub mod work;

// Re-exports
pub use behaviour::BehaviourCore;
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig};
pub use cown::{CownPtr, ReadRefCount, ReadStatus, WeakCown};
pub use error::AllocError;
pub use stats::SchedulerStats;
pub use threadpool::Scheduler;
pub use when::{when, Behaviour, Completion, Move, Prepared, Read, ReadGuard, Requests, Write, WriteGuard};
pub use work::{Closure, Work};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialise the scheduler with `num_workers` workers and default
/// settings.
pub fn init(num_workers: usize) -> &'static Scheduler {
    let scheduler = Scheduler::get();
    scheduler.init(num_workers);
    scheduler
}

/// Initialise the scheduler from a full configuration.
pub fn init_with_config(config: RuntimeConfig) -> &'static Scheduler {
    config.apply_log_settings();
    let scheduler = Scheduler::get();
    scheduler.init_with_config(&config);
    scheduler
}

/// Initialise the scheduler from `BOC_*` environment variables.
pub fn init_from_env() -> Result<&'static Scheduler, ConfigError> {
    Ok(init_with_config(RuntimeConfig::from_env()?))
}
