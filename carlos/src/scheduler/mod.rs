//! Scheduler: single-flight dispatch of due recordings onto the receiver.
//!
//! - [`BusyFlag`] owns the receiver; the HTTP layer only gets a [`BusyObserver`]
//! - [`RefreshSignal`] tells the loop its candidate list is stale
//! - [`Scheduler`] is the loop itself, driven by [`Scheduler::run`] or one
//!   [`Scheduler::tick`] at a time

mod busy;
mod clock;
mod notify;
mod service;
mod worker;

pub use busy::{BusyFlag, BusyGuard, BusyObserver};
pub use clock::{Clock, ManualClock, SystemClock};
pub use notify::RefreshSignal;
pub use service::{Scheduler, SchedulerConfig, SchedulerEvent, TickOutcome};
pub use worker::{WorkerReport, finalize};
