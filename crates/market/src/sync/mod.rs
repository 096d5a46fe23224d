//! Incremental sync engine
//!
//! Scheduled runs per `(user, kind)` pair, the bounded worker pool they run
//! on, and the sweep that ties renewals, gap backfills and runs together.
//! A run can be retried safely: upserts are idempotent and the cursor only
//! moves once the run has been finalized.

mod pool;
mod run;
mod scheduler;
mod walk;

pub use pool::{SubmitError, WorkerPool};
pub use run::{ResourceSyncer, RunOutcome};
pub use scheduler::{JobOutcome, SweepJob, SweepReport, SyncScheduler};

pub(crate) use walk::ChangeWalk;
