//! Bounded worker pool for sweep jobs

use anyhow::{Context, Result};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

/// Why a job was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Capacity reached; try again on a later sweep
    #[error("worker pool is at capacity")]
    QueueFull,

    /// A job with the same key is queued or running
    #[error("job already queued or running")]
    AlreadyQueued,
}

/// Fixed-size thread pool with an explicit cap on queued plus running jobs.
///
/// Each job carries a key; a key stays reserved from submission until the
/// job returns (or panics), so the same unit of work never runs twice at
/// once within this process.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    capacity: usize,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Releases a job's key when the job ends, including by panic
struct Slot {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl WorkerPool {
    pub fn new(threads: usize, capacity: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("bazaar-worker-{}", i))
            .build()
            .context("Failed to start worker pool")?;

        Ok(Self {
            pool,
            capacity: capacity.max(1),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Queue `job` under `key`
    pub fn submit<F>(&self, key: impl Into<String>, job: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.contains(&key) {
                return Err(SubmitError::AlreadyQueued);
            }
            if in_flight.len() >= self.capacity {
                return Err(SubmitError::QueueFull);
            }
            in_flight.insert(key.clone());
        }

        let slot = Slot {
            key,
            in_flight: Arc::clone(&self.in_flight),
        };
        self.pool.spawn(move || {
            // rayon aborts the process on an unhandled panic in a spawned job
            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                log::error!(
                    "[SWEEP] Job {} panicked: {}",
                    slot.key,
                    panic_message(panic.as_ref())
                );
            }
            drop(slot);
        });
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
