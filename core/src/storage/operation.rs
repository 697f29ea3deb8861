//! Operation handles
//!
//! Every task that produces a result hands an [`Operation`] back to the
//! caller while the worker keeps the matching [`Completer`]. Progress only
//! ever moves forward and the result is delivered exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, StorageError};

/// How often [`Operation::wait_with_progress`] samples progress
const PROGRESS_POLL: Duration = Duration::from_millis(5);

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    /// `f32` bits; non-negative floats order the same as their bits
    progress: AtomicU32,
    cancelled: AtomicBool,
}

impl<T> Shared<T> {
    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        lock_or_recover(&self.slot, "operation")
    }
}

/// Caller side of a queued task
pub struct Operation<T> {
    shared: Arc<Shared<T>>,
}

/// Worker side of a queued task
///
/// Dropping a completer without completing it fails the operation with
/// [`StorageError::WorkerStopped`].
pub struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Create a linked operation and completer
pub fn operation<T>() -> (Operation<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
        progress: AtomicU32::new(0.0f32.to_bits()),
        cancelled: AtomicBool::new(false),
    });
    (
        Operation {
            shared: Arc::clone(&shared),
        },
        Completer {
            shared: Some(shared),
        },
    )
}

impl<T> Operation<T> {
    /// An operation that has already finished
    pub fn ready(result: Result<T>) -> Self {
        let (operation, completer) = operation();
        completer.complete(result);
        operation
    }

    /// Fraction of the work done, in `0.0..=1.0`
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.shared.progress.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.slot(), Slot::Pending)
    }

    /// Ask the worker to skip this task
    ///
    /// A task that has not started completes with
    /// [`StorageError::Cancelled`]; one already running finishes normally.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Block until the task completes
    pub fn wait(self) -> Result<T> {
        let mut slot = self.shared.slot();
        while matches!(*slot, Slot::Pending) {
            slot = self.shared.ready.wait(slot).unwrap_or_else(|e| {
                warn!("operation wait mutex poisoned; continuing");
                e.into_inner()
            });
        }
        take(&mut slot)
    }

    /// Block until the task completes, reporting progress as it changes
    pub fn wait_with_progress(self, mut on_progress: impl FnMut(f32)) -> Result<T> {
        let mut reported = -1.0f32;
        let mut slot = self.shared.slot();
        loop {
            let progress = f32::from_bits(self.shared.progress.load(Ordering::Acquire));
            if progress > reported {
                reported = progress;
                on_progress(progress);
            }
            if !matches!(*slot, Slot::Pending) {
                return take(&mut slot);
            }
            slot = match self.shared.ready.wait_timeout(slot, PROGRESS_POLL) {
                Ok((slot, _)) => slot,
                Err(e) => {
                    warn!("operation wait mutex poisoned; continuing");
                    e.into_inner().0
                }
            };
        }
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("progress", &self.progress())
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> Completer<T> {
    /// Record progress; values below the current progress are ignored
    pub fn report_progress(&self, progress: f32) {
        if let Some(shared) = &self.shared {
            let progress = progress.clamp(0.0, 1.0);
            shared
                .progress
                .fetch_max(progress.to_bits(), Ordering::AcqRel);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.cancelled.load(Ordering::Acquire))
    }

    /// Deliver the result and wake the waiter
    pub fn complete(mut self, result: Result<T>) {
        if let Some(shared) = self.shared.take() {
            finish(&shared, result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            finish(&shared, Err(StorageError::WorkerStopped));
        }
    }
}

fn finish<T>(shared: &Shared<T>, result: Result<T>) {
    if result.is_ok() {
        shared
            .progress
            .fetch_max(1.0f32.to_bits(), Ordering::AcqRel);
    }
    let mut slot = shared.slot();
    if matches!(*slot, Slot::Pending) {
        *slot = Slot::Ready(result);
    }
    drop(slot);
    shared.ready.notify_all();
}

fn take<T>(slot: &mut Slot<T>) -> Result<T> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Ready(result) => result,
        // wait() consumes the operation, so a result can only be taken once
        Slot::Pending | Slot::Taken => Err(StorageError::WorkerStopped),
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{what} mutex poisoned; continuing");
        e.into_inner()
    })
}
