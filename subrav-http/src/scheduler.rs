//! Single-slot FIFO admission control with cooperative cancellation.
//!
//! Per spec §4.1: at most one payable request occupies its prepare→send→
//! classify critical section at a time. Admission is modeled as acquiring
//! the lone permit of a [`tokio::sync::Semaphore`] (which queues waiters
//! FIFO); cancellation before a caller's turn arrives drops out of the
//! queue instead of ever acquiring the permit, while cancellation after
//! admission is left to the caller, who races its own work against the
//! same [`CancellationToken`] used here.
//!
//! Release of the held slot is deliberately independent from whatever
//! future the caller awaits inside its critical section: [`SchedulerSlot::release`]
//! is the only thing that returns the permit, and it is idempotent so the
//! tracker can wire it up as a pending payment's release closure without
//! worrying about double-firing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use subrav::EngineError;

use crate::tracker::ReleaseFn;

/// A held admission slot. Exactly one exists at a time across a scheduler.
pub struct SchedulerSlot {
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl SchedulerSlot {
    /// Returns the slot, advancing the queue. Calling this more than once
    /// has no effect after the first call.
    pub fn release(&self) {
        self.permit.lock().unwrap().take();
    }

    /// Returns a release closure suitable for [`crate::tracker::PendingPaymentTracker::create`].
    #[must_use]
    pub fn release_fn(self: &Arc<Self>) -> ReleaseFn {
        let this = Arc::clone(self);
        Box::new(move || this.release())
    }
}

/// Single-concurrency admission gate.
pub struct RequestScheduler {
    semaphore: Arc<Semaphore>,
    cleared: AtomicBool,
}

impl RequestScheduler {
    /// Creates a scheduler with one slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            cleared: AtomicBool::new(false),
        }
    }

    /// Waits for the single slot to become free, honoring `cancel`.
    ///
    /// If `cancel` fires before the slot is acquired, returns
    /// [`EngineError::Aborted`] without ever taking the slot — the
    /// "pre-start" cancellation path. Callers are responsible for racing
    /// their own request work against `cancel` after admission for the
    /// "post-start" path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CleanedUp`] if [`Self::clear`] was called
    /// before or during the wait, or [`EngineError::Aborted`] if `cancel`
    /// fired first.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<Arc<SchedulerSlot>, EngineError> {
        if self.cleared.load(Ordering::SeqCst) {
            return Err(EngineError::CleanedUp);
        }

        let acquire = self.semaphore.clone().acquire_owned();
        tokio::pin!(acquire);

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Aborted),
            res = &mut acquire => res.map_err(|_| EngineError::CleanedUp)?,
        };

        if self.cleared.load(Ordering::SeqCst) {
            drop(permit);
            return Err(EngineError::CleanedUp);
        }

        Ok(Arc::new(SchedulerSlot {
            permit: Mutex::new(Some(permit)),
        }))
    }

    /// Shuts the scheduler down: the current holder (if any) keeps its
    /// slot until it releases, but every future (and in-flight) [`Self::admit`]
    /// rejects with [`EngineError::CleanedUp`].
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_one_at_a_time() {
        let scheduler = Arc::new(RequestScheduler::new());
        let cancel = CancellationToken::new();

        let first = scheduler.admit(&cancel).await.unwrap();

        let scheduler2 = scheduler.clone();
        let cancel2 = cancel.clone();
        let second_handle = tokio::spawn(async move { scheduler2.admit(&cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_handle.is_finished());

        first.release();
        let second = second_handle.await.unwrap().unwrap();
        second.release();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let scheduler = RequestScheduler::new();
        let cancel = CancellationToken::new();
        let slot = scheduler.admit(&cancel).await.unwrap();
        slot.release();
        slot.release();

        // A second admission should succeed immediately since the permit
        // was only ever returned once.
        let slot2 = scheduler.admit(&cancel).await.unwrap();
        slot2.release();
    }

    #[tokio::test]
    async fn pre_start_cancel_rejects_without_admitting() {
        let scheduler = Arc::new(RequestScheduler::new());
        let holder_cancel = CancellationToken::new();
        let holder = scheduler.admit(&holder_cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let scheduler2 = scheduler.clone();
        let waiter_cancel2 = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { scheduler2.admit(&waiter_cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Aborted)));
        holder.release();
    }

    #[tokio::test]
    async fn clear_rejects_future_admissions() {
        let scheduler = RequestScheduler::new();
        scheduler.clear();
        let cancel = CancellationToken::new();
        let result = scheduler.admit(&cancel).await;
        assert!(matches!(result, Err(EngineError::CleanedUp)));
    }
}
