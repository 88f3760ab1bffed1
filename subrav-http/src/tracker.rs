//! Per-request payment promise and timeout management.
//!
//! Mirrors spec §4.2: one [`PendingPaymentTracker`] per engine instance,
//! holding the in-flight "pending payment" map. Each entry bridges a
//! `tokio::sync::oneshot` promise the caller awaits to a scheduler release
//! closure that must fire exactly once no matter how the entry terminates
//! (resolve, reject, free, or timeout).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use subrav::channel::ChannelId;
use subrav::subrav::SignedSubRav;
use subrav::{BigAmount, EngineError};

use crate::constants::DEFAULT_RECENTLY_REJECTED_TTL;

/// Settlement details delivered to a caller's `payment` future on success.
///
/// `None` (carried as `Option<PaymentInfo>` at the tracker boundary) means
/// the request settled without a protocol header — a free request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInfo {
    /// The cost of this single request.
    pub cost: BigAmount,
    /// The cost converted to USD, if available.
    pub cost_usd: Option<String>,
    /// The nonce of the Sub-RAV the service committed for this settlement.
    pub nonce: BigAmount,
    /// The service-generated settlement reference, if any.
    pub service_tx_ref: Option<String>,
}

/// A closure returning the scheduler slot, invoked exactly once when a
/// pending entry terminates.
pub type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// The future a caller awaits for a single request's payment outcome.
pub type PaymentFuture = oneshot::Receiver<Result<Option<PaymentInfo>, EngineError>>;

struct PendingEntry {
    sender: Mutex<Option<oneshot::Sender<Result<Option<PaymentInfo>, EngineError>>>>,
    release: Mutex<Option<ReleaseFn>>,
    sent_signed_sub_rav: Option<SignedSubRav>,
    #[allow(dead_code)]
    channel_id: Option<ChannelId>,
    #[allow(dead_code)]
    asset_id: Option<String>,
    created_at: Instant,
    deadline: Mutex<Instant>,
    reset: Notify,
    cancel: CancellationToken,
    settled: AtomicBool,
}

impl PendingEntry {
    /// Terminates the entry: releases the scheduler slot and sends `result`
    /// to the caller, if this is the first termination. Returns `true` if
    /// this call performed the termination (i.e. the entry was still live).
    fn settle(&self, result: Result<Option<PaymentInfo>, EngineError>) -> bool {
        if self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        if let Some(release) = self.release.lock().unwrap().take() {
            release();
        }
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(result);
        }
        true
    }
}

/// Tracks in-flight payment promises keyed by `clientTxRef`.
pub struct PendingPaymentTracker {
    entries: Arc<DashMap<String, Arc<PendingEntry>>>,
    recently_rejected: DashMap<String, Instant>,
    recently_rejected_ttl: Duration,
}

impl PendingPaymentTracker {
    /// Creates a tracker with the default recently-rejected TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_recently_rejected_ttl(DEFAULT_RECENTLY_REJECTED_TTL)
    }

    /// Creates a tracker with an explicit recently-rejected TTL.
    #[must_use]
    pub fn with_recently_rejected_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            recently_rejected: DashMap::new(),
            recently_rejected_ttl: ttl,
        }
    }

    /// Registers a pending entry for `client_tx_ref`, arming a timeout of
    /// `timeout` that fires [`EngineError::Timeout`] if nothing resolves it
    /// first. Returns the future the caller awaits for the settlement.
    ///
    /// `release` is called exactly once, whichever of resolve/reject/free/
    /// timeout terminates the entry first.
    pub fn create(
        &self,
        client_tx_ref: String,
        sent_signed_sub_rav: Option<SignedSubRav>,
        channel_id: Option<ChannelId>,
        asset_id: Option<String>,
        timeout: Duration,
        release: ReleaseFn,
    ) -> PaymentFuture {
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(PendingEntry {
            sender: Mutex::new(Some(tx)),
            release: Mutex::new(Some(release)),
            sent_signed_sub_rav,
            channel_id,
            asset_id,
            created_at: Instant::now(),
            deadline: Mutex::new(Instant::now() + timeout),
            reset: Notify::new(),
            cancel: CancellationToken::new(),
            settled: AtomicBool::new(false),
        });
        self.entries.insert(client_tx_ref.clone(), entry.clone());
        spawn_timeout_watcher(
            entry,
            TimeoutRemover {
                entries: self.entries.clone(),
                client_tx_ref,
            },
        );
        rx
    }

    /// Extends the idle timeout of a pending entry, used on stream
    /// activity. No-op if the entry is gone.
    pub fn extend_timeout(&self, client_tx_ref: &str, new_timeout: Duration) {
        if let Some(entry) = self.entries.get(client_tx_ref) {
            *entry.deadline.lock().unwrap() = Instant::now() + new_timeout;
            entry.reset.notify_one();
        }
    }

    /// Resolves a pending entry with a settlement (or `None` for free),
    /// releasing its scheduler slot. Returns whether an entry existed.
    pub fn resolve_by_ref(&self, client_tx_ref: &str, info: Option<PaymentInfo>) -> bool {
        match self.entries.remove(client_tx_ref) {
            Some((_, entry)) => entry.settle(Ok(info)),
            None => false,
        }
    }

    /// Rejects a pending entry, releasing its scheduler slot and recording
    /// the id as recently-rejected to absorb late successes. Returns
    /// whether an entry existed.
    pub fn reject_by_ref(&self, client_tx_ref: &str, err: EngineError) -> bool {
        self.recently_rejected
            .insert(client_tx_ref.to_owned(), Instant::now());
        match self.entries.remove(client_tx_ref) {
            Some((_, entry)) => entry.settle(Err(err)),
            None => false,
        }
    }

    /// Resolves a pending entry as free because its request was aborted,
    /// releasing its scheduler slot and recording the id as
    /// recently-rejected so a late in-flight success or protocol frame for
    /// it is ignored, per spec §4.1/§6. Returns whether an entry existed.
    pub fn resolve_as_aborted(&self, client_tx_ref: &str) -> bool {
        self.recently_rejected
            .insert(client_tx_ref.to_owned(), Instant::now());
        self.resolve_by_ref(client_tx_ref, None)
    }

    /// Rejects every pending entry with `err`, used at logout.
    pub fn reject_all(&self, make_err: impl Fn() -> EngineError) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.reject_by_ref(&id, make_err());
        }
    }

    /// Resolves every pending entry as free (`None`), used when a
    /// non-streaming response carries no protocol header at all.
    pub fn resolve_all_as_free(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve_by_ref(&id, None);
        }
    }

    /// Returns `true` if `client_tx_ref` was rejected within the
    /// recently-rejected TTL, meaning a late success for it should be
    /// silently ignored.
    pub fn is_recently_rejected(&self, client_tx_ref: &str) -> bool {
        match self.recently_rejected.get(client_tx_ref) {
            Some(at) => at.elapsed() < self.recently_rejected_ttl,
            None => false,
        }
    }

    /// Returns the number of currently pending entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if a pending entry exists for `client_tx_ref`.
    #[must_use]
    pub fn contains(&self, client_tx_ref: &str) -> bool {
        self.entries.contains_key(client_tx_ref)
    }

    /// Returns the sole pending entry's `clientTxRef` if exactly one
    /// exists, for the matching-rule's "exactly one pending" branches.
    #[must_use]
    pub fn sole_pending_id(&self) -> Option<String> {
        if self.entries.len() == 1 {
            self.entries.iter().next().map(|e| e.key().clone())
        } else {
            None
        }
    }

    /// Returns the `clientTxRef` of the pending entry created last, for the
    /// matching rule's final fallback.
    #[must_use]
    pub fn most_recent_pending_id(&self) -> Option<String> {
        self.entries
            .iter()
            .max_by_key(|e| e.created_at)
            .map(|e| e.key().clone())
    }

    /// Returns every pending id whose sent Sub-RAV legally progresses to
    /// `proposal`, for the matching rule's "several pending" branch.
    #[must_use]
    pub fn ids_progressing_to(&self, proposal: &subrav::subrav::SubRav) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| {
                subrav::subrav::validate_progression(e.sent_signed_sub_rav.as_ref().map(|s| &s.sub_rav), proposal)
                    .is_ok()
            })
            .map(|e| e.key().clone())
            .collect()
    }

    /// Returns the Sub-RAV that was sent alongside `client_tx_ref`'s
    /// request, if that entry still exists and carried one.
    #[must_use]
    pub fn sent_sub_rav(&self, client_tx_ref: &str) -> Option<SignedSubRav> {
        self.entries
            .get(client_tx_ref)
            .and_then(|e| e.sent_signed_sub_rav.clone())
    }
}

impl Default for PendingPaymentTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the (shared) entry map and a target id, so the spawned
/// timeout-watcher task can remove its own entry on fire without borrowing
/// the tracker.
struct TimeoutRemover {
    entries: Arc<DashMap<String, Arc<PendingEntry>>>,
    client_tx_ref: String,
}

fn spawn_timeout_watcher(entry: Arc<PendingEntry>, remover: TimeoutRemover) {
    tokio::spawn(async move {
        loop {
            let deadline = *entry.deadline.lock().unwrap();
            let sleep = tokio::time::sleep_until(deadline.into());
            tokio::select! {
                () = sleep => {
                    if Instant::now() >= *entry.deadline.lock().unwrap() {
                        remover.entries.remove(&remover.client_tx_ref);
                        entry.settle(Err(EngineError::Timeout));
                        return;
                    }
                }
                () = entry.reset.notified() => {}
                () = entry.cancel.cancelled() => {
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_by_ref_releases_and_settles_exactly_once() {
        let tracker = PendingPaymentTracker::new();
        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let rx = tracker.create(
            "tx-1".to_owned(),
            None,
            None,
            None,
            Duration::from_secs(5),
            Box::new(move || released_clone.store(true, Ordering::SeqCst)),
        );

        assert_eq!(tracker.pending_count(), 1);
        assert!(tracker.resolve_by_ref("tx-1", None));
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(tracker.pending_count(), 0);

        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), None);

        // Second resolve against the same id is a no-op (entry is gone).
        assert!(!tracker.resolve_by_ref("tx-1", None));
    }

    #[tokio::test]
    async fn resolve_as_aborted_frees_payment_and_marks_recently_rejected() {
        let tracker = PendingPaymentTracker::new();
        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        let rx = tracker.create(
            "tx-abort".to_owned(),
            None,
            None,
            None,
            Duration::from_secs(5),
            Box::new(move || released_clone.store(true, Ordering::SeqCst)),
        );

        assert!(tracker.resolve_as_aborted("tx-abort"));
        assert!(released.load(Ordering::SeqCst));
        assert!(tracker.is_recently_rejected("tx-abort"));
        assert_eq!(rx.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn reject_by_ref_marks_recently_rejected() {
        let tracker = PendingPaymentTracker::new();
        let _rx = tracker.create(
            "tx-2".to_owned(),
            None,
            None,
            None,
            Duration::from_secs(5),
            Box::new(|| {}),
        );
        assert!(tracker.reject_by_ref("tx-2", EngineError::Aborted));
        assert!(tracker.is_recently_rejected("tx-2"));
        assert!(!tracker.is_recently_rejected("unknown-id"));
    }

    #[tokio::test]
    async fn timeout_fires_and_releases() {
        let tracker = PendingPaymentTracker::new();
        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        let rx = tracker.create(
            "tx-3".to_owned(),
            None,
            None,
            None,
            Duration::from_millis(10),
            Box::new(move || released_clone.store(true, Ordering::SeqCst)),
        );
        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("should settle before the test timeout")
            .unwrap();
        assert!(matches!(result, Err(EngineError::Timeout)));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn extend_timeout_postpones_firing() {
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create(
            "tx-4".to_owned(),
            None,
            None,
            None,
            Duration::from_millis(50),
            Box::new(|| {}),
        );
        tracker.extend_timeout("tx-4", Duration::from_millis(200));
        // Resolve before the extended deadline to prove it didn't fire early.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(tracker.resolve_by_ref("tx-4", None));
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn resolve_all_as_free_clears_every_entry() {
        let tracker = PendingPaymentTracker::new();
        let rx1 = tracker.create("a".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        let rx2 = tracker.create("b".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        tracker.resolve_all_as_free();
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(rx1.await.unwrap().unwrap(), None);
        assert_eq!(rx2.await.unwrap().unwrap(), None);
    }
}
