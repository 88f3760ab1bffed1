//! Pluggable matching policy for ambiguous success classification.
//!
//! Spec §4.5's "matching rule" is specified as a fixed four-step fallback.
//! We generalize it into a [`MatchPolicy`] trait — the same move the
//! teacher makes for its `PaymentSelector`/`PaymentPolicy` pair around
//! candidate selection — so a caller can layer additional heuristics (e.g.
//! prefer the oldest pending, or consult an external correlation id) without
//! forking [`crate::classifier::ResponseClassifier`]. [`DefaultMatchPolicy`]
//! implements exactly the spec's four steps and is used unless a caller
//! supplies their own.

use subrav::subrav::SubRav;

use crate::tracker::PendingPaymentTracker;

/// Decides which pending request a service's `success` response settles,
/// when the response's `clientTxRef` does not land an exact hit.
///
/// Implementations see only the tracker (to inspect candidate pendings) and
/// the incoming proposal (to filter by legal progression); they do not
/// mutate anything.
pub trait MatchPolicy: Send + Sync {
    /// Returns the `clientTxRef` of the pending entry that should be
    /// credited with this proposal's settlement, if any can be determined.
    fn resolve(&self, tracker: &PendingPaymentTracker, proposal: &SubRav) -> Option<String>;
}

/// Implements spec §4.5's matching rule exactly:
///
/// 1. Exact `clientTxRef` hit (handled by the caller before consulting this
///    policy at all — see [`crate::classifier::ResponseClassifier`]).
/// 2. If exactly one pending exists, take it.
/// 3. If several pending exist, take the ones whose sent Sub-RAV legally
///    progresses to the proposal; if exactly one survives, take it.
/// 4. Fallback: the most-recently-created pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMatchPolicy;

impl MatchPolicy for DefaultMatchPolicy {
    fn resolve(&self, tracker: &PendingPaymentTracker, proposal: &SubRav) -> Option<String> {
        if let Some(sole) = tracker.sole_pending_id() {
            return Some(sole);
        }

        let progressing = tracker.ids_progressing_to(proposal);
        if progressing.len() == 1 {
            return progressing.into_iter().next();
        }

        tracker.most_recent_pending_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use subrav::channel::ChannelId;
    use subrav::subrav::PROTOCOL_VERSION;
    use subrav::{BigAmount, SignedSubRav};

    fn rav(nonce: u128) -> SubRav {
        SubRav {
            chain_id: BigAmount::new(1),
            channel_id: ChannelId::from_bytes([1u8; 32]),
            channel_epoch: BigAmount::ZERO,
            vm_id_fragment: "k1".to_owned(),
            accumulated_amount: BigAmount::new(nonce * 10),
            nonce: BigAmount::new(nonce),
            version: PROTOCOL_VERSION,
        }
    }

    #[tokio::test]
    async fn sole_pending_wins_regardless_of_progression() {
        let tracker = PendingPaymentTracker::new();
        let _rx = tracker.create("only".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        let resolved = DefaultMatchPolicy.resolve(&tracker, &rav(1));
        assert_eq!(resolved, Some("only".to_owned()));
    }

    #[tokio::test]
    async fn multiple_pending_picks_the_one_that_progresses() {
        let tracker = PendingPaymentTracker::new();
        let _rx_a = tracker.create(
            "a".to_owned(),
            Some(SignedSubRav { sub_rav: rav(1), signature: "sig".to_owned() }),
            None,
            None,
            Duration::from_secs(5),
            Box::new(|| {}),
        );
        let _rx_b = tracker.create(
            "b".to_owned(),
            Some(SignedSubRav { sub_rav: rav(5), signature: "sig".to_owned() }),
            None,
            None,
            Duration::from_secs(5),
            Box::new(|| {}),
        );
        // proposal progresses from nonce 1 but not from nonce 5
        let resolved = DefaultMatchPolicy.resolve(&tracker, &rav(2));
        assert_eq!(resolved, Some("a".to_owned()));
    }

    #[tokio::test]
    async fn ambiguous_progression_falls_back_to_most_recent() {
        let tracker = PendingPaymentTracker::new();
        let _rx_a = tracker.create("a".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _rx_b = tracker.create("b".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        // both have no sent sub-rav (free mode), so both vacuously "progress"
        let resolved = DefaultMatchPolicy.resolve(&tracker, &rav(1));
        assert_eq!(resolved, Some("b".to_owned()));
    }
}
