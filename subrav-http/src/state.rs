//! Authoritative in-memory payment-channel state for a single engine.
//!
//! Per spec §4.6: channel id, sub-channel binding, cached pending Sub-RAV,
//! last-signed Sub-RAV (the progression baseline), and the highest-observed
//! nonce watermark. All mutators are synchronous; the single-slot
//! [`crate::scheduler::RequestScheduler`] is what actually enforces the
//! "no concurrent mutation" invariant described in spec §5, so a plain
//! [`std::sync::Mutex`] per field is sufficient here rather than anything
//! fancier.

use std::sync::Mutex;

use subrav::capability::ServiceInfo;
use subrav::channel::ChannelId;
use subrav::subrav::{validate_progression, ProgressionViolation, SignedSubRav, SubRav};
use subrav::BigAmount;

/// The engine's authoritative view of its payment-channel state.
#[derive(Default)]
pub struct PaymentState {
    channel_id: Mutex<Option<ChannelId>>,
    channel_info: Mutex<Option<ServiceInfo>>,
    vm_id_fragment: Mutex<Option<String>>,
    pending_sub_rav: Mutex<Option<SubRav>>,
    last_signed_sub_rav: Mutex<Option<SignedSubRav>>,
    highest_observed_nonce: Mutex<Option<BigAmount>>,
}

impl PaymentState {
    /// Creates an empty state, as at first boot with no persisted record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current channel id, if known.
    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        *self.channel_id.lock().unwrap()
    }

    /// Sets the current channel id.
    pub fn set_channel_id(&self, id: ChannelId) {
        *self.channel_id.lock().unwrap() = Some(id);
    }

    /// Returns the discovered service info, if known.
    #[must_use]
    pub fn channel_info(&self) -> Option<ServiceInfo> {
        self.channel_info.lock().unwrap().clone()
    }

    /// Sets the discovered service info.
    pub fn set_channel_info(&self, info: ServiceInfo) {
        *self.channel_info.lock().unwrap() = Some(info);
    }

    /// Returns the engine's current signing-key fragment, if known.
    #[must_use]
    pub fn vm_id_fragment(&self) -> Option<String> {
        self.vm_id_fragment.lock().unwrap().clone()
    }

    /// Sets the engine's current signing-key fragment.
    pub fn set_vm_id_fragment(&self, fragment: String) {
        *self.vm_id_fragment.lock().unwrap() = Some(fragment);
    }

    /// Returns a clone of the cached pending (unsigned) Sub-RAV proposal, if
    /// any, without consuming it.
    #[must_use]
    pub fn pending_sub_rav(&self) -> Option<SubRav> {
        self.pending_sub_rav.lock().unwrap().clone()
    }

    /// Clears the cached pending proposal, returning it.
    pub fn clear_pending_sub_rav(&self) -> Option<SubRav> {
        self.pending_sub_rav.lock().unwrap().take()
    }

    /// Atomically takes the cached pending proposal, clearing the cache.
    ///
    /// This is the read half of the "sign-and-clear-pending must be atomic"
    /// rule in spec §9: the dispatcher calls this once per request, signs
    /// whatever it returns (if `Some`), and never re-reads the cache for the
    /// same request.
    pub fn take_pending_for_signing(&self) -> Option<SubRav> {
        self.pending_sub_rav.lock().unwrap().take()
    }

    /// Returns the most recently signed-and-sent Sub-RAV, the progression
    /// baseline for the next accepted proposal.
    #[must_use]
    pub fn last_signed_sub_rav(&self) -> Option<SignedSubRav> {
        self.last_signed_sub_rav.lock().unwrap().clone()
    }

    /// Records `signed` as the new progression baseline and advances the
    /// highest-observed-nonce watermark to at least its nonce. Called right
    /// after the dispatcher signs a proposal taken via
    /// [`Self::take_pending_for_signing`].
    pub fn mark_signed(&self, signed: SignedSubRav) {
        self.bump_highest_observed_nonce(signed.sub_rav.nonce);
        *self.last_signed_sub_rav.lock().unwrap() = Some(signed);
    }

    /// Returns the highest nonce ever observed from the service, signed or
    /// not, used to detect a service-proposed regression.
    #[must_use]
    pub fn highest_observed_nonce(&self) -> Option<BigAmount> {
        *self.highest_observed_nonce.lock().unwrap()
    }

    fn bump_highest_observed_nonce(&self, nonce: BigAmount) {
        let mut watermark = self.highest_observed_nonce.lock().unwrap();
        if watermark.is_none_or(|current| nonce > current) {
            *watermark = Some(nonce);
        }
    }

    /// Validates `proposal` against the current progression baseline and,
    /// if it passes invariant 3 (single pending proposal only replaces the
    /// cache when it legally progresses) and invariant 4 (sub-channel
    /// binding), caches it as the new pending proposal.
    ///
    /// An unknown `vm_id_fragment` is treated as "tentatively accept until
    /// known" per invariant 4: the proposal is cached, and
    /// [`Self::set_vm_id_fragment`] is expected to be called once the
    /// engine learns its fragment (typically from the signer capability
    /// during the first request).
    ///
    /// # Errors
    ///
    /// Returns the [`ProgressionViolation`] that failed, without mutating
    /// the cache.
    pub fn try_cache_proposal(&self, proposal: SubRav) -> Result<(), ProgressionViolation> {
        if let Some(fragment) = self.vm_id_fragment() {
            if fragment != proposal.vm_id_fragment {
                return Err(ProgressionViolation::SubChannelMismatch);
            }
        }

        let baseline = self.last_signed_sub_rav();
        validate_progression(baseline.as_ref().map(|s| &s.sub_rav), &proposal)?;

        self.bump_highest_observed_nonce(proposal.nonce);
        *self.pending_sub_rav.lock().unwrap() = Some(proposal);
        Ok(())
    }

    /// Adopts a proposal recovered from persisted state at boot without
    /// re-validating it against a baseline that has not been loaded yet.
    ///
    /// Applying this twice with the same fragment and prior Sub-RAV is a
    /// no-op (idempotent), matching the "accept-recovered-pending" law in
    /// spec §8.
    pub fn adopt_recovered_pending(&self, proposal: SubRav) {
        *self.pending_sub_rav.lock().unwrap() = Some(proposal);
    }

    /// Resets all state to empty, used by `logoutCleanup`.
    pub fn reset(&self) {
        *self.channel_id.lock().unwrap() = None;
        *self.channel_info.lock().unwrap() = None;
        *self.vm_id_fragment.lock().unwrap() = None;
        *self.pending_sub_rav.lock().unwrap() = None;
        *self.last_signed_sub_rav.lock().unwrap() = None;
        *self.highest_observed_nonce.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subrav::channel::ChannelId;
    use subrav::subrav::PROTOCOL_VERSION;

    fn rav(nonce: u128, amount: u128, fragment: &str) -> SubRav {
        SubRav {
            chain_id: BigAmount::new(1),
            channel_id: ChannelId::from_bytes([1u8; 32]),
            channel_epoch: BigAmount::ZERO,
            vm_id_fragment: fragment.to_owned(),
            accumulated_amount: BigAmount::new(amount),
            nonce: BigAmount::new(nonce),
            version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn first_proposal_is_accepted_with_no_baseline() {
        let state = PaymentState::new();
        state.try_cache_proposal(rav(1, 10, "k1")).unwrap();
        assert_eq!(state.pending_sub_rav(), Some(rav(1, 10, "k1")));
    }

    #[test]
    fn regressing_proposal_is_rejected_and_cache_untouched() {
        let state = PaymentState::new();
        state.mark_signed(SignedSubRav {
            sub_rav: rav(2, 20, "k1"),
            signature: "sig".to_owned(),
        });
        state.try_cache_proposal(rav(3, 30, "k1")).unwrap();

        let err = state.try_cache_proposal(rav(1, 10, "k1")).unwrap_err();
        assert_eq!(err, ProgressionViolation::NonceNotIncreasing);
        // cache still holds the last legally-accepted proposal
        assert_eq!(state.pending_sub_rav(), Some(rav(3, 30, "k1")));
    }

    #[test]
    fn mismatched_fragment_is_rejected_once_fragment_is_known() {
        let state = PaymentState::new();
        state.set_vm_id_fragment("k1".to_owned());
        let err = state.try_cache_proposal(rav(1, 10, "k2")).unwrap_err();
        assert_eq!(err, ProgressionViolation::SubChannelMismatch);
    }

    #[test]
    fn unknown_fragment_tentatively_accepts() {
        let state = PaymentState::new();
        state.try_cache_proposal(rav(1, 10, "k9")).unwrap();
        assert!(state.pending_sub_rav().is_some());
    }

    #[test]
    fn take_pending_for_signing_clears_cache() {
        let state = PaymentState::new();
        state.try_cache_proposal(rav(1, 10, "k1")).unwrap();
        assert!(state.take_pending_for_signing().is_some());
        assert!(state.pending_sub_rav().is_none());
    }

    #[test]
    fn reset_clears_everything() {
        let state = PaymentState::new();
        state.set_channel_id(ChannelId::from_bytes([2u8; 32]));
        state.set_vm_id_fragment("k1".to_owned());
        state.try_cache_proposal(rav(1, 10, "k1")).unwrap();
        state.reset();
        assert!(state.channel_id().is_none());
        assert!(state.vm_id_fragment().is_none());
        assert!(state.pending_sub_rav().is_none());
    }
}
