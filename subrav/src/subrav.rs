//! The Sub-RAV receipt type and progression validation.

use serde::{Deserialize, Serialize};

use crate::amount::BigAmount;
use crate::channel::{ChannelId, SubChannelKey};

/// The current wire protocol version for Sub-RAV payloads.
pub const PROTOCOL_VERSION: u8 = 1;

/// A Sub-RAV ("Receipt-And-Voucher", sub-channel scope): an unsigned,
/// cumulative, off-chain receipt proposal.
///
/// `accumulated_amount` is monotonically non-decreasing and `nonce` is
/// strictly increasing across any two Sub-RAVs sharing the same
/// [`SubChannelKey`] (see [`validate_progression`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRav {
    /// Identifies the target settlement chain.
    pub chain_id: BigAmount,
    /// Opaque 32-byte channel identifier.
    pub channel_id: ChannelId,
    /// Increments when the channel is reset.
    pub channel_epoch: BigAmount,
    /// Short string identifying the payer's signing key inside its DID.
    pub vm_id_fragment: String,
    /// Monotonically non-decreasing cumulative amount.
    pub accumulated_amount: BigAmount,
    /// Strictly increasing per sub-channel.
    pub nonce: BigAmount,
    /// Protocol version.
    pub version: u8,
}

impl SubRav {
    /// Returns the sub-channel key this Sub-RAV belongs to.
    #[must_use]
    pub fn sub_channel_key(&self) -> SubChannelKey {
        SubChannelKey {
            channel_id: self.channel_id,
            channel_epoch: self.channel_epoch,
            vm_id_fragment: self.vm_id_fragment.clone(),
        }
    }
}

/// A [`SubRav`] plus an opaque cryptographic signature over its canonical
/// serialization.
///
/// The signature format is owned by the signer capability
/// ([`crate::capability::SignerCapability`]); this crate treats it as an
/// opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedSubRav {
    /// The signed receipt body.
    #[serde(flatten)]
    pub sub_rav: SubRav,
    /// Opaque signature over the canonical serialization of `sub_rav`.
    pub signature: String,
}

/// Reasons a proposed Sub-RAV can fail to legally progress from a previously
/// signed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProgressionViolation {
    /// The proposal's sub-channel key does not match the previous one.
    #[error("sub-channel mismatch: proposal does not match the previously signed sub-channel")]
    SubChannelMismatch,
    /// The proposal's nonce did not strictly increase.
    #[error("nonce did not strictly increase")]
    NonceNotIncreasing,
    /// The proposal's accumulated amount decreased.
    #[error("accumulated amount decreased")]
    AmountDecreased,
}

/// Validates that `proposal` legally progresses from `previous`.
///
/// Given the previous signed Sub-RAV `P` and incoming proposal `N`,
/// progression requires `N.channelId = P.channelId`, `N.channelEpoch =
/// P.channelEpoch`, `N.vmIdFragment = P.vmIdFragment`, `N.nonce > P.nonce`,
/// and `N.accumulatedAmount >= P.accumulatedAmount`.
///
/// When `previous` is `None` (free-mode request, or first proposal ever),
/// any proposal is accepted.
///
/// # Errors
///
/// Returns the specific [`ProgressionViolation`] that failed.
pub fn validate_progression(
    previous: Option<&SubRav>,
    proposal: &SubRav,
) -> Result<(), ProgressionViolation> {
    let Some(previous) = previous else {
        return Ok(());
    };

    if previous.sub_channel_key() != proposal.sub_channel_key() {
        return Err(ProgressionViolation::SubChannelMismatch);
    }
    if proposal.nonce <= previous.nonce {
        return Err(ProgressionViolation::NonceNotIncreasing);
    }
    if !proposal
        .accumulated_amount
        .is_non_decreasing_from(previous.accumulated_amount)
    {
        return Err(ProgressionViolation::AmountDecreased);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rav(nonce: u128, amount: u128) -> SubRav {
        SubRav {
            chain_id: BigAmount::new(1),
            channel_id: ChannelId::from_bytes([1u8; 32]),
            channel_epoch: BigAmount::ZERO,
            vm_id_fragment: "k1".to_owned(),
            accumulated_amount: BigAmount::new(amount),
            nonce: BigAmount::new(nonce),
            version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn first_proposal_always_accepted() {
        assert!(validate_progression(None, &rav(1, 10)).is_ok());
    }

    #[test]
    fn strictly_increasing_nonce_and_non_decreasing_amount_is_valid() {
        let prev = rav(1, 10);
        let next = rav(2, 20);
        assert!(validate_progression(Some(&prev), &next).is_ok());

        // equal accumulated amount is allowed (non-decreasing, not strictly increasing)
        let next_equal = rav(2, 10);
        assert!(validate_progression(Some(&prev), &next_equal).is_ok());
    }

    #[test]
    fn non_increasing_nonce_is_rejected() {
        let prev = rav(2, 20);
        let replay = rav(1, 10);
        assert_eq!(
            validate_progression(Some(&prev), &replay),
            Err(ProgressionViolation::NonceNotIncreasing)
        );

        let same_nonce = rav(2, 20);
        assert_eq!(
            validate_progression(Some(&prev), &same_nonce),
            Err(ProgressionViolation::NonceNotIncreasing)
        );
    }

    #[test]
    fn decreasing_amount_is_rejected() {
        let prev = rav(1, 20);
        let next = rav(2, 10);
        assert_eq!(
            validate_progression(Some(&prev), &next),
            Err(ProgressionViolation::AmountDecreased)
        );
    }

    #[test]
    fn sub_channel_mismatch_is_rejected() {
        let prev = rav(1, 10);
        let mut next = rav(2, 20);
        next.vm_id_fragment = "k2".to_owned();
        assert_eq!(
            validate_progression(Some(&prev), &next),
            Err(ProgressionViolation::SubChannelMismatch)
        );
    }
}
