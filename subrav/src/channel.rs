//! Channel and sub-channel identifiers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::amount::BigAmount;

/// An opaque 32-byte payment-channel identifier.
///
/// Serializes to/from a `0x`-prefixed hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; 32]);

impl ChannelId {
    /// Creates a channel id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this channel id.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Error returned when parsing an invalid channel id string.
#[derive(Debug, thiserror::Error)]
#[error("invalid channel id {0:?}: {1}")]
pub struct ChannelIdParseError(String, String);

impl std::str::FromStr for ChannelId {
    type Err = ChannelIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)
            .map_err(|e| ChannelIdParseError(s.to_owned(), e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChannelIdParseError(s.to_owned(), "expected 32 bytes".to_owned()))?;
        Ok(Self(array))
    }
}

impl Serialize for ChannelId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The `(channelId, channelEpoch, vmIdFragment)` triple under which Sub-RAVs
/// are ordered.
///
/// Two Sub-RAVs are comparable (subject to the monotone-nonce invariant)
/// only if they share the same sub-channel key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubChannelKey {
    /// The channel this sub-channel belongs to.
    pub channel_id: ChannelId,
    /// Increments when the channel is reset.
    pub channel_epoch: BigAmount,
    /// Short string identifying the payer's signing key inside its DID.
    pub vm_id_fragment: String,
}

impl fmt::Display for SubChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.channel_id, self.channel_epoch, self.vm_id_fragment
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_hex_channel_id() {
        let id = ChannelId::from_bytes([7u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ChannelId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = "0xabcd".parse::<ChannelId>().unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }
}
