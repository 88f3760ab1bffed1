//! Encodes and parses the payment header carried on requests and responses.
//!
//! Per spec §4.3: a single ASCII-safe token per header, carrying a
//! versioned JSON payload with big integers as decimal strings. We use
//! standard base64 (no padding) over the JSON bytes, the same convention
//! the teacher crate uses for its own payment headers.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

use subrav::protocol::{RequestPaymentHeader, ResponsePaymentHeader};

use crate::error::HttpError;

/// Encodes/decodes the request and response payment headers.
///
/// Stateless; exists as a type (rather than bare functions) to mirror the
/// teacher's `encoding`/`headers` module split and to give call sites a
/// stable, mockable seam.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolCodec;

impl ProtocolCodec {
    /// Creates a codec instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encodes a request payment header into its wire token.
    ///
    /// # Errors
    ///
    /// Returns an error only if `header` cannot be serialized, which does
    /// not happen for well-formed [`RequestPaymentHeader`] values.
    pub fn encode_request(&self, header: &RequestPaymentHeader) -> Result<String, HttpError> {
        let json = serde_json::to_vec(header).map_err(|source| HttpError::HeaderJson {
            context: "request",
            source,
        })?;
        Ok(STANDARD_NO_PAD.encode(json))
    }

    /// Parses a request payment header token.
    ///
    /// # Errors
    ///
    /// Returns an error if `token` is not valid base64, UTF-8, or JSON
    /// matching the expected shape.
    pub fn decode_request(&self, token: &str) -> Result<RequestPaymentHeader, HttpError> {
        let bytes = STANDARD_NO_PAD
            .decode(token)
            .map_err(|source| HttpError::HeaderEncoding {
                context: "request",
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| HttpError::HeaderJson {
            context: "request",
            source,
        })
    }

    /// Encodes a response payment header into its wire token.
    ///
    /// # Errors
    ///
    /// Returns an error only if `header` cannot be serialized.
    pub fn encode_response(&self, header: &ResponsePaymentHeader) -> Result<String, HttpError> {
        let json = serde_json::to_vec(header).map_err(|source| HttpError::HeaderJson {
            context: "response",
            source,
        })?;
        Ok(STANDARD_NO_PAD.encode(json))
    }

    /// Parses a response payment header token.
    ///
    /// # Errors
    ///
    /// Returns an error if `token` is not valid base64, UTF-8, or JSON
    /// matching the expected shape.
    pub fn decode_response(&self, token: &str) -> Result<ResponsePaymentHeader, HttpError> {
        let bytes = STANDARD_NO_PAD
            .decode(token)
            .map_err(|source| HttpError::HeaderEncoding {
                context: "response",
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| HttpError::HeaderJson {
            context: "response",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subrav::channel::ChannelId;
    use subrav::protocol::SettlementInfo;
    use subrav::subrav::{SubRav, PROTOCOL_VERSION};
    use subrav::{BigAmount, SignedSubRav};

    fn rav() -> SignedSubRav {
        SignedSubRav {
            sub_rav: SubRav {
                chain_id: BigAmount::new(1),
                channel_id: ChannelId::from_bytes([4u8; 32]),
                channel_epoch: BigAmount::ZERO,
                vm_id_fragment: "k1".to_owned(),
                accumulated_amount: BigAmount::new(10),
                nonce: BigAmount::new(1),
                version: PROTOCOL_VERSION,
            },
            signature: "sig".to_owned(),
        }
    }

    #[test]
    fn request_header_round_trips() {
        let codec = ProtocolCodec::new();
        let header = RequestPaymentHeader::with_proposal("tx-1".to_owned(), BigAmount::new(100), rav());
        let token = codec.encode_request(&header).unwrap();
        assert!(!token.contains('='), "no-pad base64 should have no padding");
        let decoded = codec.decode_request(&token).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn response_header_round_trips() {
        let codec = ProtocolCodec::new();
        let header = ResponsePaymentHeader::Success(SettlementInfo {
            client_tx_ref: "tx-1".to_owned(),
            cost: BigAmount::new(10),
            cost_usd: None,
            service_tx_ref: None,
            sub_rav: rav(),
        });
        let token = codec.encode_response(&header).unwrap();
        let decoded = codec.decode_response(&token).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn decode_rejects_malformed_base64() {
        let codec = ProtocolCodec::new();
        assert!(codec.decode_request("not valid base64!!!").is_err());
    }
}
