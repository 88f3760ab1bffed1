//! Request/response payment header payloads.
//!
//! These types are the JSON shapes carried (base64-encoded) in the
//! `X-Payment` request header and `X-Payment-Response` response header; the
//! encoding itself lives in `subrav-http`, which is the only crate that
//! talks HTTP.

use serde::{Deserialize, Serialize};

use crate::amount::BigAmount;
use crate::error::ProtocolErrorCode;
use crate::subrav::{SignedSubRav, PROTOCOL_VERSION};

/// The payload a client attaches to an outgoing request once it has a
/// Sub-RAV proposal (or is requesting a free/first-call pass).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPaymentHeader {
    /// Protocol version.
    pub v: u8,
    /// Client-generated correlation id, echoed back by the service on the
    /// matching response.
    pub client_tx_ref: String,
    /// The maximum amount the client authorizes the service to claim via
    /// this header, as a ceiling independent of the signed Sub-RAV itself.
    pub max_amount: BigAmount,
    /// The signed Sub-RAV proposal, absent on a free or discovery request.
    pub signed_sub_rav: Option<SignedSubRav>,
}

impl RequestPaymentHeader {
    /// Builds a header for a request carrying a signed Sub-RAV proposal.
    #[must_use]
    pub fn with_proposal(client_tx_ref: String, max_amount: BigAmount, signed_sub_rav: SignedSubRav) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            client_tx_ref,
            max_amount,
            signed_sub_rav: Some(signed_sub_rav),
        }
    }

    /// Builds a header for a free (no Sub-RAV attached) request.
    #[must_use]
    pub fn free(client_tx_ref: String) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            client_tx_ref,
            max_amount: BigAmount::ZERO,
            signed_sub_rav: None,
        }
    }
}

/// The successful-settlement variant of [`ResponsePaymentHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementInfo {
    /// Correlation id this settlement answers, echoing the request's
    /// `clientTxRef`.
    pub client_tx_ref: String,
    /// The cost of this single request, in the channel asset's base unit.
    pub cost: BigAmount,
    /// The cost converted to USD, if the service has pricing information.
    pub cost_usd: Option<String>,
    /// A service-generated reference for this settlement, for
    /// reconciliation against service-side records.
    pub service_tx_ref: Option<String>,
    /// The Sub-RAV the service committed for this settlement, echoed back
    /// so the client can confirm it matches what it sent.
    pub sub_rav: SignedSubRav,
}

/// The response payload describing the outcome of a request's payment
/// attempt, carried in the response's payment header.
///
/// There is no variant for "no payment required": that case is represented
/// by the header being absent entirely (`Option::None` at the transport
/// layer), not by a value of this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ResponsePaymentHeader {
    /// The request's payment settled successfully.
    Success(SettlementInfo),
    /// The request's payment failed; the service may have echoed back a
    /// proposal for the client to resume from.
    Error {
        /// Machine-readable failure code.
        code: WireErrorCode,
        /// Human-readable message.
        message: String,
        /// The service's authoritative Sub-RAV, when recovery is possible
        /// (e.g. on `RAV_CONFLICT`).
        sub_rav: Option<SignedSubRav>,
    },
}

/// The wire representation of a [`ProtocolErrorCode`].
///
/// A thin wrapper rather than reusing [`ProtocolErrorCode`] directly so that
/// an unrecognized wire string deserializes successfully (as
/// [`ProtocolErrorCode::InternalError`]) instead of failing the whole
/// header parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireErrorCode(pub ProtocolErrorCode);

impl Serialize for WireErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.0.as_wire())
    }
}

impl<'de> Deserialize<'de> for WireErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(ProtocolErrorCode::from_wire(&s)))
    }
}
