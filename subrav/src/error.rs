//! Error taxonomy for the Sub-RAV payment-channel engine.

use std::fmt;

use crate::subrav::SubRav;

/// Machine-readable error codes surfaced to callers, carried on both
/// protocol-level responses and client-side synthetic errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolErrorCode {
    /// The service requires payment to proceed (HTTP 402, or protocol header
    /// with a matching error code).
    PaymentRequired,
    /// The submitted Sub-RAV conflicts with the service's view of the
    /// channel (HTTP 409).
    RavConflict,
    /// The request's DID authorization was rejected.
    Unauthorized,
    /// The request was authenticated but not permitted.
    Forbidden,
    /// The channel does not have sufficient funds to cover the request.
    InsufficientFunds,
    /// A generic conflict not covered by [`Self::RavConflict`].
    Conflict,
    /// An unclassified server-side failure.
    InternalError,
    /// The service (or a dependency of it) is temporarily unavailable.
    ServiceUnavailable,
    /// Client-side: no settlement arrived before the configured timeout.
    PaymentTimeout,
    /// Client-side: a proposed Sub-RAV failed progression validation.
    InvalidProgression,
}

impl ProtocolErrorCode {
    /// Parses a wire error code string into a [`ProtocolErrorCode`].
    ///
    /// Unknown codes map to [`Self::InternalError`], matching the "unknown
    /// shapes collapse to a safe default" posture used throughout the
    /// classifier.
    #[must_use]
    pub fn from_wire(code: &str) -> Self {
        match code {
            "PAYMENT_REQUIRED" => Self::PaymentRequired,
            "RAV_CONFLICT" => Self::RavConflict,
            "UNAUTHORIZED" => Self::Unauthorized,
            "FORBIDDEN" => Self::Forbidden,
            "INSUFFICIENT_FUNDS" => Self::InsufficientFunds,
            "CONFLICT" => Self::Conflict,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable,
            "PAYMENT_TIMEOUT" => Self::PaymentTimeout,
            "INVALID_PROGRESSION" => Self::InvalidProgression,
            _ => Self::InternalError,
        }
    }

    /// Returns the canonical wire code string.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::RavConflict => "RAV_CONFLICT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::Conflict => "CONFLICT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::PaymentTimeout => "PAYMENT_TIMEOUT",
            Self::InvalidProgression => "INVALID_PROGRESSION",
        }
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// A protocol-level error returned by the service, carried in a response
/// payment header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    /// Machine-readable error code.
    pub code: ProtocolErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Errors a Sub-RAV proposal failed to progress legally, carrying both
/// sides for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid progression: {violation}")]
pub struct InvalidProgressionError {
    /// What went wrong.
    pub violation: crate::subrav::ProgressionViolation,
    /// The Sub-RAV that was sent with the rejected request, if any.
    pub sent: Option<SubRav>,
    /// The Sub-RAV proposal the service returned.
    pub received: SubRav,
}

/// Top-level error type for the payment-channel engine.
///
/// Every error surfaced to a caller of the engine — whether a protocol
/// error, a transport failure, a progression violation, a timeout, or a
/// lifecycle error — is represented here.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The service returned a protocol-level error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A Sub-RAV proposal failed progression validation.
    #[error(transparent)]
    InvalidProgression(#[from] InvalidProgressionError),

    /// No settlement arrived before the configured timeout.
    #[error("payment timed out waiting for settlement")]
    Timeout,

    /// The request (or its payment) was aborted by the caller.
    #[error("request aborted")]
    Aborted,

    /// The engine has been cleaned up (`logoutCleanup` was called); no
    /// further requests may be admitted.
    #[error("engine has been cleaned up; no further requests are accepted")]
    CleanedUp,

    /// A capability collaborator (channel, signer, rate provider, or store)
    /// failed.
    #[error("capability failure: {0}")]
    Capability(Box<dyn std::error::Error + Send + Sync>),

    /// Any other error not covered by the specific variants.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    /// Returns the [`ProtocolErrorCode`] most closely describing this error,
    /// for callers that want a single machine-readable code regardless of
    /// variant.
    #[must_use]
    pub fn code(&self) -> ProtocolErrorCode {
        match self {
            Self::Protocol(e) => e.code,
            Self::InvalidProgression(_) => ProtocolErrorCode::InvalidProgression,
            Self::Timeout => ProtocolErrorCode::PaymentTimeout,
            Self::Aborted | Self::CleanedUp => ProtocolErrorCode::InternalError,
            Self::Capability(_) | Self::Other(_) => ProtocolErrorCode::InternalError,
        }
    }
}
