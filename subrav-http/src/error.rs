//! HTTP-layer error type wrapping transport and codec failures.

use subrav::EngineError;

/// Errors raised by the HTTP engine below the [`EngineError`] surfaced to
/// callers.
///
/// This type exists to carry the transport-specific context
/// (`reqwest`/`reqwest_middleware`/codec failures) that [`EngineError`]
/// deliberately stays agnostic of; the dispatcher converts every variant
/// here into an [`EngineError`] before it reaches a caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HttpError {
    /// The underlying HTTP transport failed.
    #[error("transport error during {context}: {source}")]
    Transport {
        /// What the engine was doing when the transport failed.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: reqwest_middleware::Error,
    },

    /// A payment header value was not valid base64.
    #[error("malformed payment header ({context}): {source}")]
    HeaderEncoding {
        /// Which header failed to decode.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: base64::DecodeError,
    },

    /// A decoded payment header was not valid UTF-8.
    #[error("payment header ({context}) is not valid utf-8: {source}")]
    HeaderNotUtf8 {
        /// Which header failed to decode.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: std::str::Utf8Error,
    },

    /// A decoded payment header was not valid JSON for its expected shape.
    #[error("malformed payment header ({context}): {source}")]
    HeaderJson {
        /// Which header failed to parse.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A header value contained characters invalid for an HTTP header.
    #[error("invalid header value for {context}: {source}")]
    InvalidHeaderValue {
        /// Which header was being constructed.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },

    /// The requested URL could not be parsed.
    #[error("invalid request url {url:?}: {source}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
        /// The underlying error.
        #[source]
        source: url::ParseError,
    },
}

impl From<HttpError> for EngineError {
    fn from(value: HttpError) -> Self {
        Self::Other(Box::new(value))
    }
}
