//! Protocol-level constants: header names, in-band frame field names, and
//! engine-wide defaults.

use std::time::Duration;

/// Header carrying the outgoing [`subrav::protocol::RequestPaymentHeader`].
pub const PAYMENT_HEADER: &str = "X-Payment";

/// Header carrying the incoming [`subrav::protocol::ResponsePaymentHeader`].
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

/// Header a caller may set to pin the `clientTxRef` of a request instead of
/// letting the dispatcher synthesize one.
pub const CORRELATION_HEADER: &str = "X-Client-Tx-Ref";

/// Standard HTTP authorization header.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Scheme prefix for DID-based authorization header values.
pub const DID_AUTH_SCHEME: &str = "DIDAuthV1";

/// NDJSON/SSE in-band field name carrying an encoded protocol header,
/// primary spelling.
pub const PAYMENT_FRAME_FIELD: &str = "__nuwa_payment_header__";

/// NDJSON/SSE in-band field name carrying an encoded protocol header,
/// alternate spelling some services emit.
pub const PAYMENT_FRAME_FIELD_ALT: &str = "nuwa_payment_header";

/// Content type identifying a server-sent-events stream.
pub const CONTENT_TYPE_SSE: &str = "text/event-stream";

/// Content type identifying a newline-delimited-JSON stream.
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Default per-request payment timeout, per spec §5.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default high-water mark, in bytes, for buffered business-stream data
/// while the background drain pump waits on a slow consumer.
pub const DEFAULT_STREAM_HIGH_WATER_MARK: usize = 1024 * 1024;

/// Default TTL a rejected `clientTxRef` is retained in the recently-rejected
/// set, to absorb late-arriving success signals.
pub const DEFAULT_RECENTLY_REJECTED_TTL: Duration = Duration::from_secs(60);
