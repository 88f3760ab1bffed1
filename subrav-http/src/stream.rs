//! Demultiplexes an in-band payment frame out of a streaming response body.
//!
//! Per spec §4.7: a streaming response (`text/event-stream` or
//! `application/x-ndjson`) carries exactly one in-band protocol frame
//! somewhere in its body. [`StreamFilter`] wraps the upstream byte stream,
//! pumps it on a background task (so the frame is processed even if the
//! consumer reads slowly), forwards business bytes unmodified through a
//! bounded channel (the high-water mark), and drives payment classification
//! through the same [`crate::classifier::ResponseClassifier`] non-streaming
//! responses use.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use http::StatusCode;
use tokio::sync::mpsc;

use subrav::protocol::ResponsePaymentHeader;

use crate::classifier::ResponseClassifier;
use crate::codec::ProtocolCodec;
use crate::constants::{PAYMENT_FRAME_FIELD, PAYMENT_FRAME_FIELD_ALT};
use crate::state::PaymentState;
use crate::tracker::PendingPaymentTracker;

#[cfg(feature = "telemetry")]
use tracing::instrument;

/// The two streaming wire formats the core demultiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Newline-delimited JSON: one JSON object per line.
    Ndjson,
    /// Server-sent events: `data:`-prefixed lines, blank-line delimited.
    Sse,
}

impl StreamFormat {
    /// Infers the stream format from a response `Content-Type` value, if it
    /// names a recognized streaming format.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or(content_type).trim();
        match essence {
            crate::constants::CONTENT_TYPE_SSE => Some(Self::Sse),
            crate::constants::CONTENT_TYPE_NDJSON => Some(Self::Ndjson),
            _ => None,
        }
    }
}

/// Approximate number of buffered chunks before the background pump applies
/// backpressure to the upstream read, derived from the configured
/// high-water mark under an assumed average chunk size.
fn channel_capacity(high_water_mark: usize) -> usize {
    (high_water_mark / 4096).clamp(8, 4096)
}

/// A business-data-only byte stream, with payment-frame extraction and
/// timeout extension running in the background.
pub struct StreamFilter {
    receiver: mpsc::Receiver<Bytes>,
}

impl Stream for StreamFilter {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Spawns the background pump and returns the business-data stream it
/// feeds.
///
/// `upstream` is the raw response body chunk stream (errors are treated as
/// stream end — the caller's timeout or abort path takes over from there,
/// per spec §4.7's "on stream error" rule). `client_tx_ref` identifies the
/// single request this stream belongs to, for the per-request free-on-end
/// policy (spec §9's Open Question: per-request, not all-pending).
#[allow(clippy::too_many_arguments)]
pub fn spawn<S, E>(
    mut upstream: S,
    format: StreamFormat,
    client_tx_ref: String,
    state: std::sync::Arc<PaymentState>,
    tracker: std::sync::Arc<PendingPaymentTracker>,
    classifier: std::sync::Arc<ResponseClassifier>,
    codec: ProtocolCodec,
    idle_extension: Duration,
    high_water_mark: usize,
) -> StreamFilter
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity(high_water_mark));

    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let mut saw_payment_frame = false;

        while let Some(chunk) = futures_util::StreamExt::next(&mut upstream).await {
            let Ok(chunk) = chunk else { break };
            tracker.extend_timeout(&client_tx_ref, idle_extension);
            buf.extend_from_slice(&chunk);

            match format {
                StreamFormat::Ndjson => {
                    drain_ndjson(&mut buf, &tx, &state, &tracker, &classifier, &codec, &client_tx_ref, &mut saw_payment_frame).await;
                }
                StreamFormat::Sse => {
                    drain_sse(&mut buf, &tx, &state, &tracker, &classifier, &codec, &client_tx_ref, &mut saw_payment_frame).await;
                }
            }
        }

        // Flush whatever is left (a final line/event with no trailing
        // delimiter) as business data; a trailing protocol frame missing
        // its delimiter is a malformed stream and simply passes through
        // unrecognized, which is safe (the request then times out rather
        // than hanging silently on a corrupt frame).
        if !buf.is_empty() {
            let _ = tx.send(buf.freeze()).await;
        }

        if !saw_payment_frame {
            tracker.resolve_by_ref(&client_tx_ref, None);
        }
    });

    StreamFilter { receiver: rx }
}

async fn drain_ndjson(
    buf: &mut BytesMut,
    tx: &mpsc::Sender<Bytes>,
    state: &PaymentState,
    tracker: &PendingPaymentTracker,
    classifier: &ResponseClassifier,
    codec: &ProtocolCodec,
    client_tx_ref: &str,
    saw_payment_frame: &mut bool,
) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line = buf.split_to(pos + 1);
        let _ = line.split_off(line.len() - 1); // drop the trailing '\n'
        handle_ndjson_line(&line, tx, state, tracker, classifier, codec, client_tx_ref, saw_payment_frame).await;
    }
}

#[cfg_attr(feature = "telemetry", instrument(name = "subrav.stream.frame", skip_all))]
async fn handle_ndjson_line(
    line: &[u8],
    tx: &mpsc::Sender<Bytes>,
    state: &PaymentState,
    tracker: &PendingPaymentTracker,
    classifier: &ResponseClassifier,
    codec: &ProtocolCodec,
    client_tx_ref: &str,
    saw_payment_frame: &mut bool,
) {
    if let Some(token) = extract_payment_frame_field(line) {
        if let Ok(header) = codec.decode_response(&token) {
            apply_frame(state, tracker, classifier, client_tx_ref, header);
            *saw_payment_frame = true;
            return;
        }
    }
    let mut forwarded = BytesMut::from(line);
    forwarded.extend_from_slice(b"\n");
    let _ = tx.send(forwarded.freeze()).await;
}

#[cfg_attr(feature = "telemetry", instrument(name = "subrav.stream.frame", skip_all))]
async fn drain_sse(
    buf: &mut BytesMut,
    tx: &mpsc::Sender<Bytes>,
    state: &PaymentState,
    tracker: &PendingPaymentTracker,
    classifier: &ResponseClassifier,
    codec: &ProtocolCodec,
    client_tx_ref: &str,
    saw_payment_frame: &mut bool,
) {
    loop {
        let Some(pos) = find_blank_line(buf) else { break };
        let event = buf.split_to(pos);
        // `find_blank_line` matched the literal `\n\n` starting at `pos`;
        // both bytes of it are still at the front of `buf` and must be
        // dropped here, or the next event picks up a stray leading `\n`.
        let _ = buf.split_to(2);

        let is_payment_frame = event
            .split(|&b| b == b'\n')
            .filter_map(|line| line.strip_prefix(b"data:").or_else(|| line.strip_prefix(b"data: ")))
            .find_map(extract_payment_frame_field);

        if let Some(token) = is_payment_frame {
            if let Ok(header) = codec.decode_response(&token) {
                apply_frame(state, tracker, classifier, client_tx_ref, header);
                *saw_payment_frame = true;
                continue;
            }
        }

        let mut forwarded = BytesMut::from(&event[..]);
        forwarded.extend_from_slice(b"\n\n");
        let _ = tx.send(forwarded.freeze()).await;
    }
}

/// Finds the index of the first blank-line event delimiter in `buf`.
fn find_blank_line(buf: &BytesMut) -> Option<usize> {
    let bytes = &buf[..];
    bytes.windows(2).position(|w| w == b"\n\n")
}

fn extract_payment_frame_field(line: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(line).ok()?;
    let obj = value.as_object()?;
    obj.get(PAYMENT_FRAME_FIELD)
        .or_else(|| obj.get(PAYMENT_FRAME_FIELD_ALT))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

fn apply_frame(
    state: &PaymentState,
    tracker: &PendingPaymentTracker,
    classifier: &ResponseClassifier,
    client_tx_ref: &str,
    header: ResponsePaymentHeader,
) {
    let _ = classifier.classify(state, tracker, client_tx_ref, Some(header), StatusCode::OK, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::stream;
    use subrav::channel::ChannelId;
    use subrav::protocol::SettlementInfo;
    use subrav::subrav::{SignedSubRav, PROTOCOL_VERSION};
    use subrav::BigAmount;

    use crate::policy::DefaultMatchPolicy;

    fn rav() -> SignedSubRav {
        SignedSubRav {
            sub_rav: subrav::subrav::SubRav {
                chain_id: BigAmount::new(1),
                channel_id: ChannelId::from_bytes([1u8; 32]),
                channel_epoch: BigAmount::ZERO,
                vm_id_fragment: "k1".to_owned(),
                accumulated_amount: BigAmount::new(10),
                nonce: BigAmount::new(1),
                version: PROTOCOL_VERSION,
            },
            signature: "sig".to_owned(),
        }
    }

    #[tokio::test]
    async fn ndjson_forwards_business_lines_and_extracts_payment_frame() {
        let codec = ProtocolCodec::new();
        let header = ResponsePaymentHeader::Success(SettlementInfo {
            client_tx_ref: "tx-1".to_owned(),
            cost: BigAmount::new(10),
            cost_usd: None,
            service_tx_ref: None,
            sub_rav: rav(),
        });
        let token = codec.encode_response(&header).unwrap();
        let body = format!(
            "{{\"token\":\"hi\"}}\n{{\"__nuwa_payment_header__\":\"{token}\"}}\n{{\"token\":\"!\"}}\n"
        );

        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(body))];
        let upstream = stream::iter(chunks);

        let state = Arc::new(PaymentState::new());
        let tracker = Arc::new(PendingPaymentTracker::new());
        let rx = tracker.create("tx-1".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        let classifier = Arc::new(ResponseClassifier::new(Arc::new(DefaultMatchPolicy)));

        let mut filtered = spawn(
            upstream,
            StreamFormat::Ndjson,
            "tx-1".to_owned(),
            state,
            tracker,
            classifier,
            codec,
            Duration::from_secs(5),
            1024 * 1024,
        );

        let mut collected = Vec::new();
        while let Some(chunk) = futures_util::StreamExt::next(&mut filtered).await {
            collected.extend_from_slice(&chunk);
        }
        let business = String::from_utf8(collected).unwrap();
        assert_eq!(business, "{\"token\":\"hi\"}\n{\"token\":\"!\"}\n");

        let info = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(info.nonce, BigAmount::new(1));
    }

    #[tokio::test]
    async fn stream_end_without_payment_frame_frees_only_this_request() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"{\"token\":\"hi\"}\n"))];
        let upstream = stream::iter(chunks);

        let state = Arc::new(PaymentState::new());
        let tracker = Arc::new(PendingPaymentTracker::new());
        let rx_this = tracker.create("tx-1".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        let rx_other = tracker.create("tx-2".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));
        let classifier = Arc::new(ResponseClassifier::new(Arc::new(DefaultMatchPolicy)));

        let mut filtered = spawn(
            upstream,
            StreamFormat::Ndjson,
            "tx-1".to_owned(),
            state,
            tracker.clone(),
            classifier,
            ProtocolCodec::new(),
            Duration::from_secs(5),
            1024,
        );
        while futures_util::StreamExt::next(&mut filtered).await.is_some() {}

        assert_eq!(rx_this.await.unwrap().unwrap(), None);
        assert_eq!(tracker.pending_count(), 1);
        drop(rx_other);
    }

    #[test]
    fn infers_format_from_content_type_with_charset() {
        assert_eq!(
            StreamFormat::from_content_type("application/x-ndjson; charset=utf-8"),
            Some(StreamFormat::Ndjson)
        );
        assert_eq!(StreamFormat::from_content_type("text/plain"), None);
    }
}
