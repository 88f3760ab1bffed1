//! Decides what a response means for in-flight payments.
//!
//! Implements the response classification policy table and its ambiguous-
//! success matching rule. The classifier mutates [`PaymentState`] (the
//! cached pending proposal, the progression baseline) and
//! [`PendingPaymentTracker`] (resolving/rejecting pending entries); it never
//! touches HTTP or persistence directly — the caller
//! ([`crate::dispatcher::PaymentChannelClient`]) owns sending the request
//! and persisting the resulting state, and is free to defer to
//! [`crate::stream::StreamFilter`] when [`ResponseOutcome::DeferToStream`]
//! comes back.

use std::sync::Arc;

use http::StatusCode;
use subrav::error::{InvalidProgressionError, ProtocolError};
use subrav::protocol::ResponsePaymentHeader;
use subrav::subrav::{SignedSubRav, SubRav};
use subrav::{BigAmount, EngineError, ProtocolErrorCode};

use crate::policy::MatchPolicy;
use crate::state::PaymentState;
use crate::tracker::{PaymentInfo, PendingPaymentTracker};

#[cfg(feature = "telemetry")]
use tracing::instrument;

/// What a classified response means for the dispatcher's control flow.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// The response carried no protocol header and the body is a
    /// streaming content type; defer to the stream filter.
    DeferToStream,
    /// Every affected pending entry was resolved or rejected already;
    /// nothing further to do for this response. Carries the settlement
    /// details worth a transaction-log entry only when a pending payment
    /// was actually resolved with a service-reported cost — a rejection,
    /// a free resolution, or a cached-for-next-request proposal carries
    /// `None`.
    Settled(Option<SettledPayment>),
    /// The protocol header reported `PAYMENT_REQUIRED` with an embedded
    /// Sub-RAV proposal: the dispatcher should sign it and retry the
    /// request exactly once.
    RetryWithProposal(SubRav),
}

/// Settlement details for a single request, recorded to the transaction
/// log by the dispatcher. `cost` is this request's own cost, not the
/// Sub-RAV's cumulative `accumulated_amount`.
#[derive(Debug, Clone)]
pub struct SettledPayment {
    /// The `clientTxRef` whose pending payment was resolved.
    pub client_tx_ref: String,
    /// This request's cost, as reported by the service.
    pub cost: BigAmount,
    /// The service-side transaction reference, if the service sent one.
    pub service_tx_ref: Option<String>,
    /// The signed Sub-RAV the service countersigned for this request.
    pub sub_rav: SignedSubRav,
}

/// Classifies HTTP responses against the in-flight pending-payment map.
pub struct ResponseClassifier {
    match_policy: Arc<dyn MatchPolicy>,
}

impl ResponseClassifier {
    /// Creates a classifier using the given matching policy for ambiguous
    /// `success` responses.
    #[must_use]
    pub fn new(match_policy: Arc<dyn MatchPolicy>) -> Self {
        Self { match_policy }
    }

    /// Classifies a single HTTP response belonging to the request
    /// correlated by `client_tx_ref`.
    ///
    /// `header` is `None` when the response carried no parseable payment
    /// header at all. `is_streaming` indicates a chunked body of a
    /// recognized streaming content type.
    #[cfg_attr(feature = "telemetry", instrument(name = "subrav.classify.response", skip_all))]
    pub fn classify(
        &self,
        state: &PaymentState,
        tracker: &PendingPaymentTracker,
        client_tx_ref: &str,
        header: Option<ResponsePaymentHeader>,
        http_status: StatusCode,
        is_streaming: bool,
    ) -> ResponseOutcome {
        match header {
            Some(ResponsePaymentHeader::Error { code, message, sub_rav }) => {
                self.classify_error(state, tracker, client_tx_ref, code, message, sub_rav)
            }
            Some(ResponsePaymentHeader::Success(info)) => {
                self.classify_success(state, tracker, client_tx_ref, info)
            }
            None if is_streaming => ResponseOutcome::DeferToStream,
            None => self.classify_headerless(state, tracker, client_tx_ref, http_status),
        }
    }

    fn classify_error(
        &self,
        state: &PaymentState,
        tracker: &PendingPaymentTracker,
        client_tx_ref: &str,
        code: subrav::protocol::WireErrorCode,
        message: String,
        sub_rav: Option<subrav::subrav::SignedSubRav>,
    ) -> ResponseOutcome {
        let protocol_error = ProtocolError {
            code: code.0,
            message,
        };

        if code.0 == ProtocolErrorCode::PaymentRequired {
            if let Some(proposal) = sub_rav {
                // Reject the request's own pending before the dispatcher
                // signs and retries: the old pending is dead regardless of
                // how the retry turns out.
                tracker.reject_by_ref(client_tx_ref, EngineError::Protocol(protocol_error));
                state.clear_pending_sub_rav();
                return ResponseOutcome::RetryWithProposal(proposal.sub_rav);
            }
        }

        state.clear_pending_sub_rav();
        if tracker.contains(client_tx_ref) {
            tracker.reject_by_ref(client_tx_ref, EngineError::Protocol(protocol_error));
        } else if let Some(sole) = tracker.sole_pending_id() {
            tracker.reject_by_ref(&sole, EngineError::Protocol(protocol_error));
        } else {
            tracker.reject_all(|| EngineError::Protocol(protocol_error.clone()));
        }
        ResponseOutcome::Settled(None)
    }

    fn classify_success(
        &self,
        state: &PaymentState,
        tracker: &PendingPaymentTracker,
        client_tx_ref: &str,
        info: subrav::protocol::SettlementInfo,
    ) -> ResponseOutcome {
        let matched_id = if tracker.contains(client_tx_ref) {
            Some(client_tx_ref.to_owned())
        } else if tracker.is_recently_rejected(client_tx_ref) {
            return ResponseOutcome::Settled(None);
        } else {
            self.match_policy.resolve(tracker, &info.sub_rav.sub_rav)
        };

        let Some(matched_id) = matched_id else {
            // No pending at all: cache the proposal for the next request.
            let _ = state.try_cache_proposal(info.sub_rav.sub_rav.clone());
            return ResponseOutcome::Settled(None);
        };

        let sent = tracker.sent_sub_rav(&matched_id);
        if let Err(violation) = subrav::subrav::validate_progression(
            sent.as_ref().map(|s| &s.sub_rav),
            &info.sub_rav.sub_rav,
        ) {
            let err = EngineError::InvalidProgression(InvalidProgressionError {
                violation,
                sent: sent.map(|s| s.sub_rav),
                received: info.sub_rav.sub_rav,
            });
            tracker.reject_by_ref(&matched_id, err);
            return ResponseOutcome::Settled(None);
        }

        // Progression is legal; cache it and resolve the matched payment.
        // try_cache_proposal re-validates against the baseline, which by
        // construction is `sent` (or absent in free mode), so this cannot
        // fail here.
        let _ = state.try_cache_proposal(info.sub_rav.sub_rav.clone());
        let settled_payment = SettledPayment {
            client_tx_ref: matched_id.clone(),
            cost: info.cost,
            service_tx_ref: info.service_tx_ref.clone(),
            sub_rav: info.sub_rav.clone(),
        };
        tracker.resolve_by_ref(
            &matched_id,
            Some(PaymentInfo {
                cost: info.cost,
                cost_usd: info.cost_usd,
                nonce: info.sub_rav.sub_rav.nonce,
                service_tx_ref: info.service_tx_ref,
            }),
        );
        ResponseOutcome::Settled(Some(settled_payment))
    }

    fn classify_headerless(
        &self,
        state: &PaymentState,
        tracker: &PendingPaymentTracker,
        client_tx_ref: &str,
        http_status: StatusCode,
    ) -> ResponseOutcome {
        match http_status {
            StatusCode::PAYMENT_REQUIRED => {
                state.clear_pending_sub_rav();
                tracker.reject_by_ref(client_tx_ref, EngineError::Protocol(ProtocolError {
                    code: ProtocolErrorCode::PaymentRequired,
                    message: "service returned 402 with no payment header".to_owned(),
                }));
                ResponseOutcome::Settled(None)
            }
            StatusCode::CONFLICT => {
                state.clear_pending_sub_rav();
                tracker.reject_by_ref(client_tx_ref, EngineError::Protocol(ProtocolError {
                    code: ProtocolErrorCode::RavConflict,
                    message: "service returned 409 with no payment header".to_owned(),
                }));
                ResponseOutcome::Settled(None)
            }
            _ => {
                tracker.resolve_all_as_free();
                ResponseOutcome::Settled(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use subrav::channel::ChannelId;
    use subrav::protocol::SettlementInfo;
    use subrav::subrav::{SignedSubRav, PROTOCOL_VERSION};
    use subrav::BigAmount;

    use crate::policy::DefaultMatchPolicy;

    fn classifier() -> ResponseClassifier {
        ResponseClassifier::new(Arc::new(DefaultMatchPolicy))
    }

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
    async fn headerless_2xx_resolves_all_pending_as_free() {
        let state = PaymentState::new();
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create("tx-1".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));

        let outcome = classifier().classify(&state, &tracker, "tx-1", None, StatusCode::OK, false);
        assert!(matches!(outcome, ResponseOutcome::Settled(None)));
        assert_eq!(rx.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn headerless_402_rejects_and_clears_pending() {
        let state = PaymentState::new();
        state.try_cache_proposal(rav(1)).unwrap();
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create("tx-1".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));

        classifier().classify(&state, &tracker, "tx-1", None, StatusCode::PAYMENT_REQUIRED, false);
        assert!(state.pending_sub_rav().is_none());
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ProtocolErrorCode::PaymentRequired);
    }

    #[tokio::test]
    async fn headerless_409_rejects_as_rav_conflict() {
        let state = PaymentState::new();
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create("tx-1".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));

        classifier().classify(&state, &tracker, "tx-1", None, StatusCode::CONFLICT, false);
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ProtocolErrorCode::RavConflict);
    }

    #[tokio::test]
    async fn streaming_without_header_defers() {
        let state = PaymentState::new();
        let tracker = PendingPaymentTracker::new();
        let outcome = classifier().classify(&state, &tracker, "tx-1", None, StatusCode::OK, true);
        assert!(matches!(outcome, ResponseOutcome::DeferToStream));
    }

    #[tokio::test]
    async fn success_with_exact_match_caches_proposal_and_resolves() {
        let state = PaymentState::new();
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create(
            "tx-1".to_owned(),
            None,
            None,
            None,
            Duration::from_secs(5),
            Box::new(|| {}),
        );

        let header = ResponsePaymentHeader::Success(SettlementInfo {
            client_tx_ref: "tx-1".to_owned(),
            cost: BigAmount::new(10),
            cost_usd: None,
            service_tx_ref: None,
            sub_rav: SignedSubRav {
                sub_rav: rav(1),
                signature: "sig".to_owned(),
            },
        });

        let outcome = classifier().classify(&state, &tracker, "tx-1", Some(header), StatusCode::OK, false);
        assert_eq!(state.pending_sub_rav(), Some(rav(1)));
        let info = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(info.nonce, BigAmount::new(1));
        match outcome {
            ResponseOutcome::Settled(Some(settled)) => {
                assert_eq!(settled.client_tx_ref, "tx-1");
                assert_eq!(settled.cost, BigAmount::new(10));
            }
            other => panic!("expected a settled payment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_progression_violation_rejects_and_leaves_cache_untouched() {
        let state = PaymentState::new();
        state.mark_signed(SignedSubRav { sub_rav: rav(5), signature: "sig".to_owned() });
        state.try_cache_proposal(rav(6)).unwrap();
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create(
            "tx-1".to_owned(),
            Some(SignedSubRav { sub_rav: rav(5), signature: "sig".to_owned() }),
            None,
            None,
            Duration::from_secs(5),
            Box::new(|| {}),
        );

        // service regresses to nonce 1, below the sent baseline of 5
        let header = ResponsePaymentHeader::Success(SettlementInfo {
            client_tx_ref: "tx-1".to_owned(),
            cost: BigAmount::new(10),
            cost_usd: None,
            service_tx_ref: None,
            sub_rav: SignedSubRav { sub_rav: rav(1), signature: "sig".to_owned() },
        });

        classifier().classify(&state, &tracker, "tx-1", Some(header), StatusCode::OK, false);
        assert_eq!(state.pending_sub_rav(), Some(rav(6)));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ProtocolErrorCode::InvalidProgression);
    }

    #[tokio::test]
    async fn error_with_embedded_sub_rav_signals_retry() {
        let state = PaymentState::new();
        let tracker = PendingPaymentTracker::new();
        let rx = tracker.create("tx-1".to_owned(), None, None, None, Duration::from_secs(5), Box::new(|| {}));

        let header = ResponsePaymentHeader::Error {
            code: subrav::protocol::WireErrorCode(ProtocolErrorCode::PaymentRequired),
            message: "pay up".to_owned(),
            sub_rav: Some(SignedSubRav { sub_rav: rav(3), signature: "sig".to_owned() }),
        };

        let outcome = classifier().classify(&state, &tracker, "tx-1", Some(header), StatusCode::PAYMENT_REQUIRED, false);
        match outcome {
            ResponseOutcome::RetryWithProposal(proposal) => assert_eq!(proposal.nonce, BigAmount::new(3)),
            other => panic!("expected retry, got {other:?}"),
        }
        // old pending was rejected, not left hanging
        assert!(rx.await.unwrap().is_err());
    }
}
