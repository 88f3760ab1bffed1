//! Per-request lifecycle orchestration: the engine's public surface.
//!
//! Mirrors the teacher's `X402Client` (`examples/qntx-r402/r402-http/src/
//! client/middleware.rs`), generalized from "intercept a bare 402" into the
//! full prepare→sign→send→classify→retry pipeline spec §4.4 describes.
//! Unlike the teacher's client, signing happens *before* the first send
//! (a cached pending Sub-RAV, if any) rather than only reactively after a
//! 402 — so [`PaymentChannelClient`] drives its own [`reqwest_middleware::ClientWithMiddleware`]
//! directly instead of registering itself as middleware on someone else's.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use subrav::capability::{ChannelCapability, RateProvider, ServiceInfo, SignerCapability};
use subrav::channel::{ChannelId, SubChannelKey};
use subrav::persist::{KvStore, PersistedState, TransactionLog, TxLogEntry};
use subrav::protocol::{RequestPaymentHeader, ResponsePaymentHeader};
use subrav::subrav::{SignedSubRav, SubRav};
use subrav::{BigAmount, EngineError, ProtocolErrorCode};

use crate::classifier::{ResponseClassifier, ResponseOutcome, SettledPayment};
use crate::codec::ProtocolCodec;
use crate::config::EngineBuilder;
use crate::constants::{
    AUTHORIZATION_HEADER, CORRELATION_HEADER, DID_AUTH_SCHEME, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER,
};
use crate::error::HttpError;
use crate::hooks::{EngineHooks, SettlementContext};
use crate::scheduler::RequestScheduler;
use crate::state::PaymentState;
use crate::stream::StreamFormat;
use crate::tracker::{PaymentFuture, PaymentInfo, PendingPaymentTracker};

/// A request, as the dispatcher needs to know it: no verb-specific sugar,
/// per spec.md §1 Non-goals — callers build their own `method`/`path`/
/// `headers`/`body`.
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    /// HTTP method.
    pub method: Method,
    /// Path (relative to the service's discovered or configured base URL).
    pub path: String,
    /// Extra headers to send; may include [`crate::constants::CORRELATION_HEADER`]
    /// to pin the `clientTxRef`.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

/// A response body, either fully buffered or a filtered business-data
/// stream with its payment frame already extracted (see [`crate::stream`]).
///
/// A plain [`reqwest::Response`] cannot be handed back here: once the
/// engine inspects the body to classify payment (or demultiplex a
/// streaming payment frame), the original body is consumed. This wrapper
/// is the minimal shape that survives that inspection.
pub enum EngineBody {
    /// The full response body, already read.
    Buffered(Bytes),
    /// A streamed response body with its payment frame filtered out.
    Streamed(Pin<Box<dyn Stream<Item = Bytes> + Send>>),
}

/// A response as returned to a [`PaymentChannelClient`] caller.
pub struct EngineResponse {
    /// HTTP status code.
    pub status: reqwest::StatusCode,
    /// Response headers, minus the protocol payment header (already
    /// consumed during classification).
    pub headers: HeaderMap,
    /// The response body.
    pub body: EngineBody,
}

/// The result of [`PaymentChannelClient::request_with_payment`]: independent
/// futures for the HTTP response and the payment settlement, plus a
/// cooperative abort.
pub struct Handle {
    /// The `clientTxRef` correlating this request's wire traffic.
    pub client_tx_ref: String,
    /// Settles with the HTTP response (or an error), once sent.
    pub response: oneshot::Receiver<Result<EngineResponse, EngineError>>,
    /// Settles with this request's payment outcome.
    pub payment: PaymentFuture,
    abort_token: CancellationToken,
}

impl Handle {
    /// Cooperatively cancels this request: if it never started, `payment`
    /// resolves as free; if it is in flight, the scheduler's cancel signal
    /// races the HTTP send and classification.
    pub fn abort(&self) {
        self.abort_token.cancel();
    }

    /// Awaits both `response` and `payment`, per spec §8 invariant 3:
    /// `done` never settles before both have.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Aborted`] in either slot if the
    /// corresponding sender was dropped without sending (e.g. the engine
    /// task panicked), which should not happen in practice.
    pub async fn done(self) -> (Result<EngineResponse, EngineError>, Result<Option<PaymentInfo>, EngineError>) {
        let (response, payment) = tokio::join!(self.response, self.payment);
        (
            response.unwrap_or(Err(EngineError::Aborted)),
            payment.unwrap_or(Err(EngineError::Aborted)),
        )
    }
}

/// Options for [`PaymentChannelClient::logout_cleanup`].
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    /// Whether to delete the persisted record for the current sub-channel,
    /// rather than just writing back the reset (empty) state.
    pub clear_mapping: bool,
    /// An optional human-readable reason, surfaced on every pending
    /// payment's rejection.
    pub reason: Option<String>,
}

/// A snapshot of how much of the channel's authorized amount remains
/// unclaimed, per spec §6's `getUnsettledAmountForSubChannel`.
#[derive(Debug, Clone)]
pub struct UnsettledAmount {
    /// The channel this snapshot describes.
    pub channel_id: ChannelId,
    /// The sub-channel's signing-key fragment.
    pub vm_id_fragment: String,
    /// The accumulated amount the client has authorized (last signed
    /// Sub-RAV), the ceiling the service may eventually claim.
    pub authorized_accumulated: BigAmount,
    /// The sum of costs already recorded as settled in the transaction log.
    pub last_claimed: BigAmount,
    /// `authorized_accumulated - last_claimed`, saturating at zero.
    pub unsettled: BigAmount,
    /// `unsettled` converted to USD, if a rate provider is configured.
    pub unsettled_usd: Option<String>,
    /// The nonce of the last signed Sub-RAV, if any.
    pub latest_sub_rav_nonce: Option<BigAmount>,
}

/// Orchestrates the full per-request payment lifecycle over HTTP.
///
/// Cheaply [`Clone`] (every field is an `Arc` or a handle onto shared
/// state), so an embedding application can hand out clones freely — all
/// of them share the same scheduler, tracker, and state.
#[derive(Clone)]
pub struct PaymentChannelClient {
    config: crate::config::EngineConfig,
    http: ClientWithMiddleware,
    channel: Arc<dyn ChannelCapability>,
    signer: Arc<dyn SignerCapability>,
    rates: Option<Arc<dyn RateProvider>>,
    kv_store: Arc<dyn KvStore>,
    tx_log: Arc<dyn TransactionLog>,
    hooks: Arc<dyn EngineHooks>,
    scheduler: Arc<RequestScheduler>,
    tracker: Arc<PendingPaymentTracker>,
    classifier: Arc<ResponseClassifier>,
    codec: ProtocolCodec,
    state: Arc<PaymentState>,
    cleaned_up: Arc<AtomicBool>,
}

impl PaymentChannelClient {
    /// Builds a client from an [`EngineBuilder`].
    #[must_use]
    pub fn new(builder: EngineBuilder) -> Self {
        let http = ClientBuilder::new(builder.http).build();
        let tracker = Arc::new(PendingPaymentTracker::with_recently_rejected_ttl(
            builder.config.recently_rejected_ttl,
        ));
        Self {
            config: builder.config,
            http,
            channel: builder.channel,
            signer: builder.signer,
            rates: builder.rates,
            kv_store: builder.kv_store,
            tx_log: builder.tx_log,
            hooks: builder.hooks,
            scheduler: Arc::new(RequestScheduler::new()),
            tracker,
            classifier: Arc::new(ResponseClassifier::new(builder.match_policy)),
            codec: ProtocolCodec::new(),
            state: Arc::new(PaymentState::new()),
            cleaned_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Convenience wrapper over [`Self::request_with_payment`] that waits
    /// for the HTTP response and discards the payment outcome.
    ///
    /// # Errors
    ///
    /// Returns whatever error the response future settles with.
    pub async fn request(&self, init: RequestInit) -> Result<EngineResponse, EngineError> {
        let handle = self.request_with_payment(init);
        handle.response.await.unwrap_or(Err(EngineError::Aborted))
    }

    /// Issues a request and returns a [`Handle`] exposing independent
    /// `response`/`payment` futures, per spec §4.4/§6.
    #[must_use]
    pub fn request_with_payment(&self, init: RequestInit) -> Handle {
        let client_tx_ref = init
            .headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (response_tx, response_rx) = oneshot::channel();
        let (payment_tx, payment_rx) = oneshot::channel();
        let abort_token = CancellationToken::new();

        let this = self.clone();
        let task_client_tx_ref = client_tx_ref.clone();
        let task_abort = abort_token.clone();
        tokio::spawn(async move {
            this.run_request(init, task_client_tx_ref, task_abort, response_tx, payment_tx)
                .await;
        });

        Handle {
            client_tx_ref,
            response: response_rx,
            payment: payment_rx,
            abort_token,
        }
    }

    /// Convenience wrapper that issues a request and waits for both the
    /// response and the payment outcome, per spec §6's
    /// `requestAndWaitForPayment`.
    ///
    /// # Errors
    ///
    /// Returns the response error if the HTTP exchange itself failed;
    /// otherwise succeeds even if the payment settled with an error,
    /// surfacing that error in the second slot.
    pub async fn request_and_wait_for_payment(
        &self,
        init: RequestInit,
    ) -> Result<(EngineResponse, Result<Option<PaymentInfo>, EngineError>), EngineError> {
        let handle = self.request_with_payment(init);
        let (response, payment) = handle.done().await;
        response.map(|r| (r, payment))
    }

    async fn run_request(
        &self,
        init: RequestInit,
        client_tx_ref: String,
        abort: CancellationToken,
        response_tx: oneshot::Sender<Result<EngineResponse, EngineError>>,
        payment_tx: oneshot::Sender<Result<Option<PaymentInfo>, EngineError>>,
    ) {
        let ctx = SettlementContext {
            client_tx_ref: client_tx_ref.clone(),
        };
        self.hooks.before_admit(&ctx).await;

        if self.cleaned_up.load(Ordering::SeqCst) {
            let _ = response_tx.send(Err(EngineError::CleanedUp));
            let _ = payment_tx.send(Err(EngineError::CleanedUp));
            return;
        }

        let slot = match self.scheduler.admit(&abort).await {
            Ok(slot) => slot,
            Err(EngineError::Aborted) => {
                // Pre-start cancel: the payment bridge was never attached.
                let _ = response_tx.send(Err(EngineError::Aborted));
                let _ = payment_tx.send(Ok(None));
                return;
            }
            Err(err) => {
                let _ = response_tx.send(Err(err.clone_for_both()));
                let _ = payment_tx.send(Err(err));
                return;
            }
        };

        match self.prepare_and_send(&init, &client_tx_ref, &abort, &slot).await {
            Ok((engine_response, tracker_rx)) => {
                let _ = response_tx.send(Ok(engine_response));
                let result = tracker_rx.await.unwrap_or(Err(EngineError::Aborted));
                if let Err(err) = &result {
                    self.hooks.on_settle_failure(&ctx, err).await;
                } else {
                    self.hooks.after_settle(&ctx, result.as_ref().ok().and_then(Option::as_ref)).await;
                }
                let _ = payment_tx.send(result);
            }
            Err(EngineError::Aborted) => {
                // Post-start cancel: the pending payment was already
                // registered with the tracker (or never reached that far),
                // so free it as undefined rather than rejecting it, per
                // spec §4.4.2/§8 scenario 6.
                self.tracker.resolve_as_aborted(&client_tx_ref);
                slot.release();
                let _ = response_tx.send(Err(EngineError::Aborted));
                let _ = payment_tx.send(Ok(None));
            }
            Err(err) => {
                self.tracker.reject_by_ref(&client_tx_ref, err.clone_for_both());
                slot.release();
                let _ = response_tx.send(Err(err.clone_for_both()));
                let _ = payment_tx.send(Err(err));
            }
        }
    }

    /// Runs the admitted request's prepare→sign→send→classify pipeline,
    /// including at most one 402 auto-retry (spec §4.4.1). Returns the
    /// final response plus the (possibly re-created) pending payment
    /// future to await for settlement.
    async fn prepare_and_send(
        &self,
        init: &RequestInit,
        client_tx_ref: &str,
        abort: &CancellationToken,
        slot: &Arc<crate::scheduler::SchedulerSlot>,
    ) -> Result<(EngineResponse, PaymentFuture), EngineError> {
        let channel_id = self
            .channel
            .ensure_channel_ready(&self.config.service)
            .await
            .map_err(EngineError::Capability)?;
        self.state.set_channel_id(channel_id);

        let service_info = self
            .channel
            .discover_service(&self.config.service)
            .await
            .map_err(EngineError::Capability)?;
        self.state.set_channel_info(service_info);

        let url = self
            .channel
            .build_payment_url(&self.config.service, &init.path)
            .await
            .map_err(EngineError::Capability)?;

        let key_id = self.active_key_id().await?;

        let (header, signed) = self.sign_pending_or_free(client_tx_ref, &key_id).await?;
        let auth_header = self.signer.generate_auth_header(&key_id).await.map_err(EngineError::Capability)?;

        let tracker_rx = self.tracker.create(
            client_tx_ref.to_owned(),
            signed,
            Some(channel_id),
            None,
            self.config.default_timeout,
            slot.release_fn(),
        );

        let (status, headers, body, payment_header) =
            self.send_once(init, &url, &header, &auth_header, abort).await?;

        let is_streaming = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(StreamFormat::from_content_type);

        let outcome = self.classifier.classify(
            &self.state,
            &self.tracker,
            client_tx_ref,
            payment_header,
            status,
            is_streaming.is_some(),
        );

        let settled = match &outcome {
            ResponseOutcome::Settled(Some(settled)) => Some(settled.clone()),
            _ => None,
        };
        self.persist_state(settled.as_ref()).await;

        let (final_status, final_headers, final_body, final_outcome, tracker_rx) = match outcome {
            ResponseOutcome::RetryWithProposal(proposal) => {
                self.retry_once(init, client_tx_ref, &url, &proposal, &key_id, abort, slot).await?
            }
            other => (status, headers, body, other, tracker_rx),
        };

        // Recomputed from the *final* response (the retry's, if one
        // happened): the first response's content type is no longer
        // relevant once a retry has replaced it.
        let final_stream_format = final_headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(StreamFormat::from_content_type);

        let engine_body = match (final_outcome, final_stream_format, final_body) {
            (ResponseOutcome::DeferToStream, Some(format), Body::Raw(stream)) => {
                let filtered = crate::stream::spawn(
                    stream,
                    format,
                    client_tx_ref.to_owned(),
                    self.state.clone(),
                    self.tracker.clone(),
                    self.classifier.clone(),
                    self.codec,
                    self.config.default_timeout,
                    self.config.stream_high_water_mark,
                );
                EngineBody::Streamed(Box::pin(filtered))
            }
            (_, _, Body::Full(bytes)) => EngineBody::Buffered(bytes),
            (_, _, Body::Raw(stream)) => {
                // No payment frame handling needed; forward chunks verbatim.
                EngineBody::Streamed(Box::pin(stream.filter_map(|r| async move { r.ok() })))
            }
        };

        Ok((
            EngineResponse {
                status: final_status,
                headers: final_headers,
                body: engine_body,
            },
            tracker_rx,
        ))
    }

    async fn retry_once(
        &self,
        init: &RequestInit,
        client_tx_ref: &str,
        url: &str,
        proposal: &SubRav,
        key_id: &str,
        abort: &CancellationToken,
        slot: &Arc<crate::scheduler::SchedulerSlot>,
    ) -> Result<(reqwest::StatusCode, HeaderMap, Body, ResponseOutcome, PaymentFuture), EngineError> {
        let signature = self.signer.sign_sub_rav(proposal, key_id).await.map_err(EngineError::Capability)?;
        let signed = SignedSubRav {
            sub_rav: proposal.clone(),
            signature,
        };
        self.state.mark_signed(signed.clone());

        let header = RequestPaymentHeader::with_proposal(
            client_tx_ref.to_owned(),
            signed.sub_rav.accumulated_amount,
            signed.clone(),
        );
        // Fresh nonce on the retry's DID auth header, per spec §4.4.1.
        let auth_header = self.signer.generate_auth_header(key_id).await.map_err(EngineError::Capability)?;

        let tracker_rx = self.tracker.create(
            client_tx_ref.to_owned(),
            Some(signed),
            self.state.channel_id(),
            None,
            self.config.default_timeout,
            slot.release_fn(),
        );

        let (status, headers, body, payment_header) = self.send_once(init, url, &header, &auth_header, abort).await?;

        let is_streaming = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(StreamFormat::from_content_type)
            .is_some();

        let outcome = self.classifier.classify(&self.state, &self.tracker, client_tx_ref, payment_header, status, is_streaming);
        let settled = match &outcome {
            ResponseOutcome::Settled(Some(settled)) => Some(settled.clone()),
            _ => None,
        };
        self.persist_state(settled.as_ref()).await;

        Ok((status, headers, body, outcome, tracker_rx))
    }

    /// Encodes `header`, attaches the payment and DID-auth headers, and
    /// issues one HTTP call, racing it against `abort`.
    #[allow(clippy::too_many_lines)]
    #[cfg_attr(feature = "telemetry", instrument(name = "subrav.dispatch.send", skip_all, err))]
    async fn send_once(
        &self,
        init: &RequestInit,
        url: &str,
        header: &RequestPaymentHeader,
        auth_header: &str,
        abort: &CancellationToken,
    ) -> Result<(reqwest::StatusCode, HeaderMap, Body, Option<ResponsePaymentHeader>), EngineError> {
        let token = self.codec.encode_request(header).map_err(EngineError::from)?;
        let payment_value =
            HeaderValue::from_str(&token).map_err(|source| HttpError::InvalidHeaderValue { context: "x-payment", source })?;
        let auth_value = HeaderValue::from_str(auth_header)
            .map_err(|source| HttpError::InvalidHeaderValue { context: "authorization", source })?;

        let mut headers = init.headers.clone();
        headers.insert(PAYMENT_HEADER, payment_value);
        headers.insert(
            AUTHORIZATION_HEADER,
            HeaderValue::from_str(&format!("{DID_AUTH_SCHEME} {}", auth_value.to_str().unwrap_or_default()))
                .unwrap_or(auth_value),
        );

        let mut request = self.http.request(init.method.clone(), url).headers(headers);
        if let Some(body) = init.body.clone() {
            request = request.body(body);
        }

        let send = request.send();
        tokio::pin!(send);
        let response = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(EngineError::Aborted),
            res = &mut send => res.map_err(|source| HttpError::Transport { context: "request send", source })?,
        };

        let status = response.status();
        let mut headers = response.headers().clone();
        let payment_header = match headers.remove(PAYMENT_RESPONSE_HEADER) {
            Some(value) => {
                let token = value.to_str().map_err(|_| EngineError::Other(Box::new(HeaderNotUtf8)))?;
                Some(self.codec.decode_response(token).map_err(EngineError::from)?)
            }
            None => None,
        };

        let is_streaming = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(StreamFormat::from_content_type)
            .is_some();

        let body = if is_streaming && payment_header.is_none() {
            Body::Raw(Box::pin(response.bytes_stream().map(|r| r.map_err(|source| HttpError::Transport {
                context: "stream chunk",
                source: source.into(),
            }))))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|source| HttpError::Transport { context: "read body", source: source.into() })?;
            Body::Full(bytes)
        };

        Ok((status, headers, body, payment_header))
    }

    /// Returns the engine's active signing-key fragment, picking the first
    /// available key id on first use and caching it on [`PaymentState`].
    async fn active_key_id(&self) -> Result<String, EngineError> {
        if let Some(fragment) = self.state.vm_id_fragment() {
            return Ok(fragment);
        }
        let keys = self.signer.list_key_ids().await.map_err(EngineError::Capability)?;
        let key_id = keys.into_iter().next().ok_or_else(|| {
            EngineError::Capability(Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "signer has no key ids")))
        })?;
        self.state.set_vm_id_fragment(key_id.clone());
        Ok(key_id)
    }

    /// Implements the "sign-and-clear-pending must be atomic" rule (spec
    /// §9): takes and signs the cached proposal if one exists, else builds
    /// a free-mode header.
    async fn sign_pending_or_free(
        &self,
        client_tx_ref: &str,
        key_id: &str,
    ) -> Result<(RequestPaymentHeader, Option<SignedSubRav>), EngineError> {
        let Some(pending) = self.state.take_pending_for_signing() else {
            return Ok((RequestPaymentHeader::free(client_tx_ref.to_owned()), None));
        };
        let signature = self.signer.sign_sub_rav(&pending, key_id).await.map_err(EngineError::Capability)?;
        let signed = SignedSubRav {
            sub_rav: pending,
            signature,
        };
        self.state.mark_signed(signed.clone());
        let header = RequestPaymentHeader::with_proposal(client_tx_ref.to_owned(), signed.sub_rav.accumulated_amount, signed.clone());
        Ok((header, Some(signed)))
    }

    fn current_sub_channel_key(&self) -> Option<SubChannelKey> {
        let channel_id = self.state.channel_id()?;
        let vm_id_fragment = self.state.vm_id_fragment()?;
        let channel_epoch = self
            .state
            .last_signed_sub_rav()
            .map(|s| s.sub_rav.channel_epoch)
            .or_else(|| self.state.pending_sub_rav().map(|p| p.channel_epoch))
            .unwrap_or(BigAmount::ZERO);
        Some(SubChannelKey {
            channel_id,
            channel_epoch,
            vm_id_fragment,
        })
    }

    /// Saves the current state snapshot, and appends a transaction-log
    /// entry only when `settled` carries an actual per-request settlement
    /// (not every classified response is one — see
    /// [`ResponseOutcome::Settled`]), using its own reported `cost` rather
    /// than the Sub-RAV's cumulative `accumulated_amount`.
    async fn persist_state(&self, settled: Option<&SettledPayment>) {
        let Some(key) = self.current_sub_channel_key() else { return };
        let persistor = crate::persist::Persistor::new(self.kv_store.clone());
        let _ = persistor.save(&key, &self.state).await;

        if let Some(settled) = settled {
            let entry = TxLogEntry {
                client_tx_ref: settled.client_tx_ref.clone(),
                service_tx_ref: settled.service_tx_ref.clone(),
                sub_rav: settled.sub_rav.clone(),
                cost: settled.cost,
                recorded_at_ms: crate::persist::now_ms(),
            };
            let _ = self.tx_log.append(&key, entry).await;
        }
    }

    /// Returns the cached, not-yet-signed pending Sub-RAV, if any.
    #[must_use]
    pub fn get_pending_sub_rav(&self) -> Option<SubRav> {
        self.state.pending_sub_rav()
    }

    /// Clears the cached pending Sub-RAV, returning it.
    pub fn clear_pending_sub_rav(&self) -> Option<SubRav> {
        self.state.clear_pending_sub_rav()
    }

    /// Returns the current channel id, if known.
    #[must_use]
    pub fn get_channel_id(&self) -> Option<ChannelId> {
        self.state.channel_id()
    }

    /// Loads and returns the currently persisted state for the engine's
    /// sub-channel, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    pub async fn get_persisted_state(&self) -> Result<Option<PersistedState>, EngineError> {
        let Some(key) = self.current_sub_channel_key() else { return Ok(None) };
        self.kv_store.get(&key).await.map_err(EngineError::Capability)
    }

    /// Marks the engine cleaned-up: future requests are refused, every
    /// pending payment is rejected, `PaymentState` is reset, and the
    /// persisted record is either cleared or rewritten empty, per spec §5's
    /// logout-cleanup rules.
    ///
    /// # Errors
    ///
    /// Returns an error only if the persistence write/delete itself fails;
    /// the in-memory cleanup always completes.
    pub async fn logout_cleanup(&self, options: LogoutOptions) -> Result<(), EngineError> {
        self.cleaned_up.store(true, Ordering::SeqCst);
        self.scheduler.clear();

        let reason = options.reason.unwrap_or_else(|| "engine logged out".to_owned());
        self.tracker.reject_all(|| {
            EngineError::Protocol(subrav::error::ProtocolError {
                code: ProtocolErrorCode::InternalError,
                message: reason.clone(),
            })
        });

        let key = self.current_sub_channel_key();
        self.state.reset();

        if let Some(key) = key {
            if options.clear_mapping {
                self.kv_store.delete(&key).await.map_err(EngineError::Capability)?;
            } else {
                let persistor = crate::persist::Persistor::new(self.kv_store.clone());
                persistor.save(&key, &self.state).await.map_err(EngineError::Capability)?;
            }
        }
        Ok(())
    }

    /// Computes how much of the channel's currently-authorized amount has
    /// not yet been recorded as settled, per spec §6's
    /// `getUnsettledAmountForSubChannel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction log or rate provider fails, or
    /// if no sub-channel is known yet.
    pub async fn get_unsettled_amount_for_sub_channel(&self) -> Result<UnsettledAmount, EngineError> {
        let key = self
            .current_sub_channel_key()
            .ok_or_else(|| EngineError::Capability(Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "no sub-channel known yet"))))?;

        let authorized = self.state.last_signed_sub_rav().map(|s| s.sub_rav.accumulated_amount).unwrap_or(BigAmount::ZERO);
        let entries = self.tx_log.entries_for(&key).await.map_err(EngineError::Capability)?;
        let last_claimed = entries.iter().fold(BigAmount::ZERO, |acc, e| acc.saturating_add(e.cost));
        let unsettled = authorized.saturating_sub(last_claimed);

        let unsettled_usd = match &self.rates {
            Some(rate) => {
                let pico_usd = rate.get_price_pico_usd().await.map_err(EngineError::Capability)?;
                let usd = (unsettled.as_u128() as f64) * (pico_usd as f64) / 1e12;
                Some(format!("{usd:.6}"))
            }
            None => None,
        };

        Ok(UnsettledAmount {
            channel_id: key.channel_id,
            vm_id_fragment: key.vm_id_fragment,
            authorized_accumulated: authorized,
            last_claimed,
            unsettled,
            unsettled_usd,
            latest_sub_rav_nonce: self.state.last_signed_sub_rav().map(|s| s.sub_rav.nonce),
        })
    }
}

/// Internal representation of an HTTP body before streaming classification
/// has decided whether it needs frame extraction.
enum Body {
    Full(Bytes),
    Raw(Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>),
}

#[derive(Debug)]
struct HeaderNotUtf8;

impl std::fmt::Display for HeaderNotUtf8 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "response payment header is not valid utf-8")
    }
}

impl std::error::Error for HeaderNotUtf8 {}

trait CloneForBoth {
    fn clone_for_both(&self) -> Self;
}

impl CloneForBoth for EngineError {
    fn clone_for_both(&self) -> Self {
        match self {
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::InvalidProgression(e) => Self::InvalidProgression(e.clone()),
            Self::Timeout => Self::Timeout,
            Self::Aborted => Self::Aborted,
            Self::CleanedUp => Self::CleanedUp,
            // `Capability`/`Other` wrap a non-`Clone` boxed error; preserve
            // the message rather than silently downgrading to `CleanedUp`.
            other => Self::Protocol(subrav::error::ProtocolError {
                code: ProtocolErrorCode::InternalError,
                message: other.to_string(),
            }),
        }
    }
}
