#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP engine for the Sub-RAV payment-channel protocol.
//!
//! This crate wires the transport-agnostic types in [`subrav`] to an actual
//! HTTP request/response cycle: it encodes and decodes the `X-Payment` /
//! `X-Payment-Response` headers, classifies a response against the protocol's
//! success/error/free/stream outcomes, drives the 402-triggered retry
//! exactly once, demultiplexes in-band payment frames out of NDJSON/SSE
//! streaming bodies, and serializes concurrent callers onto a single-slot
//! FIFO scheduler so that Sub-RAV nonces progress in request order.
//!
//! The entry point is [`PaymentChannelClient`], built from an [`EngineBuilder`]
//! supplying the capability implementations ([`subrav::capability::ChannelCapability`],
//! [`subrav::capability::SignerCapability`], and friends) that connect the
//! engine to a concrete channel, signer, rate source, and persistence layer.
//!
//! # Modules
//!
//! - [`dispatcher`] - Per-request lifecycle: prepare, sign, send, classify, retry
//! - [`classifier`] - Response outcome policy table
//! - [`codec`] - Wire encoding/decoding of payment headers
//! - [`config`] - Engine configuration and builder
//! - [`constants`] - Header names, content types, and default tunables
//! - [`error`] - HTTP-layer error taxonomy
//! - [`hooks`] - Lifecycle hooks invoked around admission and settlement
//! - [`persist`] - Loading and saving persisted engine state
//! - [`policy`] - Pluggable ambiguous-success matching rule
//! - [`scheduler`] - Single-slot FIFO request admission
//! - [`state`] - In-memory Sub-RAV progression state for one sub-channel
//! - [`stream`] - NDJSON/SSE payment-frame demultiplexing
//! - [`tracker`] - Pending-payment promises keyed by client tx ref
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables `tracing` spans around dispatch, classification,
//!   and stream frame handling (`subrav.dispatch.send`, `subrav.classify.response`,
//!   `subrav.stream.frame`).

pub mod classifier;
pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod persist;
pub mod policy;
pub mod scheduler;
pub mod state;
pub mod stream;
pub mod tracker;

pub use crate::classifier::{ResponseClassifier, ResponseOutcome};
pub use crate::config::{EngineBuilder, EngineConfig};
pub use crate::dispatcher::{
    EngineBody, EngineResponse, Handle, LogoutOptions, PaymentChannelClient, RequestInit,
    UnsettledAmount,
};
pub use crate::error::HttpError;
pub use crate::hooks::{EngineHooks, NoopHooks, SettlementContext};
pub use crate::policy::{DefaultMatchPolicy, MatchPolicy};
pub use crate::stream::{StreamFilter, StreamFormat};
pub use crate::tracker::PaymentInfo;
