#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the Sub-RAV payment-channel protocol.
//!
//! A Sub-RAV ("Receipt-And-Voucher", sub-channel scope) is a signed,
//! cumulative, off-chain receipt that authorizes a payee to later claim
//! `accumulated_amount` from a payment channel at or after `nonce`. This
//! crate defines the wire-level shape of that receipt, the progression
//! invariants that keep a chain of receipts monotone, the error taxonomy
//! surfaced to callers, and the capability traits through which the engine
//! consumes its external collaborators (on-chain settlement, cryptographic
//! signing, pricing, and persistence).
//!
//! It is transport-agnostic: nothing here depends on HTTP, `reqwest`, or any
//! particular storage backend. See the `subrav-http` crate for the HTTP
//! engine built on top of these types.
//!
//! # Modules
//!
//! - [`subrav`] - The Sub-RAV receipt type and progression validation
//! - [`channel`] - Channel and sub-channel identifiers
//! - [`amount`] - Decimal-string big-integer wire types
//! - [`error`] - Error taxonomy for the payment-channel engine
//! - [`capability`] - External collaborator traits (channel, signer, rates, stores)
//! - [`persist`] - Persisted engine state shape
//! - [`protocol`] - Request/response payment header payloads
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables `tracing` instrumentation

pub mod amount;
pub mod capability;
pub mod channel;
pub mod error;
pub mod persist;
pub mod protocol;
pub mod subrav;

pub use crate::amount::BigAmount;
pub use crate::channel::{ChannelId, SubChannelKey};
pub use crate::error::{EngineError, ProtocolErrorCode};
pub use crate::subrav::{SignedSubRav, SubRav};
