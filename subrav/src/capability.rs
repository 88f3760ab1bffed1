//! External collaborator traits.
//!
//! The engine never talks to a blockchain, a signer, a pricing oracle, or a
//! database directly: it depends on these traits, and the embedding
//! application supplies implementations. Every trait is dyn-compatible so
//! callers can hold `Arc<dyn Trait>` and swap implementations (a mock channel
//! in tests, a real one in production) without touching engine code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::amount::BigAmount;
use crate::channel::{ChannelId, SubChannelKey};
use crate::subrav::SignedSubRav;

/// A boxed, owned future, the standard shape for async trait methods on a
/// dyn-compatible trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A generic capability failure, boxed so implementors are not forced into
/// this crate's error type.
pub type CapabilityError = Box<dyn std::error::Error + Send + Sync>;

/// Service-discovery metadata returned by [`ChannelCapability::discover_service`].
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Base URL the service expects payment headers to be sent to.
    pub base_url: String,
    /// Settlement chain id the service accepts.
    pub chain_id: BigAmount,
}

/// Manages the lifecycle of the on-chain (or off-chain ledger) payment
/// channel backing the engine's Sub-RAVs.
///
/// Implementations own channel discovery, opening, and committing signed
/// receipts; the engine only calls these at well-defined points (before the
/// first request on a sub-channel, and when recovering from a `RAV_CONFLICT`
/// or similar service-reported state mismatch).
pub trait ChannelCapability: Send + Sync {
    /// Ensures a channel exists and is ready to back requests to `service`,
    /// opening one if necessary.
    fn ensure_channel_ready<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<ChannelId, CapabilityError>>;

    /// Discovers the service's accepted chain and base URL.
    fn discover_service<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<ServiceInfo, CapabilityError>>;

    /// Builds the fully-qualified URL a request to `path` on `service`
    /// should be sent to.
    fn build_payment_url<'a>(&'a self, service: &'a str, path: &'a str) -> BoxFuture<'a, Result<String, CapabilityError>>;

    /// Recovers local channel state after the service reports a conflict,
    /// returning the service's authoritative last-committed Sub-RAV for the
    /// given sub-channel, if any.
    fn recover_from_service<'a>(
        &'a self,
        sub_channel: &'a SubChannelKey,
    ) -> BoxFuture<'a, Result<Option<SignedSubRav>, CapabilityError>>;

    /// Commits a signed Sub-RAV as the new local high-water mark for its
    /// sub-channel, persisting it durably before the call returns.
    fn commit_sub_rav<'a>(&'a self, sub_rav: &'a SignedSubRav) -> BoxFuture<'a, Result<(), CapabilityError>>;
}

/// Produces DID-scoped cryptographic signatures over Sub-RAV proposals and
/// HTTP authorization headers.
pub trait SignerCapability: Send + Sync {
    /// Returns the payer's DID.
    fn get_did(&self) -> BoxFuture<'_, Result<String, CapabilityError>>;

    /// Lists the verification-method key ids available to sign with.
    fn list_key_ids(&self) -> BoxFuture<'_, Result<Vec<String>, CapabilityError>>;

    /// Signs a Sub-RAV, returning the opaque signature string.
    fn sign_sub_rav<'a>(
        &'a self,
        sub_rav: &'a crate::subrav::SubRav,
        key_id: &'a str,
    ) -> BoxFuture<'a, Result<String, CapabilityError>>;

    /// Produces a DID auth header value for a plain (unpaid) request.
    fn generate_auth_header<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, Result<String, CapabilityError>>;
}

/// Supplies the conversion rate used to render a settled cost in a
/// human-readable currency alongside its raw on-chain amount.
pub trait RateProvider: Send + Sync {
    /// Returns the price of one base unit of the channel's asset, in
    /// pico-USD (`10^-12` USD), as of the call.
    fn get_price_pico_usd(&self) -> BoxFuture<'_, Result<u64, CapabilityError>>;
}

impl<T: ChannelCapability + ?Sized> ChannelCapability for Arc<T> {
    fn ensure_channel_ready<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<ChannelId, CapabilityError>> {
        (**self).ensure_channel_ready(service)
    }

    fn discover_service<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<ServiceInfo, CapabilityError>> {
        (**self).discover_service(service)
    }

    fn build_payment_url<'a>(&'a self, service: &'a str, path: &'a str) -> BoxFuture<'a, Result<String, CapabilityError>> {
        (**self).build_payment_url(service, path)
    }

    fn recover_from_service<'a>(
        &'a self,
        sub_channel: &'a SubChannelKey,
    ) -> BoxFuture<'a, Result<Option<SignedSubRav>, CapabilityError>> {
        (**self).recover_from_service(sub_channel)
    }

    fn commit_sub_rav<'a>(&'a self, sub_rav: &'a SignedSubRav) -> BoxFuture<'a, Result<(), CapabilityError>> {
        (**self).commit_sub_rav(sub_rav)
    }
}

impl<T: SignerCapability + ?Sized> SignerCapability for Arc<T> {
    fn get_did(&self) -> BoxFuture<'_, Result<String, CapabilityError>> {
        (**self).get_did()
    }

    fn list_key_ids(&self) -> BoxFuture<'_, Result<Vec<String>, CapabilityError>> {
        (**self).list_key_ids()
    }

    fn sign_sub_rav<'a>(
        &'a self,
        sub_rav: &'a crate::subrav::SubRav,
        key_id: &'a str,
    ) -> BoxFuture<'a, Result<String, CapabilityError>> {
        (**self).sign_sub_rav(sub_rav, key_id)
    }

    fn generate_auth_header<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, Result<String, CapabilityError>> {
        (**self).generate_auth_header(key_id)
    }
}

impl<T: RateProvider + ?Sized> RateProvider for Arc<T> {
    fn get_price_pico_usd(&self) -> BoxFuture<'_, Result<u64, CapabilityError>> {
        (**self).get_price_pico_usd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatRate(u64);

    impl RateProvider for FlatRate {
        fn get_price_pico_usd(&self) -> BoxFuture<'_, Result<u64, CapabilityError>> {
            let price = self.0;
            Box::pin(async move { Ok(price) })
        }
    }

    #[tokio::test]
    async fn arc_blanket_impl_delegates() {
        let provider: Arc<dyn RateProvider> = Arc::new(FlatRate(42));
        assert_eq!(provider.get_price_pico_usd().await.unwrap(), 42);
    }
}
