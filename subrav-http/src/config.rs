//! Engine-level configuration and builder.
//!
//! Follows a fluent `with_*` builder style rather than a single large
//! constructor, so optional collaborators (rate provider, persistence,
//! lifecycle hooks, matching policy) can be supplied independently and
//! defaulted otherwise. Server-side resource configuration (static pricing,
//! route tables) is a payee concern and out of scope: this engine only
//! needs client-level tunables.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use subrav::capability::{ChannelCapability, RateProvider, SignerCapability};
use subrav::persist::{KvStore, TransactionLog};

use crate::constants::{DEFAULT_RECENTLY_REJECTED_TTL, DEFAULT_STREAM_HIGH_WATER_MARK, DEFAULT_TIMEOUT};
use crate::hooks::{EngineHooks, NoopHooks};
use crate::policy::{DefaultMatchPolicy, MatchPolicy};

/// Tunables governing timeouts, buffering, and persistence namespacing for
/// a [`crate::dispatcher::PaymentChannelClient`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default per-request payment timeout.
    pub default_timeout: Duration,
    /// How long a `clientTxRef` is retained in the recently-rejected set.
    pub recently_rejected_ttl: Duration,
    /// High-water mark, in bytes, for buffered business-stream bytes while
    /// the stream filter's background pump waits on a slow consumer.
    pub stream_high_water_mark: usize,
    /// The service identifier (host) this engine talks to, used both for
    /// `ChannelCapability` calls and as part of the persistence namespace.
    pub service: String,
}

impl EngineConfig {
    /// Creates a config for `service` with default tunables.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            recently_rejected_ttl: DEFAULT_RECENTLY_REJECTED_TTL,
            stream_high_water_mark: DEFAULT_STREAM_HIGH_WATER_MARK,
            service: service.into(),
        }
    }
}

/// Builds a [`crate::dispatcher::RequestDispatcher`] from its required
/// capabilities and optional tunables.
#[allow(missing_debug_implementations)] // holds dyn trait objects
pub struct EngineBuilder {
    pub(crate) config: EngineConfig,
    pub(crate) http: Client,
    pub(crate) channel: Arc<dyn ChannelCapability>,
    pub(crate) signer: Arc<dyn SignerCapability>,
    pub(crate) rates: Option<Arc<dyn RateProvider>>,
    pub(crate) kv_store: Arc<dyn KvStore>,
    pub(crate) tx_log: Arc<dyn TransactionLog>,
    pub(crate) hooks: Arc<dyn EngineHooks>,
    pub(crate) match_policy: Arc<dyn MatchPolicy>,
}

impl EngineBuilder {
    /// Starts building an engine for `service`, backed by `channel` and
    /// `signer`, using an in-memory store for persistence and the
    /// transaction log.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        channel: Arc<dyn ChannelCapability>,
        signer: Arc<dyn SignerCapability>,
    ) -> Self {
        let store = Arc::new(subrav::persist::InMemoryStore::new());
        Self {
            config: EngineConfig::new(service),
            http: Client::new(),
            channel,
            signer,
            rates: None,
            kv_store: store.clone(),
            tx_log: store,
            hooks: Arc::new(NoopHooks),
            match_policy: Arc::new(DefaultMatchPolicy),
        }
    }

    /// Overrides the `reqwest` client used for outgoing requests.
    #[must_use]
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Sets the default per-request payment timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Sets the stream high-water mark, in bytes.
    #[must_use]
    pub const fn with_stream_high_water_mark(mut self, bytes: usize) -> Self {
        self.config.stream_high_water_mark = bytes;
        self
    }

    /// Supplies a rate provider for USD-denominated cost reporting.
    #[must_use]
    pub fn with_rate_provider(mut self, rates: Arc<dyn RateProvider>) -> Self {
        self.rates = Some(rates);
        self
    }

    /// Overrides the persisted-state key/value store.
    #[must_use]
    pub fn with_kv_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.kv_store = store;
        self
    }

    /// Overrides the transaction log.
    #[must_use]
    pub fn with_transaction_log(mut self, log: Arc<dyn TransactionLog>) -> Self {
        self.tx_log = log;
        self
    }

    /// Sets the lifecycle hooks for payment settlement.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn EngineHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Overrides the success-classification matching policy (spec §4.5's
    /// matching rule, made pluggable — see [`crate::policy`]).
    #[must_use]
    pub fn with_match_policy(mut self, policy: Arc<dyn MatchPolicy>) -> Self {
        self.match_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_spec_defaults() {
        let config = EngineConfig::new("payee.example");
        assert_eq!(config.default_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.service, "payee.example");
    }
}
