//! Namespaced load/store of engine state through a [`KvStore`].
//!
//! Per spec §4.6/§6, persisted state is keyed by `(host, payerDid)`. This
//! engine keys it by [`SubChannelKey`] instead: the [`ChannelId`] a
//! `ChannelCapability::ensure_channel_ready` hands back is already scoped to
//! exactly one host/payer pair (one channel per counterparty), so pairing it
//! with the channel epoch and the engine's signing-key fragment is a
//! strictly more specific namespace than `(host, payerDid)` with no loss of
//! discriminating power — see DESIGN.md for the full rationale.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use subrav::capability::CapabilityError;
use subrav::channel::SubChannelKey;
use subrav::persist::{KvStore, PersistedState};

use crate::state::PaymentState;

/// Loads and writes a [`PaymentState`] snapshot through a [`KvStore`].
pub struct Persistor {
    store: Arc<dyn KvStore>,
}

impl Persistor {
    /// Wraps a [`KvStore`] backend.
    #[must_use]
    pub const fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Loads persisted state for `key` into `state`, if a record exists.
    ///
    /// A missing or invalid record resolves to "no state" per spec §4.6,
    /// rather than an error: a corrupt or absent entry should not block
    /// startup, it should just start the engine from a clean slate.
    ///
    /// # Errors
    ///
    /// Returns an error only if the underlying store itself fails (not for
    /// a missing or structurally-invalid record).
    pub async fn load(&self, key: &SubChannelKey, state: &PaymentState) -> Result<(), CapabilityError> {
        let Some(persisted) = self.store.get(key).await? else {
            return Ok(());
        };

        state.set_channel_id(persisted.channel_id);
        if let Some(confirmed) = persisted.last_confirmed_sub_rav {
            state.mark_signed(confirmed);
        }
        // Re-applying a recovered pending proposal for an unchanged fragment
        // and prior Sub-RAV is a no-op per spec §8's idempotence law.
        if let Some(pending) = persisted.pending_sub_rav {
            state.adopt_recovered_pending(pending);
        }
        Ok(())
    }

    /// Persists the current snapshot of `state` for `key`.
    ///
    /// A no-op if the engine has never learned a channel id (nothing
    /// meaningful to persist yet).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails to write.
    pub async fn save(&self, key: &SubChannelKey, state: &PaymentState) -> Result<(), CapabilityError> {
        let Some(channel_id) = state.channel_id() else {
            return Ok(());
        };

        let record = PersistedState {
            channel_id,
            pending_sub_rav: state.pending_sub_rav(),
            last_confirmed_sub_rav: state.last_signed_sub_rav(),
            last_updated_ms: now_ms(),
        };
        self.store.put(key, &record).await
    }

    /// Deletes the persisted record for `key`, used by `logoutCleanup` when
    /// `clearMapping` is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails to delete.
    pub async fn delete(&self, key: &SubChannelKey) -> Result<(), CapabilityError> {
        self.store.delete(key).await
    }
}

/// Milliseconds since the Unix epoch, used to stamp persisted records and
/// transaction-log entries.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
