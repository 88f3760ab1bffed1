//! Persisted engine state shape and the storage traits it flows through.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::amount::BigAmount;
use crate::channel::{ChannelId, SubChannelKey};
use crate::subrav::SignedSubRav;

use crate::capability::{BoxFuture, CapabilityError};

/// The durable state the engine needs to survive a process restart without
/// losing track of in-flight receipts.
///
/// One [`PersistedState`] exists per sub-channel; `pending_sub_rav` holds the
/// most recent *unsigned* proposal received from the service but not yet
/// signed into an outgoing request, so a restarted process can resume the
/// receipt chain instead of falling back to free mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// The channel this state belongs to.
    pub channel_id: ChannelId,
    /// The most recent unsigned Sub-RAV proposal, not yet signed and sent.
    pub pending_sub_rav: Option<crate::subrav::SubRav>,
    /// The last Sub-RAV the service is known to have accepted, used as the
    /// progression baseline for the next proposal.
    pub last_confirmed_sub_rav: Option<SignedSubRav>,
    /// Milliseconds since the Unix epoch this record was last written.
    pub last_updated_ms: u64,
}

/// A minimal async key-value store for [`PersistedState`], keyed by
/// [`SubChannelKey`].
///
/// Mirrors the shape of a small embedded store (e.g. `sled`, `redb`, or a
/// single SQL table); the engine does not care which.
pub trait KvStore: Send + Sync {
    /// Reads the persisted state for a sub-channel, if any.
    fn get<'a>(&'a self, key: &'a SubChannelKey) -> BoxFuture<'a, Result<Option<PersistedState>, CapabilityError>>;

    /// Writes the persisted state for a sub-channel, overwriting any
    /// previous value.
    fn put<'a>(&'a self, key: &'a SubChannelKey, state: &'a PersistedState) -> BoxFuture<'a, Result<(), CapabilityError>>;

    /// Removes the persisted state for a sub-channel.
    fn delete<'a>(&'a self, key: &'a SubChannelKey) -> BoxFuture<'a, Result<(), CapabilityError>>;
}

/// A single settled-payment record appended to a [`TransactionLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxLogEntry {
    /// The client-generated correlation id of the request this payment
    /// settled.
    pub client_tx_ref: String,
    /// The service-generated reference for the settlement, if the service
    /// provided one.
    pub service_tx_ref: Option<String>,
    /// The Sub-RAV that was committed for this payment.
    pub sub_rav: SignedSubRav,
    /// The cost of this single request, independent of the cumulative
    /// Sub-RAV total.
    pub cost: BigAmount,
    /// Milliseconds since the Unix epoch this entry was appended.
    pub recorded_at_ms: u64,
}

/// An append-only record of settled payments, used for auditing and for
/// computing per-sub-channel unsettled balances.
pub trait TransactionLog: Send + Sync {
    /// Appends a settlement record under its sub-channel.
    fn append<'a>(
        &'a self,
        sub_channel: &'a SubChannelKey,
        entry: TxLogEntry,
    ) -> BoxFuture<'a, Result<(), CapabilityError>>;

    /// Returns all entries recorded for a given sub-channel, in append order.
    fn entries_for<'a>(
        &'a self,
        sub_channel: &'a SubChannelKey,
    ) -> BoxFuture<'a, Result<Vec<TxLogEntry>, CapabilityError>>;
}

/// An in-memory [`KvStore`] and [`TransactionLog`], suitable for tests and
/// for embedding applications that don't need cross-process durability.
#[derive(Default)]
pub struct InMemoryStore {
    inner: std::sync::Mutex<InMemoryStoreInner>,
}

#[derive(Default)]
struct InMemoryStoreInner {
    state: HashMap<SubChannelKey, PersistedState>,
    log: HashMap<SubChannelKey, Vec<TxLogEntry>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a SubChannelKey) -> BoxFuture<'a, Result<Option<PersistedState>, CapabilityError>> {
        let result = self.inner.lock().unwrap().state.get(key).cloned();
        Box::pin(async move { Ok(result) })
    }

    fn put<'a>(&'a self, key: &'a SubChannelKey, state: &'a PersistedState) -> BoxFuture<'a, Result<(), CapabilityError>> {
        self.inner
            .lock()
            .unwrap()
            .state
            .insert(key.clone(), state.clone());
        Box::pin(async move { Ok(()) })
    }

    fn delete<'a>(&'a self, key: &'a SubChannelKey) -> BoxFuture<'a, Result<(), CapabilityError>> {
        self.inner.lock().unwrap().state.remove(key);
        Box::pin(async move { Ok(()) })
    }
}

impl TransactionLog for InMemoryStore {
    fn append<'a>(
        &'a self,
        sub_channel: &'a SubChannelKey,
        entry: TxLogEntry,
    ) -> BoxFuture<'a, Result<(), CapabilityError>> {
        self.inner
            .lock()
            .unwrap()
            .log
            .entry(sub_channel.clone())
            .or_default()
            .push(entry);
        Box::pin(async move { Ok(()) })
    }

    fn entries_for<'a>(
        &'a self,
        sub_channel: &'a SubChannelKey,
    ) -> BoxFuture<'a, Result<Vec<TxLogEntry>, CapabilityError>> {
        let entries = self
            .inner
            .lock()
            .unwrap()
            .log
            .get(sub_channel)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(entries) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::subrav::{SubRav, PROTOCOL_VERSION};

    fn key() -> SubChannelKey {
        SubChannelKey {
            channel_id: ChannelId::from_bytes([3u8; 32]),
            channel_epoch: BigAmount::ZERO,
            vm_id_fragment: "k1".to_owned(),
        }
    }

    fn signed_rav(k: &SubChannelKey) -> SignedSubRav {
        SignedSubRav {
            sub_rav: SubRav {
                chain_id: BigAmount::new(1),
                channel_id: k.channel_id,
                channel_epoch: k.channel_epoch,
                vm_id_fragment: k.vm_id_fragment.clone(),
                accumulated_amount: BigAmount::new(5),
                nonce: BigAmount::new(1),
                version: PROTOCOL_VERSION,
            },
            signature: "sig".to_owned(),
        }
    }

    #[tokio::test]
    async fn kv_store_round_trips() {
        let store = InMemoryStore::new();
        let k = key();
        assert!(store.get(&k).await.unwrap().is_none());

        let state = PersistedState {
            channel_id: k.channel_id,
            pending_sub_rav: None,
            last_confirmed_sub_rav: None,
            last_updated_ms: 0,
        };
        store.put(&k, &state).await.unwrap();
        assert!(store.get(&k).await.unwrap().is_some());

        store.delete(&k).await.unwrap();
        assert!(store.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transaction_log_accumulates_per_sub_channel() {
        let store = InMemoryStore::new();
        let k = key();
        assert!(store.entries_for(&k).await.unwrap().is_empty());

        store
            .append(
                &k,
                TxLogEntry {
                    client_tx_ref: "tx-1".to_owned(),
                    service_tx_ref: None,
                    sub_rav: signed_rav(&k),
                    cost: BigAmount::new(5),
                    recorded_at_ms: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(store.entries_for(&k).await.unwrap().len(), 1);
    }
}
