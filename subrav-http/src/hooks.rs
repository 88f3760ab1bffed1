//! Lifecycle hooks around payment settlement.
//!
//! Patterned directly on the teacher's `ClientHooks`/`SchemeHandlerHooks`:
//! an embedding application can observe or react to settlement without
//! forking the engine. All methods have default no-op implementations;
//! override only what you need. This is not part of spec.md's core (§4) —
//! it is the ambient observability seam the teacher always builds around
//! its payment pipeline (see SPEC_FULL.md §2).

use std::future::Future;
use std::pin::Pin;

use subrav::EngineError;

use crate::tracker::PaymentInfo;

/// Context passed to hooks around a single request's payment lifecycle.
#[derive(Debug, Clone)]
pub struct SettlementContext {
    /// The correlation id of the request being settled.
    pub client_tx_ref: String,
}

/// Lifecycle hooks around payment admission and settlement.
///
/// Dyn-compatible so an engine can hold `Arc<dyn EngineHooks>` and swap
/// implementations freely.
pub trait EngineHooks: Send + Sync {
    /// Called right before a request is admitted to the scheduler, before
    /// any Sub-RAV is signed. Observational only; cannot abort admission
    /// (use a [`crate::scheduler::RequestScheduler`] cancellation for that).
    fn before_admit<'a>(&'a self, _ctx: &'a SettlementContext) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    /// Called after a request's payment promise settles successfully.
    fn after_settle<'a>(
        &'a self,
        _ctx: &'a SettlementContext,
        _info: Option<&'a PaymentInfo>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    /// Called when a request's payment promise settles with an error.
    fn on_settle_failure<'a>(
        &'a self,
        _ctx: &'a SettlementContext,
        _err: &'a EngineError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// The no-op [`EngineHooks`] implementation, used when a caller registers
/// none of their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_hooks_are_inert() {
        let hooks = NoopHooks;
        let ctx = SettlementContext {
            client_tx_ref: "tx-1".to_owned(),
        };
        hooks.before_admit(&ctx).await;
        hooks.after_settle(&ctx, None).await;
        hooks.on_settle_failure(&ctx, &EngineError::Timeout).await;
    }
}
