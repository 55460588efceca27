//! Pre-test state rollback (C6, §4.3).
//!
//! [`RollbackKind`] picks the strategy; [`RollbackStrategy`] is the runtime
//! object the supervisor drives. Strategies capture whatever pre-test state
//! they need in [`RollbackStrategy::capture`] (called before the timed test
//! step) and restore it in [`RollbackStrategy::restore`] (called after).

pub mod checkpoint_restore;
pub mod container_recreate;
pub mod rpc_set_head;

use async_trait::async_trait;

use crate::{engine_api::EngineApiClient, error::RollbackError, model::ClientKind};

/// Opaque state captured before a test, to be restored after it.
pub enum CapturedState {
    /// No state captured (the `None` strategy).
    None,
    /// The `{number, hash}` of the `latest` block before the test, used by
    /// [`rpc_set_head`] to both roll back and verify.
    LatestBlock {
        /// Block number, as returned by `eth_getBlockByNumber`.
        number: String,
        /// Block hash, as returned by `eth_getBlockByNumber`.
        hash: String,
    },
}

/// A pre-test/post-test state rollback strategy.
#[async_trait]
pub trait RollbackStrategy: Send + Sync {
    /// Captures whatever state is needed to roll back, before the timed
    /// test step runs.
    async fn capture(&self, client: &EngineApiClient) -> Result<CapturedState, RollbackError>;

    /// Restores state after the timed test step, given what [`capture`]
    /// returned.
    ///
    /// [`capture`]: RollbackStrategy::capture
    async fn restore(&self, client: &EngineApiClient, captured: &CapturedState) -> Result<(), RollbackError>;
}

/// A strategy that does nothing, for [`crate::model::RollbackKind::None`].
pub struct NoRollback;

#[async_trait]
impl RollbackStrategy for NoRollback {
    async fn capture(&self, _client: &EngineApiClient) -> Result<CapturedState, RollbackError> {
        Ok(CapturedState::None)
    }

    async fn restore(&self, _client: &EngineApiClient, _captured: &CapturedState) -> Result<(), RollbackError> {
        Ok(())
    }
}

/// Returns whether `client` has a known debug RPC for [`rpc_set_head`]
/// rollback (§4.3: "erigon / nimbus: unsupported").
#[must_use]
pub fn supports_rpc_set_head(client: ClientKind) -> bool {
    !matches!(client, ClientKind::Erigon | ClientKind::Nimbus)
}
