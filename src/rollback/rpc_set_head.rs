//! Per-client debug-RPC rollback (§4.3 RPCSetHead).
//!
//! Records the `latest` block before a test, issues the client-specific
//! rewind RPC after it, then re-reads `latest` to verify — a mismatch is
//! logged as a warning, never a hard failure (§8 "Rollback correctness").

use async_trait::async_trait;
use serde_json::Value;

use crate::{engine_api::EngineApiClient, error::RollbackError, model::ClientKind};

use super::{CapturedState, RollbackStrategy};

/// Rolls the client back to its pre-test head via a client-specific debug
/// RPC.
pub struct RpcSetHeadRollback {
    client_kind: ClientKind,
}

impl RpcSetHeadRollback {
    /// Builds a rollback strategy for `client_kind`.
    ///
    /// # Errors
    /// Returns [`RollbackError::ClientUnsupported`] immediately if
    /// `client_kind` has no known rewind RPC (erigon, nimbus), matching
    /// §4.3's "unsupported — log warning, skip".
    pub fn new(client_kind: ClientKind) -> Result<Self, RollbackError> {
        if !super::supports_rpc_set_head(client_kind) {
            return Err(RollbackError::ClientUnsupported(client_kind));
        }
        Ok(Self { client_kind })
    }
}

async fn latest_block(client: &EngineApiClient) -> Result<(String, String), RollbackError> {
    let outcome = client
        .call("eth_getBlockByNumber", &serde_json::json!(["latest", false]))
        .await
        .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err)))?;
    let number = outcome
        .result
        .get("number")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let hash = outcome
        .result
        .get("hash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((number, hash))
}

#[async_trait]
impl RollbackStrategy for RpcSetHeadRollback {
    async fn capture(&self, client: &EngineApiClient) -> Result<CapturedState, RollbackError> {
        let (number, hash) = latest_block(client).await?;
        Ok(CapturedState::LatestBlock { number, hash })
    }

    async fn restore(&self, client: &EngineApiClient, captured: &CapturedState) -> Result<(), RollbackError> {
        let CapturedState::LatestBlock { number, hash } = captured else {
            return Ok(());
        };

        let (method, params) = match self.client_kind {
            ClientKind::Geth | ClientKind::Besu => ("debug_setHead", serde_json::json!([number])),
            ClientKind::Reth => {
                let as_int = i64::from_str_radix(number.trim_start_matches("0x"), 16).unwrap_or(0);
                ("debug_setHead", serde_json::json!([as_int]))
            }
            ClientKind::Nethermind => ("debug_resetHead", serde_json::json!([hash])),
            ClientKind::Erigon | ClientKind::Nimbus => {
                return Err(RollbackError::ClientUnsupported(self.client_kind));
            }
        };

        client
            .call(method, &params)
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err)))?;

        let (_, actual_hash) = latest_block(client).await?;
        if &actual_hash != hash {
            log::warn!(
                "rollback verification mismatch for {:?}: expected head {hash}, observed {actual_hash}",
                self.client_kind
            );
        }
        Ok(())
    }
}
