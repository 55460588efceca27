//! Stop/remove/recreate rollback (§4.3 ContainerRecreate).
//!
//! After each test the container is thrown away and a fresh one started
//! against the same (already-provisioned) data directory, then probed for
//! RPC readiness before the run continues — the bluntest rollback, but the
//! only one that works for clients with no rewind RPC and no CRIU support.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    engine_api::EngineApiClient,
    error::RollbackError,
    runtime::{ContainerRuntime, ContainerSpec},
};

use super::{CapturedState, RollbackStrategy};

const READINESS_TIMEOUT: Duration = Duration::from_secs(60);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Recreates the main container between tests.
pub struct ContainerRecreateRollback {
    runtime: Arc<dyn ContainerRuntime>,
    container_name: String,
    spec_factory: Box<dyn Fn() -> ContainerSpec + Send + Sync>,
    ready_grace: Option<Duration>,
}

impl ContainerRecreateRollback {
    /// Builds a rollback strategy that recreates `container_name` using
    /// `spec_factory` each time, waiting `ready_grace` after readiness
    /// before the next test proceeds.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container_name: String,
        spec_factory: Box<dyn Fn() -> ContainerSpec + Send + Sync>,
        ready_grace: Option<Duration>,
    ) -> Self {
        Self {
            runtime,
            container_name,
            spec_factory,
            ready_grace,
        }
    }

    async fn wait_ready(&self, client: &EngineApiClient) -> Result<(), RollbackError> {
        let deadline = Instant::now() + READINESS_TIMEOUT;
        loop {
            match client.call("eth_blockNumber", &serde_json::json!([])).await {
                Ok(_) => return Ok(()),
                Err(err) if Instant::now() < deadline => {
                    log::debug!("recreated container not ready yet: {err:#}");
                    tokio::time::sleep(READINESS_POLL_INTERVAL).await;
                }
                Err(err) => {
                    return Err(RollbackError::RpcFailed(anyhow::Error::new(err).context(
                        "recreated container never became ready",
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl RollbackStrategy for ContainerRecreateRollback {
    async fn capture(&self, _client: &EngineApiClient) -> Result<CapturedState, RollbackError> {
        Ok(CapturedState::None)
    }

    async fn restore(&self, client: &EngineApiClient, _captured: &CapturedState) -> Result<(), RollbackError> {
        self.runtime
            .stop(&self.container_name, Duration::from_secs(10))
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err).context("stopping container")))?;
        self.runtime
            .remove(&self.container_name)
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err).context("removing container")))?;

        let spec = (self.spec_factory)();
        self.runtime
            .create_container(&spec)
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err).context("recreating container")))?;
        self.runtime
            .start(&self.container_name)
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err).context("starting recreated container")))?;

        self.wait_ready(client).await?;

        if let Some(grace) = self.ready_grace {
            tokio::time::sleep(grace).await;
        }
        Ok(())
    }
}
