//! Instance supervisor (C7, §4.4): owns one (Run, Instance) end-to-end.
//!
//! Every suspension point is threaded with a [`CancellationToken`] so a
//! SIGINT/SIGTERM delivered in `main` unwinds through the exact same
//! `release` hooks a normal completion does — there is no separate crash
//! path (§4.4 "Expansion").

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    cpugov,
    datadir::{self, PreparedDatadir},
    engine_api::EngineApiClient,
    executor::TestExecutor,
    hostinfo,
    labels::{self, ContainerRole},
    logchannel,
    model::{
        ClientKind, HostInfo, Instance, RollbackKind, RunConfig, RunId, RunResult, RunStatus, StepRecord, Test,
        TestRecord, TestSteps, TestStatus,
    },
    rollback::{
        checkpoint_restore::CheckpointRestoreRollback, container_recreate::ContainerRecreateRollback,
        rpc_set_head::RpcSetHeadRollback, CapturedState, NoRollback, RollbackStrategy,
    },
    runtime::{ContainerRuntime, ContainerSpec, ImagePullPolicy},
    sampler::ResourceSampler,
    testsource::TestSource,
    upload::{upload_all, Uploader, DEFAULT_PARALLEL_UPLOADS},
    writer::ResultWriter,
};

const NETWORK_NAME: &str = "benchmarkoor";
const ENGINE_PORT: u16 = 8551;
const RPC_PORT: u16 = 8545;
const READINESS_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_SYNCING_RETRIES: u32 = 10;
const BOOTSTRAP_FCU_ATTEMPTS: u32 = 10;

/// Owns one run of one instance: provisioning, the test loop, and teardown.
pub struct InstanceSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    instance: Instance,
    results_dir: PathBuf,
    tmp_dir: PathBuf,
    test_source: Arc<dyn TestSource>,
    uploader: Option<Arc<dyn Uploader>>,
    result_owner: Option<(u32, u32)>,
    cancel: CancellationToken,
}

impl InstanceSupervisor {
    /// Builds a supervisor for `instance`, rooted at `results_dir`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        instance: Instance,
        results_dir: PathBuf,
        tmp_dir: PathBuf,
        test_source: Arc<dyn TestSource>,
        uploader: Option<Arc<dyn Uploader>>,
        result_owner: Option<(u32, u32)>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            instance,
            results_dir,
            tmp_dir,
            test_source,
            uploader,
            result_owner,
            cancel,
        }
    }

    /// Runs the instance to completion, returning its terminal status.
    pub async fn run(&self) -> anyhow::Result<RunStatus> {
        let run_id = RunId::from_parts(&Utc::now(), &uuid::Uuid::new_v4().to_string()[..8]);
        let run_dir = self.results_dir.join("runs").join(run_id.to_string());
        let writer = ResultWriter::new(run_dir.clone(), self.result_owner);
        writer.prepare_run_dir().await?;

        log::info!("starting run {run_id} for instance {}", self.instance.id);

        let tests = self.test_source.discover().await?;
        let host_info = hostinfo::snapshot();
        let suite_hash = tests.first().map(|t| t.suite_hash.clone()).unwrap_or_default();

        let mut config = initial_config(run_id.clone(), self.instance.clone(), host_info, suite_hash, tests.len());
        writer.write_config(&config).await?;

        let governor_state = cpugov::apply(&run_id.to_string(), self.instance.resource_limits.cpuset.as_deref())
            .await
            .context_warn("applying CPU governor settings");

        let outcome = self.drive(&run_id, &mut config, &writer, &tests).await;

        if let Some(state) = governor_state {
            cpugov::restore(&run_id.to_string(), &state)
                .await
                .unwrap_or_else(|err| log::warn!("failed to restore CPU governor state: {err:#}"));
        }

        let (status, result) = match outcome {
            Ok((status, result)) => (status, result),
            Err(err) => {
                log::error!("run {run_id} failed: {err:#}");
                (RunStatus::Failed, RunResult::default())
            }
        };

        config.status = status;
        config.timestamp_end = Some(Utc::now());
        writer.write_config(&config).await?;
        writer.write_result(&result).await?;

        if let Some(uploader) = &self.uploader {
            self.upload_run(uploader.clone(), &run_id, &config, &result).await;
        }

        log::info!("run {run_id} finished with status {status:?}");
        Ok(status)
    }

    async fn drive(
        &self,
        run_id: &RunId,
        config: &mut RunConfig,
        writer: &ResultWriter,
        tests: &[Test],
    ) -> anyhow::Result<(RunStatus, RunResult)> {
        self.runtime.ensure_network(NETWORK_NAME).await?;
        self.runtime
            .pull_image(&self.instance.image, ImagePullPolicy::IfMissing)
            .await?;
        config.image_digest = self.runtime.get_image_digest(&self.instance.image).await?;

        let datadir = self.prepare_datadir(&self.instance.id.to_string()).await?;
        let mount_path = datadir
            .as_ref()
            .map(|d| d.mount_path.clone())
            .unwrap_or_else(|| self.tmp_dir.join(format!("volume-{}", self.instance.id)));
        tokio::fs::create_dir_all(&mount_path).await?;

        let jwt_secret = random_jwt_secret();
        tokio::fs::write(mount_path.join("jwt.hex"), hex::encode(&jwt_secret)).await?;

        let container_name = format!("benchmarkoor-{run_id}");
        let spec = self.build_container_spec(&container_name, run_id, &mount_path);
        self.runtime.create_container(&spec).await?;
        self.runtime.start(&container_name).await?;

        let mut tasks = JoinSet::new();
        let died = Arc::new(Mutex::new(None));
        self.spawn_exit_watcher(&mut tasks, &container_name, died.clone());
        self.spawn_log_stream(&mut tasks, &container_name, writer, "startup");

        let ip = self.runtime.get_container_ip(&container_name, NETWORK_NAME).await?;
        let engine_endpoint = format!("http://{ip}:{ENGINE_PORT}");
        let rpc_endpoint = format!("http://{ip}:{RPC_PORT}");
        let client = EngineApiClient::new(engine_endpoint, jwt_secret, MAX_SYNCING_RETRIES);
        let rpc_client = EngineApiClient::new(rpc_endpoint, Vec::new(), MAX_SYNCING_RETRIES);

        let run_outcome = self
            .wait_ready_and_run_tests(run_id, &container_name, &client, &rpc_client, tests, writer, &died)
            .await;

        self.runtime.stop(&container_name, Duration::from_secs(30)).await.ok();
        self.runtime.remove(&container_name).await.ok();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        if let Some(datadir) = datadir {
            datadir.release().unwrap_or_else(|err| {
                log::warn!("failed to release data directory: {err:#}");
            });
        }

        if let Some(exit) = died.lock().await.take() {
            config.exit_code = Some(exit.0);
            config.oom_killed = exit.1;
        }

        run_outcome
    }

    async fn wait_ready_and_run_tests(
        &self,
        run_id: &RunId,
        container_name: &str,
        client: &EngineApiClient,
        rpc_client: &EngineApiClient,
        tests: &[Test],
        writer: &ResultWriter,
        died: &Arc<Mutex<Option<(i64, bool)>>>,
    ) -> anyhow::Result<(RunStatus, RunResult)> {
        self.wait_for_rpc_ready(rpc_client).await?;

        if self.instance.bootstrap_fcu {
            self.bootstrap_fcu(client).await?;
        }

        let rollback = self.build_rollback_strategy(container_name).await?;
        let sampler = ResourceSampler::new(self.runtime.clone(), container_name);
        let executor = TestExecutor::new(client);

        let mut result = RunResult::default();

        for test in tests {
            if self.cancel.is_cancelled() || died.lock().await.is_some() {
                result.tests.push(TestRecord {
                    dir: test.name.clone(),
                    status: TestStatus::Cancelled,
                    steps: TestSteps::default(),
                });
                continue;
            }

            for step in &test.pre_run {
                executor.run_step(step).await;
            }

            let captured = rollback.capture(client).await.unwrap_or(CapturedState::None);

            if self.instance.drop_caches {
                drop_host_caches().await;
            }

            let setup_record = executor.run_step(&test.setup).await;

            let captured_record: Arc<Mutex<Option<StepRecord>>> = Arc::new(Mutex::new(None));
            let resource_totals = {
                let record_slot = captured_record.clone();
                sampler
                    .delta_over(container_name, || async move {
                        let record = executor.run_step(&test.test).await;
                        *record_slot.lock().await = Some(record);
                        Ok(())
                    })
                    .await
                    .unwrap_or_default()
            };
            let mut test_record = captured_record.lock().await.take().unwrap_or_default();
            test_record.aggregated.resource_totals = resource_totals;

            let cleanup_record = executor.run_step(&test.cleanup).await;

            self.run_post_test_rpc_calls(&executor, test, writer).await;

            rollback
                .restore(client, &captured)
                .await
                .unwrap_or_else(|err| log::warn!("rollback restore failed for {}: {err:#}", test.name));

            result.tests.push(TestRecord {
                dir: test.name.clone(),
                status: TestStatus::Completed,
                steps: TestSteps {
                    setup: setup_record,
                    test: test_record,
                    cleanup: cleanup_record,
                },
            });
            let _ = run_id;
        }

        let status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if died.lock().await.is_some() {
            RunStatus::ContainerDied
        } else {
            RunStatus::Completed
        };
        Ok((status, result))
    }

    async fn run_post_test_rpc_calls(&self, executor: &TestExecutor<'_>, test: &Test, writer: &ResultWriter) {
        for call in &self.instance.post_test_rpc_calls {
            if let Some(response) = executor
                .run_best_effort(&call.method, &call.params, call.timeout)
                .await
            {
                if call.dump_response {
                    writer
                        .write_post_test_rpc_dump(&test.name, &call.label, &response)
                        .await
                        .unwrap_or_else(|err| log::warn!("failed to dump {}: {err:#}", call.label));
                }
            }
        }
    }

    async fn prepare_datadir(&self, instance_id: &str) -> anyhow::Result<Option<PreparedDatadir>> {
        match (&self.instance.datadir, &self.instance.datadir_source) {
            (Some(spec), Some(source)) => {
                Ok(Some(datadir::prepare(spec, source, instance_id, &self.tmp_dir).await?))
            }
            _ => Ok(None),
        }
    }

    async fn build_rollback_strategy(&self, container_name: &str) -> anyhow::Result<Box<dyn RollbackStrategy>> {
        match &self.instance.rollback {
            RollbackKind::None => Ok(Box::new(NoRollback)),
            RollbackKind::RpcSetHead => match RpcSetHeadRollback::new(self.instance.client_kind) {
                Ok(strategy) => Ok(Box::new(strategy)),
                Err(err) => {
                    log::warn!(
                        "rollback unsupported for instance {}: {err:#}; proceeding without rollback",
                        self.instance.id
                    );
                    Ok(Box::new(NoRollback))
                }
            },
            RollbackKind::ContainerRecreate { ready_grace } => {
                let runtime = self.runtime.clone();
                let spec = self.build_container_spec(container_name, &RunId("recreate".to_string()), &self.tmp_dir);
                Ok(Box::new(ContainerRecreateRollback::new(
                    runtime,
                    container_name.to_string(),
                    Box::new(move || spec.clone()),
                    *ready_grace,
                )))
            }
            RollbackKind::CheckpointRestore => {
                let export_path = self.tmp_dir.join(format!("{container_name}.checkpoint"));
                let datadir_path = self.tmp_dir.join(format!("{container_name}-datadir"));
                let backup_path = self.tmp_dir.join(format!("{container_name}-datadir-backup"));
                let strategy = CheckpointRestoreRollback::establish(
                    self.runtime.clone(),
                    container_name,
                    export_path,
                    datadir_path,
                    backup_path,
                    Duration::from_millis(500),
                )
                .await?;
                Ok(Box::new(strategy))
            }
        }
    }

    fn build_container_spec(&self, name: &str, run_id: &RunId, mount_path: &std::path::Path) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: self.instance.image.clone(),
            entrypoint: self.instance.entrypoint.clone(),
            cmd: self.instance.command.clone(),
            env: self.instance.env.clone(),
            binds: vec![(mount_path.display().to_string(), "/data".to_string(), false)],
            volume: None,
            network: Some(NETWORK_NAME.to_string()),
            resources: self.instance.resource_limits.clone(),
            labels: labels::container_labels(run_id, &self.instance.id, self.instance.client_kind, ContainerRole::Main),
        }
    }

    fn spawn_exit_watcher(
        &self,
        tasks: &mut JoinSet<()>,
        container_name: &str,
        died: Arc<Mutex<Option<(i64, bool)>>>,
    ) {
        let runtime = self.runtime.clone();
        let container_name = container_name.to_string();
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            match runtime.wait_for_exit(&container_name).await {
                Ok(status) if status.exit_code != 0 || status.oom_killed => {
                    log::warn!("container {container_name} exited unexpectedly: {status:?}");
                    *died.lock().await = Some((status.exit_code, status.oom_killed));
                    cancel.cancel();
                }
                Ok(_) => {}
                Err(err) => log::debug!("wait_for_exit({container_name}) ended: {err:#}"),
            }
        });
    }

    fn spawn_log_stream(&self, tasks: &mut JoinSet<()>, container_name: &str, writer: &ResultWriter, test_name: &str) {
        let (mut stdout_tx, mut rx) = logchannel::channel(logchannel::DEFAULT_CAPACITY_BYTES);
        let stderr_tx = stdout_tx.clone();

        let runtime = self.runtime.clone();
        let container_name_owned = container_name.to_string();
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            let mut stderr_tx = stderr_tx;
            if let Err(err) = runtime
                .stream_logs(&container_name_owned, &mut stdout_tx, &mut stderr_tx, cancel)
                .await
            {
                log::debug!("log stream for {container_name_owned} ended: {err:#}");
            }
        });

        // Drains the ring-buffer channel into `client.log`, rather than
        // writing directly from the streaming task (§5 "many-producer-
        // one-consumer channels with bounded backpressure").
        let log_path = writer.client_log_path(test_name);
        tasks.spawn(async move {
            if let Some(parent) = log_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let Ok(mut file) = tokio::fs::OpenOptions::new().create(true).append(true).open(&log_path).await else {
                return;
            };
            loop {
                let chunk = rx.recv().await;
                if tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await.is_err() {
                    return;
                }
            }
        });
    }

    async fn wait_for_rpc_ready(&self, rpc_client: &EngineApiClient) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
        loop {
            match rpc_client.call("eth_blockNumber", &serde_json::json!([])).await {
                Ok(_) => return Ok(()),
                Err(err) if tokio::time::Instant::now() < deadline => {
                    log::debug!("waiting for RPC readiness: {err:#}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(err) => anyhow::bail!("instance never became RPC-ready: {err:#}"),
            }
        }
    }

    async fn bootstrap_fcu(&self, client: &EngineApiClient) -> anyhow::Result<()> {
        let params = serde_json::json!([
            {"headBlockHash": "0x0", "safeBlockHash": "0x0", "finalizedBlockHash": "0x0"},
            null,
        ]);
        for attempt in 1..=BOOTSTRAP_FCU_ATTEMPTS {
            match client.call("engine_forkchoiceUpdatedV3", &params).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    log::debug!("bootstrap FCU attempt {attempt} failed: {err:#}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        anyhow::bail!("bootstrap forkchoiceUpdated never succeeded after {BOOTSTRAP_FCU_ATTEMPTS} attempts")
    }

    async fn upload_run(&self, uploader: Arc<dyn Uploader>, run_id: &RunId, config: &RunConfig, result: &RunResult) {
        let prefix = format!("runs/{run_id}");
        let objects = vec![
            (
                format!("{prefix}/config.json"),
                serde_json::to_vec_pretty(config).unwrap_or_default(),
                "application/json".to_string(),
            ),
            (
                format!("{prefix}/result.json"),
                serde_json::to_vec_pretty(result).unwrap_or_default(),
                "application/json".to_string(),
            ),
        ];
        upload_all(uploader, objects, DEFAULT_PARALLEL_UPLOADS).await;
    }
}

fn initial_config(
    run_id: RunId,
    instance: Instance,
    host_info: HostInfo,
    suite_hash: String,
    test_count: usize,
) -> RunConfig {
    RunConfig {
        run_id,
        instance,
        image_digest: None,
        host_info,
        suite_hash,
        test_count,
        timestamp: Utc::now(),
        timestamp_end: None,
        status: RunStatus::Running,
        exit_code: None,
        oom_killed: false,
    }
}

async fn drop_host_caches() {
    if let Err(err) = tokio::fs::write("/proc/sys/vm/drop_caches", "3").await {
        log::warn!("failed to drop host page caches: {err}");
    }
}

fn random_jwt_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

trait WarnOnErr<T> {
    fn context_warn(self, what: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> WarnOnErr<T> for Result<T, E> {
    fn context_warn(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("{what} failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    fn sample_instance() -> Instance {
        Instance {
            id: "geth-test".into(),
            client_kind: ClientKind::Geth,
            image: "geth:stable".to_string(),
            entrypoint: None,
            command: None,
            env: HashMap::new(),
            resource_limits: Default::default(),
            rollback: RollbackKind::None,
            datadir: None,
            datadir_source: None,
            post_test_rpc_calls: Vec::new(),
            drop_caches: false,
            bootstrap_fcu: false,
        }
    }

    fn supervisor(runtime: Arc<dyn ContainerRuntime>, instance: Instance, dir: &std::path::Path) -> InstanceSupervisor {
        InstanceSupervisor::new(
            runtime,
            instance,
            dir.to_path_buf(),
            dir.join("tmp"),
            Arc::new(crate::testsource::local::LocalTestSource::new(dir.join("suite"))),
            None,
            None,
            CancellationToken::new(),
        )
    }

    #[test]
    fn build_container_spec_carries_managed_by_label() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let sup = supervisor(runtime, sample_instance(), dir.path());
        let run_id = RunId("20260101T000000.000-abc".to_string());
        let spec = sup.build_container_spec("c1", &run_id, dir.path());

        assert_eq!(spec.name, "c1");
        assert_eq!(spec.network.as_deref(), Some(NETWORK_NAME));
        assert_eq!(
            spec.labels.get(crate::labels::MANAGED_BY).map(String::as_str),
            Some(crate::labels::MANAGED_BY_VALUE)
        );
    }

    #[tokio::test]
    async fn build_rollback_strategy_none_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let sup = supervisor(runtime, sample_instance(), dir.path());
        assert!(sup.build_rollback_strategy("c1").await.is_ok());
    }

    #[tokio::test]
    async fn build_rollback_strategy_falls_back_to_no_rollback_for_unsupported_client() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let mut instance = sample_instance();
        instance.client_kind = ClientKind::Erigon;
        instance.rollback = RollbackKind::RpcSetHead;
        let sup = supervisor(runtime, instance, dir.path());
        assert!(sup.build_rollback_strategy("c1").await.is_ok());
    }
}
