//! Core data types shared across every component.
//!
//! [`Instance`] and [`Run`] describe what is being benchmarked,
//! [`Test`]/[`Step`] describe what is run, and
//! [`TestRecord`]/[`IndexEntry`]/[`SuiteStats`] describe what came out. All
//! of these are plain `serde`-derived structs in the style of this crate's
//! other metadata types: public fields, derived
//! `Debug`/`Clone`/`Serialize`/`Deserialize`, and a small amount of
//! hand-written convenience on top.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The execution-layer client kinds this harness knows how to drive.
///
/// Each variant carries its own rollback and readiness idiosyncrasies (see
/// [`crate::rollback::rpc_set_head`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// go-ethereum.
    Geth,
    /// Nethermind.
    Nethermind,
    /// Hyperledger Besu.
    Besu,
    /// Erigon.
    Erigon,
    /// Nimbus-eth1.
    Nimbus,
    /// Reth.
    Reth,
}

impl Display for ClientKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientKind::Geth => "geth",
            ClientKind::Nethermind => "nethermind",
            ClientKind::Besu => "besu",
            ClientKind::Erigon => "erigon",
            ClientKind::Nimbus => "nimbus",
            ClientKind::Reth => "reth",
        };
        write!(f, "{s}")
    }
}

/// Unique identifier for an [`Instance`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-device block I/O throttle, applied as a container resource limit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockIoThrottle {
    /// Path to the block device (e.g. `/dev/sda`).
    pub device: String,
    /// Read bytes-per-second limit.
    pub read_bps: Option<u64>,
    /// Write bytes-per-second limit.
    pub write_bps: Option<u64>,
}

/// Resource limits applied to an instance's main container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Pinned CPU set, e.g. `"0-3"`.
    pub cpuset: Option<String>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// When true, memory-swap is set equal to `memory_bytes` (no swap).
    #[serde(default)]
    pub swap_disabled: bool,
    /// Per-device block I/O throttles.
    #[serde(default)]
    pub block_io: Vec<BlockIoThrottle>,
}

/// How `InstanceSupervisor` should roll state back between tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackKind {
    /// No rollback is performed between tests.
    None,
    /// Per-client debug RPC rewind (§4.3 RPCSetHead).
    RpcSetHead,
    /// Stop, remove, and recreate the container between tests.
    ContainerRecreate {
        /// Extra grace period to wait after the recreated container
        /// reports ready, before the next test begins.
        ready_grace: Option<std::time::Duration>,
    },
    /// CRIU checkpoint once, restore before every test.
    CheckpointRestore,
}

/// A data directory provisioning strategy (§4.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatadirSpec {
    /// Recursive parallel copy of the source tree.
    Copy,
    /// Native kernel `overlay` filesystem.
    OverlayNative,
    /// `fuse-overlayfs`-backed overlay, for hosts without privileged mount.
    OverlayFuse,
    /// Copy-on-write snapshot/clone (e.g. ZFS).
    CowSnapshot,
}

/// A post-test RPC call, issued best-effort after the timed `test` step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostTestRpcCall {
    /// A label used for the dump filename
    /// (`{testName}/post_test_rpc_calls/{label}.json`).
    pub label: String,
    /// JSON-RPC method name.
    pub method: String,
    /// JSON-RPC params; may contain `{BlockHash}`, `{BlockNumber}`, or
    /// `{BlockNumberHex}` template placeholders applied recursively to
    /// string values.
    pub params: serde_json::Value,
    /// Per-call timeout; defaults to 30s when unset.
    pub timeout: Option<std::time::Duration>,
    /// Whether to persist the raw response to disk.
    #[serde(default)]
    pub dump_response: bool,
}

/// The immutable configuration of one client instance to benchmark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier for this instance.
    pub id: InstanceId,
    /// Which execution-layer client this instance runs.
    pub client_kind: ClientKind,
    /// Fully-qualified container image reference.
    pub image: String,
    /// Entrypoint override, if any.
    pub entrypoint: Option<Vec<String>>,
    /// Command/args override, if any.
    pub command: Option<Vec<String>>,
    /// Extra environment variables for the main container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Effective resource limits for this instance.
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Effective rollback strategy; defaults to [`RollbackKind::None`].
    #[serde(default = "default_rollback")]
    pub rollback: RollbackKind,
    /// Effective data directory strategy, if a source data directory is
    /// configured for this instance.
    pub datadir: Option<DatadirSpec>,
    /// Path to the read-only source data directory to provision from.
    pub datadir_source: Option<std::path::PathBuf>,
    /// Post-test RPC calls to issue after every timed test step.
    #[serde(default)]
    pub post_test_rpc_calls: Vec<PostTestRpcCall>,
    /// Whether to drop host page caches before the timed step.
    #[serde(default)]
    pub drop_caches: bool,
    /// Whether to issue repeated bootstrap FCU calls after RPC readiness.
    #[serde(default)]
    pub bootstrap_fcu: bool,
}

impl Instance {
    /// Rejects configurations the driver would otherwise fail on mid-run
    /// (§7 "Driver fatal: invalid configuration"): `datadir` and
    /// `datadir_source` must be set together or not at all.
    pub fn validate(&self) -> Result<(), String> {
        if self.datadir.is_some() != self.datadir_source.is_some() {
            return Err(format!(
                "instance {}: `datadir` and `datadir_source` must both be set or both be omitted",
                self.id
            ));
        }
        Ok(())
    }
}

fn default_rollback() -> RollbackKind {
    RollbackKind::None
}

/// Terminal status of a [`Run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still in progress; never persisted as a terminal value.
    Running,
    /// Every test ran to completion (or failed individually) without a
    /// fatal error.
    Completed,
    /// The container exited or was OOM-killed unexpectedly.
    ContainerDied,
    /// Cancelled via SIGINT/SIGTERM or an explicit cancellation token.
    Cancelled,
    /// A driver-fatal error aborted the run before completion.
    Failed,
}

/// Unique, host-wide identifier for a run: a monotonic timestamp plus a
/// random suffix so two runs started within the same millisecond never
/// collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RunId {
    /// Constructs a new run ID from a fixed timestamp and random suffix.
    ///
    /// Exposed (rather than only a `new()` that reads the clock) so that
    /// callers needing deterministic IDs in tests can supply both halves
    /// directly.
    #[must_use]
    pub fn from_parts(timestamp: &DateTime<Utc>, suffix: &str) -> Self {
        Self(format!("{}-{}", timestamp.format("%Y%m%dT%H%M%S%.3f"), suffix))
    }
}

/// Host system information snapshot taken at run start (§4.4 step 1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostInfo {
    /// The host's reported hostname.
    pub hostname: String,
    /// Kernel release string (e.g. `uname -r`).
    pub kernel: String,
    /// CPU architecture (e.g. `x86_64`).
    pub arch: String,
    /// CPU model name.
    pub cpu_model: String,
    /// Logical core count.
    pub cpu_cores: usize,
    /// Nominal CPU frequency in MHz.
    pub cpu_mhz: u64,
    /// Total physical memory in bytes.
    pub total_memory_bytes: u64,
}

/// Everything persisted into `config.json` for one run (§4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// This run's identifier.
    pub run_id: RunId,
    /// The instance this run benchmarks.
    pub instance: Instance,
    /// Resolved image digest, once pulled.
    pub image_digest: Option<String>,
    /// Host system info.
    pub host_info: HostInfo,
    /// Content hash of the test suite used.
    pub suite_hash: String,
    /// Number of tests discovered from the suite.
    pub test_count: usize,
    /// Start timestamp.
    pub timestamp: DateTime<Utc>,
    /// End timestamp; set exactly once, at run exit.
    pub timestamp_end: Option<DateTime<Utc>>,
    /// Terminal status; [`RunStatus::Running`] until the run exits.
    pub status: RunStatus,
    /// Container exit code, if the container exited on its own / was
    /// killed.
    pub exit_code: Option<i64>,
    /// Whether the container was OOM-killed.
    #[serde(default)]
    pub oom_killed: bool,
}

/// A single JSON-RPC call parsed from a step file or synthesised from an
/// EEST fixture block (§3 Step).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcCall {
    /// JSON-RPC method name, e.g. `engine_newPayloadV3`.
    pub method: String,
    /// JSON-RPC params array.
    pub params: serde_json::Value,
}

/// An ordered sequence of JSON-RPC calls making up one phase of a test.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Step {
    /// The calls to issue, in order.
    pub calls: Vec<RpcCall>,
}

/// One benchmark test: a `name`, the suite it belongs to, and its ordered
/// step files (§3 Test).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Test {
    /// Free-form, path-like test name.
    pub name: String,
    /// Content hash of the suite this test belongs to.
    pub suite_hash: String,
    /// Steps run once before any test in the suite (not timed).
    pub pre_run: Vec<Step>,
    /// Setup step, run before the timed step (not timed).
    pub setup: Step,
    /// The timed step.
    pub test: Step,
    /// Cleanup step, run after the timed step (not timed).
    pub cleanup: Step,
}

/// Per-call outcome classification (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The call succeeded (engine status `VALID`, or a non-engine method
    /// that returned without a JSON-RPC error).
    Success,
    /// The call failed (JSON-RPC error, transport error, or a non-`VALID`
    /// engine status after retries were exhausted).
    Fail,
}

/// The timed record of a single JSON-RPC call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRecord {
    /// JSON-RPC method name.
    pub method: String,
    /// Nanoseconds since the UNIX epoch when the call was sent.
    pub start_ns: u128,
    /// Nanoseconds since the UNIX epoch when the response (or failure) was
    /// observed.
    pub end_ns: u128,
    /// Outcome classification.
    pub status: CallStatus,
    /// Error message, if `status == Fail`.
    pub error: Option<String>,
    /// `gasUsed` extracted from the response, if any (only for
    /// `engine_newPayload*` calls).
    pub gas_used: Option<u64>,
}

/// Cumulative resource counters attributable to a timed window (§4.6).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ResourceTotals {
    /// Signed memory delta in bytes (can be negative).
    pub memory_delta_bytes: i64,
    /// CPU time consumed, in microseconds.
    pub cpu_usec: u64,
    /// Bytes read from block devices.
    pub disk_read_bytes: u64,
    /// Bytes written to block devices.
    pub disk_write_bytes: u64,
    /// Read I/O operations.
    pub disk_read_ops: u64,
    /// Write I/O operations.
    pub disk_write_ops: u64,
}

impl ResourceTotals {
    /// Adds another sample's totals into this one, saturating rather than
    /// overflowing.
    pub fn accumulate(&mut self, other: &ResourceTotals) {
        self.memory_delta_bytes = self.memory_delta_bytes.saturating_add(other.memory_delta_bytes);
        self.cpu_usec = self.cpu_usec.saturating_add(other.cpu_usec);
        self.disk_read_bytes = self.disk_read_bytes.saturating_add(other.disk_read_bytes);
        self.disk_write_bytes = self.disk_write_bytes.saturating_add(other.disk_write_bytes);
        self.disk_read_ops = self.disk_read_ops.saturating_add(other.disk_read_ops);
        self.disk_write_ops = self.disk_write_ops.saturating_add(other.disk_write_ops);
    }
}

/// The aggregate over all calls in one step (§3 TestRecord).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepAggregate {
    /// Sum of `end_ns - start_ns` over all calls in the step.
    #[serde(rename = "time_total")]
    pub time_total_ns: u128,
    /// Total calls issued (`success + fail`).
    pub msg_count: u64,
    /// Calls that failed.
    pub fail: u64,
    /// Sum of `gasUsed` over calls that reported it.
    pub gas_used_total: u64,
    /// Sum of call durations for calls that reported `gasUsed`.
    #[serde(rename = "gas_used_time_total")]
    pub gas_used_time_total_ns: u128,
    /// Resource totals attributed to this step.
    pub resource_totals: ResourceTotals,
}

/// One step's full record: its aggregate plus every individual call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepRecord {
    /// Aggregated counters.
    pub aggregated: StepAggregate,
    /// Every call made during this step, in order.
    pub calls: Vec<CallRecord>,
}

/// Status of a single test's execution within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// The test ran to completion (individual call failures do not change
    /// this; only a run-level cancellation/crash does).
    Completed,
    /// The run was cancelled or the container died mid-test.
    Cancelled,
}

/// The three steps' records for one test, nested under `steps` in
/// `result.json` (§4.7: `steps:{setup, test, cleanup}`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestSteps {
    /// Setup step record.
    pub setup: StepRecord,
    /// Timed test step record.
    pub test: StepRecord,
    /// Cleanup step record.
    pub cleanup: StepRecord,
}

/// One (Run, Test) record, as written into `result.json` (§3 TestRecord,
/// §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRecord {
    /// The test's directory name under the run directory.
    pub dir: String,
    /// This test's status.
    pub status: TestStatus,
    /// The test's setup/test/cleanup step records.
    pub steps: TestSteps,
}

/// The full `result.json` document for a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunResult {
    /// Every test's record, in execution order.
    pub tests: Vec<TestRecord>,
}

/// One row of the global `index.json` (§3 IndexEntry).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The run this entry summarises.
    pub run_id: RunId,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// The client kind benchmarked.
    pub client_kind: ClientKind,
    /// The container image used.
    pub image: String,
    /// Resolved image digest, if known.
    pub image_sha256: Option<String>,
    /// The suite hash this run executed.
    pub suite_hash: String,
    /// Total tests in the run.
    pub tests_total: u64,
    /// Tests whose status was `Completed` with zero failed calls.
    pub tests_passed: u64,
    /// Tests whose status was `Cancelled`.
    pub tests_cancelled: u64,
    /// Tests with at least one failed call.
    pub tests_failed: u64,
    /// Sum of `test` step durations across all tests, in nanoseconds.
    pub total_test_time_ns: u128,
    /// Sum of `gasUsedTotal` across all tests.
    pub total_gas_used: u64,
}

/// One run's contribution to a suite's aggregated stats (§3 SuiteStats).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteStatsEntry {
    /// The run this entry came from.
    pub run_id: RunId,
    /// The `test` step's total time, in nanoseconds.
    pub time_ns: u128,
    /// The `test` step's gas-attributed time, in nanoseconds.
    pub gas_used_time_ns: u128,
    /// The `test` step's total gas used.
    pub gas_used_total: u64,
}

/// Per-suite, per-test list of [`SuiteStatsEntry`], sorted descending by
/// `time_ns`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SuiteStats {
    /// Map of test name to its entries across all runs of this suite.
    pub tests: HashMap<String, Vec<SuiteStatsEntry>>,
}
