//! Component-local error taxonomies.
//!
//! Each component that needs to pattern-match on *why* something failed (as
//! opposed to just bubbling the failure up with context, which is what
//! `anyhow` is for) defines its own [`thiserror::Error`] enum here. Callers
//! further up the stack that only care about success/failure wrap these into
//! `anyhow::Error` with `.context(...)`: `anyhow` everywhere, with a couple
//! of narrow `thiserror` enums where a caller actually branches on the
//! failure kind.

use thiserror::Error;

/// Errors from the [`crate::runtime`] container backends.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The requested container could not be found (already removed, never
    /// created, or the runtime lost track of it).
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// Checkpoint/restore was requested against a backend that does not
    /// support it (currently: anything other than Podman).
    #[error("checkpoint/restore is not supported by this container backend")]
    CheckpointUnsupported,

    /// The host has no usable CRIU installation.
    #[error("CRIU validation failed: {0}")]
    CriuUnavailable(String),

    /// A backend API call failed.
    #[error("container runtime error: {0}")]
    Backend(#[from] bollard::errors::Error),

    /// A subprocess invoked by the runtime (e.g. `podman checkpoint`) exited
    /// non-zero.
    #[error("subprocess `{command}` exited with status {status}: {stderr}")]
    SubprocessFailed {
        /// The command that was run, for diagnostics.
        command: String,
        /// The process exit status.
        status: i32,
        /// Captured stderr.
        stderr: String,
    },
}

/// Errors from the [`crate::datadir`] provisioners.
#[derive(Debug, Error)]
pub enum DatadirError {
    /// No ZFS (or equivalent CoW) dataset could be found enclosing the
    /// requested source path.
    #[error("no dataset found enclosing {0}")]
    NoEnclosingDataset(String),

    /// A provisioning subprocess (`mount`, `fuse-overlayfs`, `zfs`, ...)
    /// failed.
    #[error("subprocess `{command}` exited with status {status}: {stderr}")]
    SubprocessFailed {
        /// The command that was run.
        command: String,
        /// Its exit status.
        status: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// Plain filesystem I/O failure during provisioning or release.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the [`crate::rollback`] strategies.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// The client kind has no known debug RPC for head rewinding.
    #[error("client {0:?} does not support RPC-based rollback")]
    ClientUnsupported(crate::model::ClientKind),

    /// The debug RPC call itself failed.
    #[error("rollback RPC call failed: {0}")]
    RpcFailed(#[from] anyhow::Error),
}

/// Errors from the [`crate::engine_api`] JSON-RPC client.
#[derive(Debug, Error)]
pub enum EngineApiError {
    /// Transport-level failure (connection refused, timeout, TLS, ...).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The JWT could not be minted.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The server returned a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    RpcError {
        /// The JSON-RPC error code.
        code: i64,
        /// The JSON-RPC error message.
        message: String,
    },

    /// The response body could not be parsed as JSON-RPC.
    #[error("malformed JSON-RPC response: {0}")]
    Malformed(String),

    /// The call returned `{status: "SYNCING"}` and retries were exhausted.
    #[error("exhausted {0} retries while client reported SYNCING")]
    SyncingExhausted(u32),
}

/// Errors surfaced by the [`crate::testsource`] readers.
#[derive(Debug, Error)]
pub enum TestSourceError {
    /// A step file could not be parsed as a sequence of JSON-RPC calls.
    #[error("could not parse step file {path}: {reason}")]
    MalformedStepFile {
        /// Path to the offending file.
        path: String,
        /// Human-readable parse failure.
        reason: String,
    },

    /// The EEST fixture archive did not have the expected layout.
    #[error("malformed EEST fixture archive: {0}")]
    MalformedFixture(String),

    /// Underlying filesystem failure.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}
