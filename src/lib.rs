//! A benchmarking harness for Ethereum execution-layer clients.
//!
//! `benchmarkoor` drives one or more pre-built client images (geth,
//! Nethermind, Besu, Erigon, Nimbus, reth) through an Engine API test suite,
//! one instance at a time, recording per-step timing, gas throughput, and
//! cgroup resource accounting for every test.
//!
//! # Usage
//! `benchmarkoor` is primarily designed to be used as an executable. Refer
//! to the output of the `--help` flag for the available subcommands:
//! ```console
//! $ benchmarkoor --help
//! ```
//!
//! ## As a library
//! The [`InstanceSupervisor`] is the entry point for driving a single
//! instance through a run programmatically, given a [`ContainerRuntime`]
//! and a [`TestSource`]:
//! ```no_run
//! use std::sync::Arc;
//!
//! use benchmarkoor::runtime::docker::BollardRuntime;
//!
//! # fn main() -> anyhow::Result<()> {
//! let runtime = Arc::new(BollardRuntime::connect_docker()?);
//! # Ok(())
//! # }
//! ```
//!
//! [`ContainerRuntime`]: runtime::ContainerRuntime
//! [`TestSource`]: testsource::TestSource

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

pub mod cli;
pub mod cpugov;
pub mod datadir;
pub mod engine_api;
pub mod error;
pub mod executor;
pub mod hostinfo;
pub mod index;
pub mod labels;
pub mod logchannel;
pub mod model;
pub mod orphans;
pub mod rollback;
pub mod runtime;
pub mod sampler;
pub mod supervisor;
pub mod testsource;
pub mod upload;
pub mod writer;

pub use supervisor::InstanceSupervisor;
