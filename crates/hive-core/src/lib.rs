//! Hive core library
//!
//! Orchestration engine for testing blockchain clients in containers:
//! image build caching, container lifecycle with timeout enforcement, and
//! aggregation of per-client, per-test results into one report.

pub mod cache;
pub mod client;
pub mod config;
pub mod dag;
pub mod error;
pub mod image;
pub mod obs;
pub mod orchestrator;
pub mod overrides;
pub mod pattern;
pub mod report;
pub mod runner;
pub mod runtime;
pub mod selector;
pub mod telemetry;
pub mod watchdog;

pub use cache::CachePolicy;
pub use client::{ClientResolver, ClientSpec};
pub use config::{HiveConfig, RunPlan};
pub use dag::DagGenerator;
pub use error::{BuildError, BuildTarget, HiveError, HiveResult};
pub use image::{BuildContext, ImageStore};
pub use orchestrator::Hive;
pub use overrides::{parse_overrides, OverrideRule};
pub use report::{ClientEntry, Report, ResultAggregator};
pub use runner::{ExecutionResult, ExecutionRunner, ExecutionState, Outcome, RunnerConfig};
pub use runtime::{
    ContainerHandle, ContainerLease, ContainerRuntime, DockerCli, ImageRef, RunSpec,
    RuntimeError, RuntimeResult,
};
pub use selector::{Category, TestCase, TestFilter, TestSelector};
pub use telemetry::init_tracing;
pub use watchdog::{WatchGuard, Watchdog};
