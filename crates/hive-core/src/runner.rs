//! Execution of one (client, test) pair.
//!
//! Each invocation walks `Pending → Building → Running` and ends in exactly
//! one terminal [`Outcome`]. The container is stopped and removed before any
//! terminal state is returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::client::ClientSpec;
use crate::error::HiveResult;
use crate::image::ImageStore;
use crate::obs;
use crate::runtime::{self, ContainerLease, ImageRef, Mount, RunSpec, RuntimeError};
use crate::selector::{Category, TestCase};
use crate::watchdog::Watchdog;

/// Where the DAG directory appears inside simulation containers.
pub const DAG_MOUNT_POINT: &str = "/root/.ethash";

/// Lifecycle of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Building,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    BuildFailed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionState::Pending | ExecutionState::Building | ExecutionState::Running
        )
    }
}

/// Terminal state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    BuildFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::BuildFailed => "build_failed",
        }
    }
}

impl From<Outcome> for ExecutionState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => ExecutionState::Succeeded,
            Outcome::Failed => ExecutionState::Failed,
            Outcome::TimedOut => ExecutionState::TimedOut,
            Outcome::BuildFailed => ExecutionState::BuildFailed,
        }
    }
}

/// Result of one execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    #[serde(skip)]
    pub category: Category,
    pub pass: bool,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Log tail of the test container, or the build output on build failure.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Container wall-clock time, reported for benchmarks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ExecutionResult {
    fn new(category: Category, outcome: Outcome, start: DateTime<Utc>) -> Self {
        Self {
            category,
            pass: outcome == Outcome::Succeeded,
            outcome,
            error: None,
            exit_code: None,
            details: String::new(),
            start,
            end: Utc::now(),
            duration_ms: None,
        }
    }
}

/// Tunables for the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Lines of container output kept in a result.
    pub log_tail_lines: usize,
    /// Service-under-test endpoint injected into test containers.
    pub service_host: Option<String>,
    pub service_port: Option<u16>,
    /// Host directory holding the precomputed DAG, mounted into simulations.
    pub dag_dir: Option<PathBuf>,
    /// Upper bound on a single `wait`, a backstop should a watchdog kill
    /// never land.
    pub wait_limit: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: 100,
            service_host: None,
            service_port: None,
            dag_dir: None,
            wait_limit: None,
        }
    }
}

/// Builds a test image and runs it against one client.
pub struct ExecutionRunner {
    images: Arc<ImageStore>,
    watchdog: Arc<Watchdog>,
    config: RunnerConfig,
}

impl ExecutionRunner {
    pub fn new(images: Arc<ImageStore>, watchdog: Arc<Watchdog>, config: RunnerConfig) -> Self {
        Self {
            images,
            watchdog,
            config,
        }
    }

    /// Environment and mounts for a test container.
    pub fn run_spec(&self, client: &ClientSpec, test: &TestCase) -> RunSpec {
        let client_image = client
            .image
            .clone()
            .unwrap_or_else(|| ImageRef(client.image_tag()));
        let mut spec = RunSpec::default()
            .env("HIVE_CLIENT", client.name.as_str())
            .env("HIVE_CLIENT_IMAGE", client_image.as_str())
            .env("HIVE_TEST", test.name.as_str());
        if let Some(host) = &self.config.service_host {
            spec = spec.env("HIVE_SERVICE_HOST", host.as_str());
        }
        if let Some(port) = self.config.service_port {
            spec = spec.env("HIVE_SERVICE_PORT", port.to_string());
        }
        if test.category == Category::Simulation {
            if let Some(dir) = &self.config.dag_dir {
                spec = spec.mount(Mount {
                    host: dir.clone(),
                    container: DAG_MOUNT_POINT.to_string(),
                    read_only: true,
                });
            }
        }
        spec
    }

    /// Run `test` against `client`.
    ///
    /// Test failures, timeouts and test image build failures come back as
    /// `Ok` results; only runtime failures are errors.
    #[instrument(skip_all, fields(category = %test.category, client = %client.name, test = %test.name))]
    pub async fn execute(
        &self,
        client: &ClientSpec,
        test: &TestCase,
    ) -> HiveResult<ExecutionResult> {
        let start = Utc::now();
        let mut state = ExecutionState::Pending;

        transition(&mut state, ExecutionState::Building);
        let image = match self.images.ensure(&test.image_tag(), &test.context).await {
            Ok(image) => image,
            Err(RuntimeError::BuildFailed { output, .. }) => {
                let mut result = ExecutionResult::new(test.category, Outcome::BuildFailed, start);
                result.error = Some("test image build failed".to_string());
                result.details = output;
                return Ok(finish(&mut state, client, test, result));
            }
            Err(e) => return Err(e.into()),
        };

        let runtime = Arc::clone(self.images.runtime());
        let handle = runtime.run(&image, &self.run_spec(client, test)).await?;
        let lease = ContainerLease::new(Arc::clone(&runtime), handle);
        let watch = self.watchdog.watch(lease.handle());
        obs::emit_container_started(&lease.handle().id, image.as_str());
        transition(&mut state, ExecutionState::Running);

        let clock = tokio::time::Instant::now();
        let waited = runtime.wait(lease.handle(), self.config.wait_limit).await;
        let elapsed = clock.elapsed();
        let killed = watch.release();
        let waited = match waited {
            Ok(waited) => waited,
            Err(e) => {
                if let Err(cleanup) = lease.release().await {
                    warn!(error = %cleanup, "cleanup after failed wait also failed");
                }
                return Err(e.into());
            }
        };

        let details =
            match runtime::log_tail(runtime.logs(lease.handle()), self.config.log_tail_lines)
                .await
            {
                Ok(tail) => tail,
                Err(e) => {
                    warn!(error = %e, "could not collect container logs");
                    String::new()
                }
            };
        lease.release().await?;

        let outcome = if killed || waited.timed_out {
            Outcome::TimedOut
        } else if waited.exit_code == Some(0) {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };

        let mut result = ExecutionResult::new(test.category, outcome, start);
        result.exit_code = waited.exit_code.filter(|_| outcome != Outcome::TimedOut);
        result.details = details;
        result.error = match outcome {
            Outcome::Failed => Some(format!(
                "container exited with status {}",
                waited.exit_code.unwrap_or(-1)
            )),
            Outcome::TimedOut => Some(format!(
                "timed out after {}s",
                self.watchdog.timeout().as_secs()
            )),
            _ => None,
        };
        if test.category == Category::Benchmark {
            result.duration_ms = Some(elapsed.as_millis() as u64);
        }
        Ok(finish(&mut state, client, test, result))
    }
}

fn transition(state: &mut ExecutionState, next: ExecutionState) {
    debug!(from = ?*state, to = ?next, "execution state");
    *state = next;
}

fn finish(
    state: &mut ExecutionState,
    client: &ClientSpec,
    test: &TestCase,
    result: ExecutionResult,
) -> ExecutionResult {
    transition(state, result.outcome.into());
    let duration_ms = (result.end - result.start).num_milliseconds().max(0) as u64;
    obs::emit_execution_finished(&client.name, &test.name, result.outcome.as_str(), duration_ms);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::image::BuildContext;
    use crate::runtime::fakes::{FakeRuntime, ImageScript};

    struct Fixture {
        dir: tempfile::TempDir,
        fake: Arc<FakeRuntime>,
        watchdog: Arc<Watchdog>,
        runner: ExecutionRunner,
        client: ClientSpec,
    }

    fn fixture(config: RunnerConfig, timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine").unwrap();
        let fake = Arc::new(FakeRuntime::new());
        let images = Arc::new(ImageStore::new(
            fake.clone(),
            Arc::new(CachePolicy::disabled()),
        ));
        let watchdog = Arc::new(Watchdog::spawn(
            fake.clone(),
            timeout,
            Duration::from_secs(1),
        ));
        let client = ClientSpec {
            name: "geth".into(),
            context: BuildContext::new(dir.path()),
            image: Some(ImageRef("hive/clients/geth".into())),
            version: Default::default(),
        };
        Fixture {
            runner: ExecutionRunner::new(images, Arc::clone(&watchdog), config),
            watchdog,
            client,
            fake,
            dir,
        }
    }

    fn case(fx: &Fixture, category: Category, name: &str) -> TestCase {
        TestCase {
            category,
            name: name.into(),
            context: BuildContext::new(fx.dir.path()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_zero_succeeds() {
        let fx = fixture(RunnerConfig::default(), Duration::from_secs(60));
        fx.fake.script("hive/validators/t1", ImageScript::exits(0));
        let result = fx
            .runner
            .execute(&fx.client, &case(&fx, Category::Validation, "t1"))
            .await
            .unwrap();
        assert!(result.pass);
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.duration_ms.is_none());
        assert_eq!(fx.fake.open_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_fails_with_log_tail() {
        let config = RunnerConfig {
            log_tail_lines: 2,
            ..RunnerConfig::default()
        };
        let fx = fixture(config, Duration::from_secs(60));
        fx.fake.script(
            "hive/validators/t2",
            ImageScript::exits(1).with_logs("setup\nrunning\nassertion failed\n"),
        );
        let result = fx
            .runner
            .execute(&fx.client, &case(&fx, Category::Validation, "t2"))
            .await
            .unwrap();
        assert!(!result.pass);
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.details, "running\nassertion failed");
        assert_eq!(fx.fake.open_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_starts_no_container() {
        let fx = fixture(RunnerConfig::default(), Duration::from_secs(60));
        fx.fake.script(
            "hive/validators/broken",
            ImageScript::fails_build("COPY failed"),
        );
        let result = fx
            .runner
            .execute(&fx.client, &case(&fx, Category::Validation, "broken"))
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::BuildFailed);
        assert_eq!(result.details, "COPY failed");
        assert!(fx.fake.runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_container_times_out_and_is_removed() {
        let fx = fixture(RunnerConfig::default(), Duration::from_secs(5));
        fx.fake.script(
            "hive/validators/slow",
            ImageScript::exits(0)
                .running_for(Duration::from_secs(3600))
                .with_logs("still syncing"),
        );
        let result = fx
            .runner
            .execute(&fx.client, &case(&fx, Category::Validation, "slow"))
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(!result.pass);
        assert!(result.exit_code.is_none());
        assert_eq!(result.details, "still syncing");
        assert_eq!(fx.fake.kills().len(), 2); // watchdog kill + release kill
        assert_eq!(fx.fake.open_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_execution_leaves_nothing_watched() {
        let fx = fixture(RunnerConfig::default(), Duration::from_secs(60));
        fx.fake.script(
            "hive/validators/slow",
            ImageScript::exits(0).running_for(Duration::from_secs(3600)),
        );
        let test = case(&fx, Category::Validation, "slow");
        let cancelled = tokio::time::timeout(
            Duration::from_secs(10),
            fx.runner.execute(&fx.client, &test),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(fx.watchdog.tracked(), 0);

        // Past the deadline nothing is left for the sweep to kill.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.watchdog.sweep().await, 0);
        assert_eq!(fx.watchdog.tracked(), 0);
        assert_eq!(fx.fake.open_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_benchmark_reports_duration() {
        let fx = fixture(RunnerConfig::default(), Duration::from_secs(60));
        fx.fake.script(
            "hive/benchmarks/blocktime",
            ImageScript::exits(0).running_for(Duration::from_secs(7)),
        );
        let result = fx
            .runner
            .execute(&fx.client, &case(&fx, Category::Benchmark, "blocktime"))
            .await
            .unwrap();
        assert!(result.pass);
        assert!(result.duration_ms.unwrap() >= 7000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_failure_during_run_is_an_error() {
        let fx = fixture(RunnerConfig::default(), Duration::from_secs(60));
        fx.fake.set_unavailable(true);
        let err = fx
            .runner
            .execute(&fx.client, &case(&fx, Category::Validation, "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::HiveError::Runtime(_)));
    }

    #[test]
    fn test_run_spec_injects_client_service_and_dag() {
        let config = RunnerConfig {
            service_host: Some("10.0.0.2".into()),
            service_port: Some(8545),
            dag_dir: Some(PathBuf::from("/work/ethash")),
            ..RunnerConfig::default()
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let fx = fixture(config, Duration::from_secs(60));

        let sim = case(&fx, Category::Simulation, "sync");
        let spec = fx.runner.run_spec(&fx.client, &sim);
        assert_eq!(spec.env["HIVE_CLIENT"], "geth");
        assert_eq!(spec.env["HIVE_CLIENT_IMAGE"], "hive/clients/geth");
        assert_eq!(spec.env["HIVE_SERVICE_HOST"], "10.0.0.2");
        assert_eq!(spec.env["HIVE_SERVICE_PORT"], "8545");
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].container, DAG_MOUNT_POINT);

        let val = case(&fx, Category::Validation, "t1");
        assert!(fx.runner.run_spec(&fx.client, &val).mounts.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::TimedOut.is_terminal());
        assert_eq!(
            ExecutionState::from(Outcome::BuildFailed),
            ExecutionState::BuildFailed
        );
    }
}
