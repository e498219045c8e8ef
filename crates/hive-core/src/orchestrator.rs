//! Top-level run: resolve clients, then execute every selected category.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ClientResolver, ClientSpec};
use crate::config::RunPlan;
use crate::dag::DagGenerator;
use crate::error::{HiveError, HiveResult};
use crate::image::ImageStore;
use crate::obs;
use crate::report::{Report, ResultAggregator};
use crate::runner::ExecutionRunner;
use crate::runtime::ContainerRuntime;
use crate::selector::{Category, TestCase, TestSelector};
use crate::watchdog::Watchdog;

/// A configured hive run against one container runtime.
pub struct Hive {
    plan: RunPlan,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Hive {
    pub fn new(plan: RunPlan, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { plan, runtime }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Execute the whole plan and return the finished report.
    ///
    /// A client that fails to build ends the run with a
    /// [`HiveError::Build`]; use [`HiveError::failure_report`] to obtain
    /// the report describing it.
    #[instrument(skip_all, fields(clients = self.plan.clients.as_str()))]
    pub async fn run(&self) -> HiveResult<Report> {
        let version = self.runtime.version().await?;
        obs::emit_daemon_online(&self.plan.docker_endpoint, &version);

        let images = Arc::new(ImageStore::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.plan.cache),
        ));
        let aggregator = Arc::new(ResultAggregator::new());

        let clients = ClientResolver::new(&self.plan.root, Arc::clone(&images))
            .resolve(&self.plan.clients)
            .await?;
        for client in &clients {
            aggregator.record_client(&client.name, client.version.clone());
        }
        let clients: Vec<Arc<ClientSpec>> = clients.into_iter().map(Arc::new).collect();

        let watchdog = Arc::new(Watchdog::spawn(
            Arc::clone(&self.runtime),
            self.plan.timeout,
            self.plan.poll_interval,
        ));
        let selector = TestSelector::new(&self.plan.root, self.plan.overrides.clone());
        let mut runner_config = self.plan.runner.clone();

        for (category, filter) in &self.plan.categories {
            let category = *category;
            let tests = {
                let selector = selector.clone();
                let filter = filter.clone();
                tokio::task::spawn_blocking(move || selector.select(category, &filter))
                    .await
                    .map_err(|e| HiveError::Worker(e.to_string()))??
            };
            if tests.is_empty() || clients.is_empty() {
                debug!(%category, tests = tests.len(), "nothing to run");
                continue;
            }

            if category == Category::Simulation {
                let dag = DagGenerator::new(
                    Arc::clone(&images),
                    &self.plan.root,
                    &self.plan.workspace,
                    self.plan.timeout,
                );
                match dag.generate().await {
                    Ok(dir) => runner_config.dag_dir = Some(dir),
                    Err(HiveError::Runtime(e)) => return Err(e.into()),
                    Err(e) => {
                        error!(error = %e, abandoned = tests.len(), "DAG generation failed, skipping simulations");
                        continue;
                    }
                }
            }

            let runner = Arc::new(ExecutionRunner::new(
                Arc::clone(&images),
                Arc::clone(&watchdog),
                runner_config.clone(),
            ));
            self.run_category(category, &clients, tests, runner, &aggregator)
                .await?;
        }

        drop(watchdog);
        let report = match Arc::try_unwrap(aggregator) {
            Ok(aggregator) => aggregator.finish(),
            Err(shared) => shared.snapshot(),
        };
        Ok(report)
    }

    /// Run every (client, test) pair of one category on the worker pool.
    ///
    /// A runtime failure in any worker stops the remaining ones from
    /// starting; it is returned once all workers have finished.
    async fn run_category(
        &self,
        category: Category,
        clients: &[Arc<ClientSpec>],
        tests: Vec<TestCase>,
        runner: Arc<ExecutionRunner>,
        aggregator: &Arc<ResultAggregator>,
    ) -> HiveResult<()> {
        info!(
            %category,
            clients = clients.len(),
            tests = tests.len(),
            concurrency = self.plan.max_concurrency,
            "running category"
        );
        let sem = Arc::new(Semaphore::new(self.plan.max_concurrency));
        let (abort_tx, _abort_rx) = watch::channel(false);
        let abort = Arc::new(abort_tx);

        let tests: Vec<Arc<TestCase>> = tests.into_iter().map(Arc::new).collect();
        let mut tasks = Vec::with_capacity(clients.len() * tests.len());
        for client in clients {
            for test in &tests {
                let client = Arc::clone(client);
                let test = Arc::clone(test);
                let runner = Arc::clone(&runner);
                let aggregator = Arc::clone(aggregator);
                let sem = Arc::clone(&sem);
                let abort_rx = abort.subscribe();
                let abort = Arc::clone(&abort);

                tasks.push(tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.ok();
                    if *abort_rx.borrow() {
                        return Ok(None);
                    }
                    match runner.execute(&client, &test).await {
                        Ok(result) => {
                            let pass = result.pass;
                            aggregator.record(&client.name, &test.name, result);
                            Ok(Some(pass))
                        }
                        Err(e) => {
                            abort.send_replace(true);
                            Err(e)
                        }
                    }
                }));
            }
        }

        let mut executions = 0;
        let mut passed = 0;
        let mut fatal: Option<HiveError> = None;
        for task in tasks {
            match task.await {
                Ok(Ok(Some(pass))) => {
                    executions += 1;
                    if pass {
                        passed += 1;
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(%category, error = %e, "execution aborted the category");
                    fatal.get_or_insert(e);
                }
                Err(join) => {
                    fatal.get_or_insert(HiveError::Worker(join.to_string()));
                }
            }
        }
        obs::emit_category_finished(category, executions, passed);

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
