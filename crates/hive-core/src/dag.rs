//! Ethash DAG precomputation ahead of simulations.
//!
//! Simulations run mining nodes that all need the same proof-of-work dataset.
//! It is generated once into the workspace by a helper image and then
//! mounted read-only into every simulation container.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{BuildError, BuildTarget, HiveError, HiveResult};
use crate::image::{BuildContext, ImageStore};
use crate::runner::DAG_MOUNT_POINT;
use crate::runtime::{ContainerLease, Mount, RunSpec, RuntimeError};

/// Image that writes the DAG into its `/root/.ethash` mount.
pub const DAG_IMAGE: &str = "hive/internal/ethash";

/// Build context of [`DAG_IMAGE`], relative to the hive root.
pub const DAG_CONTEXT: &str = "internal/ethash";

pub struct DagGenerator {
    images: Arc<ImageStore>,
    context: PathBuf,
    output: PathBuf,
    timeout: Duration,
}

impl DagGenerator {
    pub fn new(
        images: Arc<ImageStore>,
        root: &Path,
        workspace: &Path,
        timeout: Duration,
    ) -> Self {
        Self {
            images,
            context: root.join(DAG_CONTEXT),
            output: workspace.join("ethash"),
            timeout,
        }
    }

    /// Host directory the DAG is written to.
    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    /// Build the generator image and run it to completion.
    ///
    /// Returns the directory holding the DAG.
    pub async fn generate(&self) -> HiveResult<PathBuf> {
        std::fs::create_dir_all(&self.output)?;

        let image = match self
            .images
            .ensure(DAG_IMAGE, &BuildContext::new(&self.context))
            .await
        {
            Ok(image) => image,
            Err(RuntimeError::BuildFailed { output, .. }) => {
                return Err(BuildError {
                    target: BuildTarget::Internal(DAG_IMAGE.to_string()),
                    cause: output,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(output = %self.output.display(), "generating ethash DAG");
        let runtime = Arc::clone(self.images.runtime());
        let spec = RunSpec::default().mount(Mount {
            host: self.output.clone(),
            container: DAG_MOUNT_POINT.to_string(),
            read_only: false,
        });
        let handle = runtime.run(&image, &spec).await?;
        let lease = ContainerLease::new(Arc::clone(&runtime), handle);

        let waited = runtime.wait(lease.handle(), Some(self.timeout)).await;
        lease.release().await?;
        let waited = waited?;

        if waited.timed_out {
            return Err(HiveError::Dag(format!(
                "generator did not finish within {}s",
                self.timeout.as_secs()
            )));
        }
        match waited.exit_code {
            Some(0) => Ok(self.output.clone()),
            code => Err(HiveError::Dag(format!(
                "generator exited with status {}",
                code.unwrap_or(-1)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::runtime::fakes::{FakeRuntime, ImageScript};

    fn generator(fake: &Arc<FakeRuntime>, dir: &Path) -> DagGenerator {
        let images = Arc::new(ImageStore::new(
            fake.clone(),
            Arc::new(CachePolicy::disabled()),
        ));
        DagGenerator::new(
            images,
            &dir.join("hive"),
            &dir.join("workspace"),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_mounts_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hive/internal/ethash")).unwrap();
        let fake = Arc::new(FakeRuntime::new());
        let dag = generator(&fake, dir.path());

        let out = dag.generate().await.unwrap();
        assert_eq!(out, dir.path().join("workspace/ethash"));
        assert!(out.is_dir());

        let runs = fake.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, DAG_IMAGE);
        assert_eq!(runs[0].1.mounts[0].host, out);
        assert!(!runs[0].1.mounts[0].read_only);
        assert_eq!(fake.open_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_failure_is_dag_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hive/internal/ethash")).unwrap();
        let fake = Arc::new(FakeRuntime::new());
        fake.script(DAG_IMAGE, ImageScript::exits(2));

        let err = generator(&fake, dir.path()).generate().await.unwrap_err();
        assert!(matches!(err, HiveError::Dag(_)));
        assert_eq!(fake.open_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_timeout_is_dag_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hive/internal/ethash")).unwrap();
        let fake = Arc::new(FakeRuntime::new());
        fake.script(
            DAG_IMAGE,
            ImageScript::exits(0).running_for(Duration::from_secs(3600)),
        );

        let err = generator(&fake, dir.path()).generate().await.unwrap_err();
        assert!(err.to_string().contains("did not finish"));
        assert_eq!(fake.open_containers(), 0);
    }

    #[tokio::test]
    async fn test_generator_build_failure_names_internal_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hive/internal/ethash")).unwrap();
        let fake = Arc::new(FakeRuntime::new());
        fake.script(DAG_IMAGE, ImageScript::fails_build("no go toolchain"));

        match generator(&fake, dir.path()).generate().await {
            Err(HiveError::Build(err)) => {
                assert_eq!(err.target, BuildTarget::Internal(DAG_IMAGE.into()));
                assert!(err.client_name().is_none());
            }
            other => panic!("expected build error, got {:?}", other.map(|_| ())),
        }
    }
}
