//! In-memory fake container runtime (testing only)
//!
//! `FakeRuntime` satisfies the [`ContainerRuntime`] contract without a daemon.
//! Behaviour is scripted per image tag with [`ImageScript`]; unscripted images
//! build fine and exit 0 immediately.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use walkdir::WalkDir;

use super::{
    ContainerHandle, ContainerRuntime, ImageRef, LogStream, RunSpec, RuntimeError, RuntimeResult,
    WaitOutcome,
};

/// Exit code reported for containers stopped by `kill`.
pub const KILLED_EXIT_CODE: i64 = 137;

/// Scripted behaviour for one image tag.
#[derive(Debug, Clone, Default)]
pub struct ImageScript {
    /// When set, building this tag fails with this output.
    pub build_error: Option<String>,
    pub exit_code: i64,
    /// How long a container of this image runs before exiting on its own.
    pub run_for: Duration,
    pub logs: String,
    /// Files readable through `copy_from`, keyed by absolute path.
    pub files: HashMap<String, Vec<u8>>,
}

impl ImageScript {
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn fails_build(output: impl Into<String>) -> Self {
        Self {
            build_error: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn running_for(mut self, duration: Duration) -> Self {
        self.run_for = duration;
        self
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

/// One recorded `build_image` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCall {
    pub tag: String,
    pub no_cache: bool,
}

#[derive(Debug)]
struct FakeContainer {
    script: ImageScript,
    started: Instant,
    killed: watch::Sender<bool>,
}

/// Scripted in-memory container runtime.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    scripts: Mutex<HashMap<String, ImageScript>>,
    builds: Mutex<Vec<BuildCall>>,
    contexts: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    runs: Mutex<Vec<(String, RunSpec)>>,
    kills: Mutex<Vec<String>>,
    next_id: AtomicU64,
    peak_open: AtomicUsize,
    unavailable: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour of an image tag.
    pub fn script(&self, tag: &str, script: ImageScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(tag.to_string(), script);
    }

    /// Make every subsequent call fail as if the daemon went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn build_calls(&self) -> Vec<BuildCall> {
        self.builds.lock().unwrap().clone()
    }

    /// Number of times `tag` was built.
    pub fn build_count(&self, tag: &str) -> usize {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.tag == tag)
            .count()
    }

    /// File contents of the build context as seen when `tag` was last built,
    /// keyed by `/`-separated relative path.
    pub fn built_context(&self, tag: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.contexts.lock().unwrap().get(tag).cloned()
    }

    /// Every started container as `(image, spec)`, in start order.
    pub fn runs(&self) -> Vec<(String, RunSpec)> {
        self.runs.lock().unwrap().clone()
    }

    /// Ids of containers that received a kill.
    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    /// Containers created and not yet removed.
    pub fn open_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Highest number of containers that were open at the same time.
    pub fn peak_open_containers(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> RuntimeResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("fake daemon offline".into()));
        }
        Ok(())
    }

    fn script_for(&self, tag: &str) -> ImageScript {
        self.scripts
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }
}

fn snapshot_context(context: &Path) -> RuntimeResult<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(context).sort_by_file_name() {
        let entry = entry.map_err(|e| RuntimeError::api("build", e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(context)
            .map_err(|e| RuntimeError::api("build", e.to_string()))?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bytes =
            std::fs::read(entry.path()).map_err(|e| RuntimeError::api("build", e.to_string()))?;
        files.insert(key, bytes);
    }
    Ok(files)
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn version(&self) -> RuntimeResult<String> {
        self.check_available()?;
        Ok("fake-1.0".to_string())
    }

    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        no_cache: bool,
    ) -> RuntimeResult<ImageRef> {
        self.check_available()?;
        self.builds.lock().unwrap().push(BuildCall {
            tag: tag.to_string(),
            no_cache,
        });
        let files = snapshot_context(context)?;
        self.contexts.lock().unwrap().insert(tag.to_string(), files);

        match self.script_for(tag).build_error {
            Some(output) => Err(RuntimeError::BuildFailed {
                tag: tag.to_string(),
                output,
            }),
            None => Ok(ImageRef(tag.to_string())),
        }
    }

    async fn run(&self, image: &ImageRef, spec: &RunSpec) -> RuntimeResult<ContainerHandle> {
        self.check_available()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake{n:016x}");
        let (killed, _) = watch::channel(false);
        let script = self.script_for(image.as_str());
        let open = {
            let mut containers = self.containers.lock().unwrap();
            containers.insert(
                id.clone(),
                FakeContainer {
                    script,
                    started: Instant::now(),
                    killed,
                },
            );
            containers.len()
        };
        self.peak_open.fetch_max(open, Ordering::SeqCst);
        self.runs
            .lock()
            .unwrap()
            .push((image.0.clone(), spec.clone()));
        Ok(ContainerHandle::new(id))
    }

    async fn wait(
        &self,
        handle: &ContainerHandle,
        timeout: Option<Duration>,
    ) -> RuntimeResult<WaitOutcome> {
        self.check_available()?;
        let (mut killed_rx, remaining, exit_code) = {
            let containers = self.containers.lock().unwrap();
            let c = containers
                .get(&handle.id)
                .ok_or_else(|| RuntimeError::NoSuchContainer(handle.id.clone()))?;
            let remaining = c.script.run_for.saturating_sub(c.started.elapsed());
            (c.killed.subscribe(), remaining, c.script.exit_code)
        };

        let exited = async move {
            if *killed_rx.borrow() {
                return KILLED_EXIT_CODE;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => exit_code,
                _ = killed_rx.changed() => KILLED_EXIT_CODE,
            }
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, exited).await {
                Ok(code) => Ok(WaitOutcome::exited(code)),
                Err(_) => Ok(WaitOutcome::timed_out()),
            },
            None => Ok(WaitOutcome::exited(exited.await)),
        }
    }

    async fn kill(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.check_available()?;
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(&handle.id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(handle.id.clone()))?;
        c.killed.send_replace(true);
        self.kills.lock().unwrap().push(handle.id.clone());
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.check_available()?;
        let removed = self.containers.lock().unwrap().remove(&handle.id);
        match removed {
            Some(c) => {
                // Wake any waiter still parked on this container.
                c.killed.send_replace(true);
                Ok(())
            }
            None => Err(RuntimeError::NoSuchContainer(handle.id.clone())),
        }
    }

    fn logs(&self, handle: &ContainerHandle) -> LogStream {
        let logs = self
            .containers
            .lock()
            .unwrap()
            .get(&handle.id)
            .map(|c| c.script.logs.clone().into_bytes())
            .ok_or_else(|| RuntimeError::NoSuchContainer(handle.id.clone()));
        Box::pin(futures::stream::iter(vec![logs]))
    }

    async fn copy_from(&self, handle: &ContainerHandle, path: &str) -> RuntimeResult<Vec<u8>> {
        self.check_available()?;
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(&handle.id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(handle.id.clone()))?;
        c.script
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::FileNotFound {
                container: handle.id.clone(),
                path: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_records_context_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.sh"), "echo hi").unwrap();

        let fake = FakeRuntime::new();
        let image = fake.build_image(dir.path(), "hive/x", true).await.unwrap();
        assert_eq!(image.as_str(), "hive/x");
        assert_eq!(
            fake.build_calls(),
            vec![BuildCall {
                tag: "hive/x".into(),
                no_cache: true
            }]
        );

        let ctx = fake.built_context("hive/x").unwrap();
        assert_eq!(ctx.get("Dockerfile").unwrap(), b"FROM scratch");
        assert_eq!(ctx.get("src/main.sh").unwrap(), b"echo hi");
    }

    #[tokio::test]
    async fn test_scripted_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuntime::new();
        fake.script("hive/bad", ImageScript::fails_build("step 3 failed"));
        match fake.build_image(dir.path(), "hive/bad", false).await {
            Err(RuntimeError::BuildFailed { output, .. }) => assert_eq!(output, "step 3 failed"),
            other => panic!("expected BuildFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_scripted_exit_code() {
        let fake = FakeRuntime::new();
        fake.script(
            "img",
            ImageScript::exits(3).running_for(Duration::from_secs(5)),
        );
        let handle = fake.run(&ImageRef("img".into()), &RunSpec::default()).await.unwrap();
        let outcome = fake.wait(&handle, None).await.unwrap();
        assert_eq!(outcome, WaitOutcome::exited(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_timeout_reports_timed_out() {
        let fake = FakeRuntime::new();
        fake.script(
            "img",
            ImageScript::exits(0).running_for(Duration::from_secs(60)),
        );
        let handle = fake.run(&ImageRef("img".into()), &RunSpec::default()).await.unwrap();
        let outcome = fake
            .wait(&handle, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(fake.open_containers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_wakes_waiter() {
        let fake = std::sync::Arc::new(FakeRuntime::new());
        fake.script(
            "img",
            ImageScript::exits(0).running_for(Duration::from_secs(3600)),
        );
        let handle = fake.run(&ImageRef("img".into()), &RunSpec::default()).await.unwrap();

        let waiter = {
            let fake = fake.clone();
            let handle = handle.clone();
            tokio::spawn(async move { fake.wait(&handle, None).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        fake.kill(&handle).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.exit_code, Some(KILLED_EXIT_CODE));
        assert_eq!(fake.kills(), vec![handle.id.clone()]);
    }

    #[tokio::test]
    async fn test_copy_from_missing_file() {
        let fake = FakeRuntime::new();
        fake.script("img", ImageScript::exits(0).with_file("/version.json", "{}"));
        let handle = fake.run(&ImageRef("img".into()), &RunSpec::default()).await.unwrap();
        assert_eq!(fake.copy_from(&handle, "/version.json").await.unwrap(), b"{}");
        assert!(matches!(
            fake.copy_from(&handle, "/nope").await,
            Err(RuntimeError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unavailable_daemon() {
        let fake = FakeRuntime::new();
        fake.set_unavailable(true);
        assert!(matches!(
            fake.version().await,
            Err(RuntimeError::Unavailable(_))
        ));
    }
}
