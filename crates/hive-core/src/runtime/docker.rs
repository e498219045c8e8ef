//! Docker adapter driving the `docker` command-line client.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    ContainerHandle, ContainerRuntime, ImageRef, LogStream, RunSpec, RuntimeError, RuntimeResult,
    WaitOutcome,
};

/// Default daemon endpoint.
pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/docker.sock";

/// Lines of build output kept in a `BuildFailed` error.
const BUILD_OUTPUT_TAIL: usize = 50;

/// [`ContainerRuntime`] backed by the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    endpoint: String,
}

impl DockerCli {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            endpoint: endpoint.into(),
        }
    }

    /// Use a different client binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--host").arg(&self.endpoint);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a docker subcommand to completion. Spawn failures mean the client
    /// or daemon is unusable.
    async fn exec(&self, op: &'static str, args: &[&str]) -> RuntimeResult<Output> {
        let mut cmd = self.command();
        cmd.args(args);
        debug!(op, args = ?args, "docker");
        cmd.output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("{} {op}: {e}", self.binary)))
    }

    /// Like [`exec`](Self::exec) but maps a non-zero exit to an API error.
    async fn exec_ok(&self, op: &'static str, args: &[&str]) -> RuntimeResult<String> {
        let output = self.exec(op, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") {
                return Err(RuntimeError::NoSuchContainer(
                    args.last().copied().unwrap_or_default().to_string(),
                ));
            }
            if stderr.contains("Cannot connect to the Docker daemon") {
                return Err(RuntimeError::Unavailable(stderr));
            }
            return Err(RuntimeError::api(op, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

/// Arguments for `docker run`, everything before the image name.
fn run_args(name: &str, spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        let mut bind = format!("{}:{}", mount.host.display(), mount.container);
        if mount.read_only {
            bind.push_str(":ro");
        }
        args.push("--volume".to_string());
        args.push(bind);
    }
    args
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(max)..].join("\n")
}

/// Interleave the two halves of `docker logs --timestamps` output back into
/// write order and strip the timestamps.
///
/// Each line starts with an RFC 3339 timestamp. A line without one keeps the
/// timestamp of the line before it.
fn merge_timestamped(stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    fn parse(bytes: &[u8]) -> Vec<(Option<DateTime<FixedOffset>>, String)> {
        let mut last = None;
        String::from_utf8_lossy(bytes)
            .lines()
            .map(|line| {
                let stamped = line.split_once(' ').and_then(|(ts, rest)| {
                    DateTime::parse_from_rfc3339(ts).ok().map(|ts| (ts, rest))
                });
                match stamped {
                    Some((ts, rest)) => {
                        last = Some(ts);
                        (last, rest.to_string())
                    }
                    None => (last, line.to_string()),
                }
            })
            .collect()
    }

    let out = parse(stdout);
    let err = parse(stderr);
    let mut merged = Vec::with_capacity(stdout.len() + stderr.len());
    let (mut i, mut j) = (0, 0);
    while i < out.len() || j < err.len() {
        let take_out = match (out.get(i), err.get(j)) {
            (Some((a, _)), Some((b, _))) => a <= b,
            (Some(_), None) => true,
            _ => false,
        };
        let line = if take_out {
            i += 1;
            &out[i - 1].1
        } else {
            j += 1;
            &err[j - 1].1
        };
        merged.extend_from_slice(line.as_bytes());
        merged.push(b'\n');
    }
    merged
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn version(&self) -> RuntimeResult<String> {
        self.exec_ok("version", &["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| match e {
                RuntimeError::Api { reason, .. } => RuntimeError::Unavailable(reason),
                other => other,
            })
    }

    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        no_cache: bool,
    ) -> RuntimeResult<ImageRef> {
        let context = context.to_string_lossy();
        let mut args = vec!["build", "--tag", tag];
        if no_cache {
            args.push("--no-cache");
        }
        args.push(&context);

        let output = self.exec("build", &args).await?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            if text.contains("Cannot connect to the Docker daemon") {
                return Err(RuntimeError::Unavailable(tail_lines(&text, 1)));
            }
            return Err(RuntimeError::BuildFailed {
                tag: tag.to_string(),
                output: tail_lines(&text, BUILD_OUTPUT_TAIL),
            });
        }
        Ok(ImageRef(tag.to_string()))
    }

    async fn run(&self, image: &ImageRef, spec: &RunSpec) -> RuntimeResult<ContainerHandle> {
        let name = format!("hive-{}", uuid::Uuid::new_v4().simple());
        let mut args = run_args(&name, spec);
        args.push(image.0.clone());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.exec_ok("run", &args).await {
            Ok(id) => Ok(ContainerHandle::new(id)),
            Err(e) => {
                // A failed start can leave the created container behind.
                match self
                    .exec_ok("remove", &["rm", "--force", "--volumes", &name])
                    .await
                {
                    Ok(_) | Err(RuntimeError::NoSuchContainer(_)) => {}
                    Err(cleanup) => {
                        warn!(container = %name, error = %cleanup, "failed to remove container after failed start")
                    }
                }
                Err(e)
            }
        }
    }

    async fn wait(
        &self,
        handle: &ContainerHandle,
        timeout: Option<Duration>,
    ) -> RuntimeResult<WaitOutcome> {
        let args = ["wait", handle.id.as_str()];
        let waiting = self.exec_ok("wait", &args);
        let stdout = match timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(result) => result?,
                Err(_) => return Ok(WaitOutcome::timed_out()),
            },
            None => waiting.await?,
        };
        let code = stdout
            .lines()
            .last()
            .unwrap_or_default()
            .parse::<i64>()
            .map_err(|e| RuntimeError::api("wait", format!("bad exit status {stdout:?}: {e}")))?;
        Ok(WaitOutcome::exited(code))
    }

    async fn kill(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.exec_ok("kill", &["kill", &handle.id]).await.map(|_| ())
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.exec_ok("remove", &["rm", "--force", "--volumes", &handle.id])
            .await
            .map(|_| ())
    }

    fn logs(&self, handle: &ContainerHandle) -> LogStream {
        let this = self.clone();
        let id = handle.id.clone();
        Box::pin(futures::stream::once(async move {
            let output = this.exec("logs", &["logs", "--timestamps", &id]).await?;
            if !output.status.success() {
                return Err(RuntimeError::NoSuchContainer(id));
            }
            Ok(merge_timestamped(&output.stdout, &output.stderr))
        }))
    }

    async fn copy_from(&self, handle: &ContainerHandle, path: &str) -> RuntimeResult<Vec<u8>> {
        let dir = tempfile::tempdir().map_err(|e| RuntimeError::api("copy", e.to_string()))?;
        let target = dir.path().join("file");
        let source = format!("{}:{}", handle.id, path);
        let target_arg = target.to_string_lossy();
        let output = self.exec("copy", &["cp", &source, &target_arg]).await?;
        if !output.status.success() {
            return Err(RuntimeError::FileNotFound {
                container: handle.id.clone(),
                path: path.to_string(),
            });
        }
        tokio::fs::read(&target)
            .await
            .map_err(|e| RuntimeError::api("copy", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Mount;
    use std::path::PathBuf;

    #[test]
    fn test_run_args_env_and_mounts_before_image() {
        let spec = RunSpec::default()
            .env("HIVE_CLIENT", "geth")
            .mount(Mount {
                host: PathBuf::from("/work/ethash"),
                container: "/root/.ethash".into(),
                read_only: true,
            });
        let args = run_args("hive-x", &spec);
        assert_eq!(
            args,
            vec![
                "run",
                "--detach",
                "--name",
                "hive-x",
                "--env",
                "HIVE_CLIENT=geth",
                "--volume",
                "/work/ethash:/root/.ethash:ro",
            ]
        );
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 5), "");
    }

    #[test]
    fn test_merge_timestamped_restores_write_order() {
        let stdout = b"2024-05-01T10:00:00.000000001Z line1 stdout\n2024-05-01T10:00:00.000000003Z line3 FAIL stdout\n";
        let stderr = b"2024-05-01T10:00:00.000000002Z line2 stderr\n";
        let merged = merge_timestamped(stdout, stderr);
        assert_eq!(
            String::from_utf8(merged).unwrap(),
            "line1 stdout\nline2 stderr\nline3 FAIL stdout\n"
        );
    }

    #[test]
    fn test_merge_timestamped_keeps_unstamped_continuations() {
        let stdout = b"2024-05-01T10:00:00Z panic: boom\ngoroutine 1 [running]:\n2024-05-01T10:00:05Z exit\n";
        let stderr = b"2024-05-01T10:00:03Z WARN late peer\n";
        let merged = String::from_utf8(merge_timestamped(stdout, stderr)).unwrap();
        assert_eq!(
            merged,
            "panic: boom\ngoroutine 1 [running]:\nWARN late peer\nexit\n"
        );
    }

    /// A fake `docker` that logs its arguments and answers per subcommand.
    #[cfg(unix)]
    fn stub_docker(dir: &Path, body: &str) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\nshift 2\n{}\n",
                log.display(),
                body
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerCli::default().with_binary(script.to_string_lossy())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_removes_created_container() {
        let dir = tempfile::tempdir().unwrap();
        let docker = stub_docker(
            dir.path(),
            r#"case "$1" in
  run) echo "port is already allocated" >&2; exit 125 ;;
  rm) exit 0 ;;
esac"#,
        );

        let err = docker
            .run(&ImageRef("img".into()), &RunSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Api { op: "run", .. }));

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2, "{calls}");
        let name = lines[0]
            .split_whitespace()
            .skip_while(|a| *a != "--name")
            .nth(1)
            .unwrap();
        assert!(name.starts_with("hive-"));
        assert!(lines[1].ends_with(&format!("rm --force --volumes {name}")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_logs_interleave_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let docker = stub_docker(
            dir.path(),
            r#"echo "2024-05-01T10:00:00.000000001Z line1 stdout"
echo "2024-05-01T10:00:00.000000002Z line2 stderr" >&2
echo "2024-05-01T10:00:00.000000003Z line3 FAIL stdout""#,
        );

        let tail = crate::runtime::log_tail(docker.logs(&ContainerHandle::new("abc")), 10)
            .await
            .unwrap();
        assert_eq!(tail, "line1 stdout\nline2 stderr\nline3 FAIL stdout");
        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(calls.contains("logs --timestamps abc"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let docker = DockerCli::default().with_binary("/nonexistent/hive-docker-binary");
        match docker.version().await {
            Err(RuntimeError::Unavailable(_)) => {}
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }
}
