//! Ownership of a running container.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ContainerHandle, ContainerRuntime, RuntimeResult};

/// Owns a started container until it is stopped and removed.
///
/// Call [`ContainerLease::release`] on every normal path. If the lease is
/// dropped while still held (early `?` return, task cancellation, panic) the
/// kill+remove is issued from a detached task instead.
pub struct ContainerLease {
    runtime: Arc<dyn ContainerRuntime>,
    handle: Option<ContainerHandle>,
}

impl ContainerLease {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, handle: ContainerHandle) -> Self {
        Self {
            runtime,
            handle: Some(handle),
        }
    }

    /// The leased container. Only `None` after release, which consumes self.
    pub fn handle(&self) -> &ContainerHandle {
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease handle taken before release"))
    }

    /// Stop and remove the container.
    ///
    /// A failing kill is tolerated (the container may already have exited);
    /// a failing remove is reported.
    pub async fn release(mut self) -> RuntimeResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(e) = self.runtime.kill(&handle).await {
            debug!(container = %handle, error = %e, "kill before remove failed");
        }
        self.runtime.remove(&handle).await
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!(container = %handle, "container lease dropped while held, cleaning up");
                rt.spawn(async move {
                    let _ = runtime.kill(&handle).await;
                    if let Err(e) = runtime.remove(&handle).await {
                        warn!(container = %handle, error = %e, "failed to remove container");
                    }
                });
            }
            Err(_) => {
                warn!(container = %handle, "container leaked: no async runtime to clean up");
            }
        }
    }
}
