//! Container timeout enforcement.
//!
//! One periodic task checks every registered container against its deadline
//! on a fixed tick. The tick is independent of the per-container timeout, so
//! the cost of monitoring does not grow with the number of timers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::obs;
use crate::runtime::{ContainerHandle, ContainerRuntime};

#[derive(Debug)]
struct Watched {
    handle: ContainerHandle,
    started: Instant,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    watched: HashMap<String, Watched>,
    expired: HashSet<String>,
}

struct Shared {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<Watched> = {
            let mut registry = self.registry();
            let ids: Vec<String> = registry
                .watched
                .iter()
                .filter(|(_, w)| w.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let w = registry.watched.remove(&id)?;
                    registry.expired.insert(id);
                    Some(w)
                })
                .collect()
        };

        for w in &overdue {
            let elapsed_ms = now.duration_since(w.started).as_millis() as u64;
            obs::emit_container_timed_out(&w.handle.id, elapsed_ms);
            if let Err(e) = self.runtime.kill(&w.handle).await {
                warn!(container = %w.handle, error = %e, "failed to kill timed out container");
            }
        }
        overdue.len()
    }
}

/// Periodic timeout checker over all running containers.
///
/// Register a container with [`watch`](Watchdog::watch) right after it
/// starts and release the returned [`WatchGuard`] once `wait` returns. A
/// container past its deadline is killed on the next tick, which makes the
/// owner's `wait` return; the release then reports that it timed out.
pub struct Watchdog {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Start the checker task. Must be called inside a tokio runtime.
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            runtime,
            timeout,
            registry: Mutex::new(Registry::default()),
        });
        let task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let killed = shared.sweep().await;
                    if killed > 0 {
                        debug!(killed, "watchdog sweep");
                    }
                }
            })
        };
        Self { shared, task }
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Start the clock on a freshly started container.
    ///
    /// The container stays registered until the guard is released or
    /// dropped.
    pub fn watch(&self, handle: &ContainerHandle) -> WatchGuard {
        let started = Instant::now();
        self.shared.registry().watched.insert(
            handle.id.clone(),
            Watched {
                handle: handle.clone(),
                started,
                deadline: started + self.shared.timeout,
            },
        );
        WatchGuard {
            shared: Arc::clone(&self.shared),
            id: Some(handle.id.clone()),
        }
    }

    /// Containers currently under watch.
    pub fn watched(&self) -> usize {
        self.shared.registry().watched.len()
    }

    /// Containers known to the registry, watched or expired and not yet
    /// released.
    pub fn tracked(&self) -> usize {
        let registry = self.shared.registry();
        registry.watched.len() + registry.expired.len()
    }

    /// Run one check immediately, outside the periodic schedule.
    pub async fn sweep(&self) -> usize {
        self.shared.sweep().await
    }
}

/// Registration of one container with a [`Watchdog`].
///
/// Dropping the guard deregisters the container, so a cancelled owner
/// leaves nothing behind in the registry.
pub struct WatchGuard {
    shared: Arc<Shared>,
    id: Option<String>,
}

impl WatchGuard {
    /// Stop tracking the container. Returns whether it was killed for
    /// exceeding its deadline.
    pub fn release(mut self) -> bool {
        self.forget()
    }

    fn forget(&mut self) -> bool {
        let Some(id) = self.id.take() else {
            return false;
        };
        let mut registry = self.shared.registry();
        registry.watched.remove(&id);
        registry.expired.remove(&id)
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.forget();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}
