//! Image materialization with per-run memoization.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::cache::CachePolicy;
use crate::obs;
use crate::overrides::{stage_context, OverrideRule};
use crate::runtime::{ContainerRuntime, ImageRef, RuntimeError, RuntimeResult};

/// Where an image is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildContext {
    pub dir: PathBuf,
    /// Host files substituted into `dir` before building.
    pub overrides: Vec<OverrideRule>,
}

impl BuildContext {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            overrides: Vec::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<OverrideRule>) -> Self {
        self.overrides = overrides;
        self
    }
}

type BuildSlot = Arc<OnceCell<RuntimeResult<ImageRef>>>;

/// Builds images through the runtime, at most once per tag per run.
///
/// Concurrent requests for the same tag share a single build; later requests
/// get the memoized outcome, failures included.
pub struct ImageStore {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<CachePolicy>,
    slots: Mutex<HashMap<String, BuildSlot>>,
}

impl ImageStore {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: Arc<CachePolicy>) -> Self {
        Self {
            runtime,
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Build `context` as `tag`, or return the outcome of the earlier build.
    pub async fn ensure(&self, tag: &str, context: &BuildContext) -> RuntimeResult<ImageRef> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(slots.entry(tag.to_string()).or_default())
        };
        if slot.initialized() {
            debug!(image = tag, "image already materialized this run");
        }
        slot.get_or_init(|| self.build(tag, context)).await.clone()
    }

    async fn build(&self, tag: &str, context: &BuildContext) -> RuntimeResult<ImageRef> {
        let no_cache = self.policy.should_rebuild(tag);
        info!(image = tag, no_cache, context = %context.dir.display(), "building image");

        let result = if context.overrides.is_empty() {
            self.runtime.build_image(&context.dir, tag, no_cache).await
        } else {
            let dir = context.dir.clone();
            let overrides = context.overrides.clone();
            let staged = tokio::task::spawn_blocking(move || stage_context(&dir, &overrides))
                .await
                .map_err(std::io::Error::other)
                .and_then(|staged| staged)
                .map_err(|e| RuntimeError::BuildFailed {
                    tag: tag.to_string(),
                    output: format!("staging override files: {e}"),
                })?;
            self.runtime
                .build_image(staged.path(), tag, no_cache)
                .await
        };

        obs::emit_image_built(tag, no_cache, result.is_ok());
        result
    }
}
