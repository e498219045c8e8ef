//! Image cache policy: which images must be rebuilt from scratch.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use crate::error::{HiveError, HiveResult};

/// Decides, per image name, whether the layer cache must be bypassed.
///
/// The decision for a name is computed from the exclusion pattern on first
/// request and memoized for the rest of the run.
#[derive(Debug, Default)]
pub struct CachePolicy {
    pattern: Option<Regex>,
    decisions: Mutex<HashMap<String, bool>>,
}

impl CachePolicy {
    /// Build a policy from a regex. An empty pattern never forces a rebuild.
    pub fn new(pattern: &str) -> HiveResult<Self> {
        let pattern = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern).map_err(|e| {
                HiveError::config(format!("invalid no-cache pattern {pattern:?}: {e}"))
            })?)
        };
        Ok(Self {
            pattern,
            decisions: Mutex::new(HashMap::new()),
        })
    }

    /// A policy that reuses every cached image.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn should_rebuild(&self, image: &str) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        let mut decisions = self
            .decisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *decisions
            .entry(image.to_string())
            .or_insert_with(|| pattern.is_match(image))
    }

    /// Number of image names with a memoized decision.
    pub fn decided(&self) -> usize {
        self.decisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
