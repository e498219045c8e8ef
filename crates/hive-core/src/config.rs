//! Run configuration and its validated form.
//!
//! [`HiveConfig`] is the raw surface as supplied by flags or a file;
//! [`RunPlan::from_config`] checks all of it before any container work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::error::{HiveError, HiveResult};
use crate::overrides::{parse_overrides, OverrideRule};
use crate::pattern;
use crate::runner::RunnerConfig;
use crate::runtime::docker::DEFAULT_ENDPOINT;
use crate::selector::{Category, TestFilter};

/// Validation pattern used when none is given outside smoke mode.
pub const DEFAULT_VALIDATION_PATTERN: &str = ".";

/// Raw run configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HiveConfig {
    /// Directory holding `clients/`, `validators/`, `simulators/`,
    /// `benchmarks/` and `internal/`.
    pub root: PathBuf,

    /// Scratch directory for generated artifacts such as the DAG.
    pub workspace: PathBuf,

    pub docker_endpoint: String,

    /// Regex over client names (`name[:tag]`).
    pub client_pattern: String,

    /// Regex over validation test names. Empty skips the category; unset
    /// means every validation outside smoke mode.
    pub validation_pattern: Option<String>,
    pub simulation_pattern: Option<String>,
    pub benchmark_pattern: Option<String>,

    /// Run only the smoke subtree of every category.
    pub smoke: bool,

    /// Comma-separated `regexp:path` override entries.
    pub overrides: String,

    /// Regex over image tags that must be built without the layer cache.
    pub no_cache: Option<String>,

    /// Per-container time limit, in seconds.
    pub timeout_secs: u64,

    /// Watchdog tick, in seconds.
    pub poll_interval_secs: u64,

    /// Upper bound on concurrently running test containers.
    pub max_concurrency: usize,

    pub service_host: Option<String>,
    pub service_port: Option<u16>,

    /// Lines of container output kept per result.
    pub log_tail_lines: usize,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            workspace: PathBuf::from("workspace"),
            docker_endpoint: DEFAULT_ENDPOINT.to_string(),
            client_pattern: ":master".to_string(),
            validation_pattern: None,
            simulation_pattern: None,
            benchmark_pattern: None,
            smoke: false,
            overrides: String::new(),
            no_cache: None,
            timeout_secs: 10 * 60,
            poll_interval_secs: 30,
            max_concurrency: default_concurrency(),
            service_host: None,
            service_port: None,
            log_tail_lines: 100,
        }
    }
}

/// One worker per available CPU, at least one.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A validated configuration, ready to run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub docker_endpoint: String,
    pub clients: Regex,
    /// Selected categories in execution order.
    pub categories: Vec<(Category, TestFilter)>,
    pub overrides: Vec<OverrideRule>,
    pub cache: Arc<CachePolicy>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_concurrency: usize,
    pub runner: RunnerConfig,
}

impl RunPlan {
    pub fn from_config(config: &HiveConfig) -> HiveResult<Self> {
        if config.timeout_secs == 0 {
            return Err(HiveError::config("container timeout must be non-zero"));
        }
        if config.poll_interval_secs == 0 {
            return Err(HiveError::config("watchdog poll interval must be non-zero"));
        }
        if config.max_concurrency == 0 {
            return Err(HiveError::config("max concurrency must be at least 1"));
        }

        let clients = pattern::compile("client", &config.client_pattern)?;
        let categories = category_filters(config)?;
        let overrides = parse_overrides(&config.overrides)?;
        let cache = match &config.no_cache {
            Some(p) if !p.is_empty() => CachePolicy::new(p)?,
            _ => CachePolicy::disabled(),
        };

        Ok(Self {
            root: config.root.clone(),
            workspace: config.workspace.clone(),
            docker_endpoint: config.docker_endpoint.clone(),
            clients,
            categories,
            overrides,
            cache: Arc::new(cache),
            timeout: Duration::from_secs(config.timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_concurrency: config.max_concurrency,
            runner: RunnerConfig {
                log_tail_lines: config.log_tail_lines,
                service_host: config.service_host.clone(),
                service_port: config.service_port,
                dag_dir: None,
                // A kill issued by the watchdog lands at most one tick late.
                wait_limit: Some(Duration::from_secs(
                    config.timeout_secs + 2 * config.poll_interval_secs,
                )),
            },
        })
    }

    pub fn filter(&self, category: Category) -> Option<&TestFilter> {
        self.categories
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, f)| f)
    }
}

fn category_filters(config: &HiveConfig) -> HiveResult<Vec<(Category, TestFilter)>> {
    let explicit = [
        (Category::Validation, &config.validation_pattern),
        (Category::Simulation, &config.simulation_pattern),
        (Category::Benchmark, &config.benchmark_pattern),
    ];

    if config.smoke {
        if let Some((category, _)) = explicit.iter().find(|(_, p)| p.is_some()) {
            return Err(HiveError::config(format!(
                "smoke mode cannot be combined with an explicit {category} pattern"
            )));
        }
        return Ok(Category::ALL
            .iter()
            .map(|c| (*c, TestFilter::Smoke))
            .collect());
    }

    let mut filters = Vec::new();
    for (category, pattern) in explicit {
        let pattern = match (category, pattern.as_deref()) {
            (Category::Validation, None) => DEFAULT_VALIDATION_PATTERN,
            (_, None) | (_, Some("")) => continue,
            (_, Some(p)) => p,
        };
        filters.push((category, TestFilter::pattern(&category.to_string(), pattern)?));
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_runs_all_validations() {
        let plan = RunPlan::from_config(&HiveConfig::default()).unwrap();
        assert_eq!(plan.categories.len(), 1);
        assert!(plan.filter(Category::Validation).is_some());
        assert!(plan.filter(Category::Simulation).is_none());
        assert_eq!(plan.timeout, Duration::from_secs(600));
        assert_eq!(plan.poll_interval, Duration::from_secs(30));
        assert_eq!(plan.runner.wait_limit, Some(Duration::from_secs(660)));
        assert!(plan.max_concurrency >= 1);
    }

    #[test]
    fn test_empty_pattern_skips_category() {
        let config = HiveConfig {
            validation_pattern: Some(String::new()),
            benchmark_pattern: Some("block".into()),
            ..HiveConfig::default()
        };
        let plan = RunPlan::from_config(&config).unwrap();
        let order: Vec<Category> = plan.categories.iter().map(|(c, _)| *c).collect();
        assert_eq!(order, vec![Category::Benchmark]);
    }

    #[test]
    fn test_smoke_selects_every_category() {
        let config = HiveConfig {
            smoke: true,
            ..HiveConfig::default()
        };
        let plan = RunPlan::from_config(&config).unwrap();
        assert_eq!(plan.categories.len(), 3);
        assert!(plan
            .categories
            .iter()
            .all(|(_, f)| matches!(f, TestFilter::Smoke)));
    }

    #[test]
    fn test_smoke_with_explicit_pattern_is_config_error() {
        let config = HiveConfig {
            smoke: true,
            simulation_pattern: Some("sync".into()),
            ..HiveConfig::default()
        };
        let err = RunPlan::from_config(&config).unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
        assert!(err.to_string().contains("simulation"));
    }

    #[test]
    fn test_invalid_inputs_rejected_up_front() {
        let bad = [
            HiveConfig {
                client_pattern: "geth(".into(),
                ..HiveConfig::default()
            },
            HiveConfig {
                no_cache: Some("[".into()),
                ..HiveConfig::default()
            },
            HiveConfig {
                overrides: "no-colon-here".into(),
                ..HiveConfig::default()
            },
            HiveConfig {
                timeout_secs: 0,
                ..HiveConfig::default()
            },
            HiveConfig {
                max_concurrency: 0,
                ..HiveConfig::default()
            },
        ];
        for config in &bad {
            assert!(
                matches!(RunPlan::from_config(config), Err(HiveError::Config(_))),
                "accepted {config:?}"
            );
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: HiveConfig =
            serde_json::from_str(r#"{"client_pattern":"geth","timeout_secs":30}"#).unwrap();
        assert_eq!(config.client_pattern, "geth");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.docker_endpoint, DEFAULT_ENDPOINT);
    }
}
