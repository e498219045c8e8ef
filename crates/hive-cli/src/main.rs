//! Hive - end-to-end test harness for Ethereum clients
//!
//! Builds the selected clients, runs the selected validators, simulators
//! and benchmarks against them in containers, and prints a JSON report on
//! stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, Level};

use hive_core::config::default_concurrency;
use hive_core::runtime::docker::DEFAULT_ENDPOINT;
use hive_core::{DockerCli, Hive, HiveConfig, RunPlan};

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ethereum client test harness", long_about = None)]
struct Cli {
    /// Directory holding clients/, validators/, simulators/ and benchmarks/
    #[arg(long, env = "HIVE_ROOT", default_value = ".")]
    root: PathBuf,

    /// Scratch directory for generated artifacts
    #[arg(long, env = "HIVE_WORKSPACE", default_value = "workspace")]
    workspace: PathBuf,

    /// Docker daemon endpoint
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_ENDPOINT)]
    docker_endpoint: String,

    /// Regexp of image names to build without the layer cache
    #[arg(long = "docker-nocache")]
    docker_nocache: Option<String>,

    /// Regexp selecting the client(s) to test
    #[arg(long, default_value = ":master")]
    client: String,

    /// Comma separated regexp:file pairs replacing files in test images
    #[arg(long = "override", default_value = "")]
    overrides: String,

    /// Run only the smoke tests of every category
    #[arg(long)]
    smoke: bool,

    /// Regexp selecting the validation tests (default: all, empty: none)
    #[arg(long)]
    test: Option<String>,

    /// Regexp selecting the simulation tests
    #[arg(long)]
    sim: Option<String>,

    /// Regexp selecting the benchmark tests
    #[arg(long)]
    bench: Option<String>,

    /// Maximum run time of a single test container, in minutes
    #[arg(long = "docker-timeout", default_value_t = 10)]
    docker_timeout: u64,

    /// How often the watchdog checks for overdue containers, in seconds
    #[arg(long = "timeout-check", default_value_t = 30)]
    timeout_check: u64,

    /// Number of test containers allowed to run at once
    #[arg(long, short = 'j')]
    parallelism: Option<usize>,

    /// Host of the service under test, passed to test containers
    #[arg(long)]
    service_host: Option<String>,

    /// Port of the service under test, passed to test containers
    #[arg(long)]
    service_port: Option<u16>,

    /// Lines of container output kept per result
    #[arg(long, default_value_t = 100)]
    log_tail: usize,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn config(&self) -> HiveConfig {
        HiveConfig {
            root: self.root.clone(),
            workspace: self.workspace.clone(),
            docker_endpoint: self.docker_endpoint.clone(),
            client_pattern: self.client.clone(),
            validation_pattern: self.test.clone(),
            simulation_pattern: self.sim.clone(),
            benchmark_pattern: self.bench.clone(),
            smoke: self.smoke,
            overrides: self.overrides.clone(),
            no_cache: self.docker_nocache.clone(),
            timeout_secs: self.docker_timeout.saturating_mul(60),
            poll_interval_secs: self.timeout_check,
            max_concurrency: self.parallelism.unwrap_or_else(default_concurrency),
            service_host: self.service_host.clone(),
            service_port: self.service_port,
            log_tail_lines: self.log_tail,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    hive_core::init_tracing(cli.json, level);

    let plan = RunPlan::from_config(&cli.config()).context("invalid configuration")?;
    let runtime = Arc::new(DockerCli::new(plan.docker_endpoint.clone()));
    let hive = Hive::new(plan, runtime);

    match hive.run().await {
        Ok(report) => {
            println!("{}", report.to_json_pretty()?);
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.failure_report() {
                error!(error = %e, "client build failed");
                println!("{}", report.to_json_pretty()?);
            }
            Err(e).context("hive run failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_map_onto_config() {
        let cli = Cli::try_parse_from([
            "hive",
            "--client",
            "geth",
            "--test",
            "",
            "--sim",
            "sync",
            "--docker-timeout",
            "2",
            "--timeout-check",
            "5",
            "-j",
            "4",
            "--override",
            "t1:/tmp/genesis.json",
        ])
        .unwrap();
        let config = cli.config();
        assert_eq!(config.client_pattern, "geth");
        assert_eq!(config.validation_pattern.as_deref(), Some(""));
        assert_eq!(config.simulation_pattern.as_deref(), Some("sync"));
        assert_eq!(config.timeout_secs, 120);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.overrides, "t1:/tmp/genesis.json");
    }

    #[test]
    fn test_defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["hive"]).unwrap();
        let config = cli.config();
        let defaults = HiveConfig::default();
        assert_eq!(config.client_pattern, defaults.client_pattern);
        assert_eq!(config.timeout_secs, defaults.timeout_secs);
        assert_eq!(config.poll_interval_secs, defaults.poll_interval_secs);
        assert_eq!(config.log_tail_lines, defaults.log_tail_lines);
        assert!(config.validation_pattern.is_none());
    }
}
