//! Structured lifecycle events for hive runs.
//!
//! Every event carries an `event` field with a stable dotted name so log
//! pipelines can filter on it regardless of message wording.

use tracing::{info, warn};

use crate::selector::Category;

pub fn emit_daemon_online(endpoint: &str, version: &str) {
    info!(event = "daemon.online", endpoint = %endpoint, version = %version);
}

pub fn emit_image_built(image: &str, no_cache: bool, success: bool) {
    if success {
        info!(event = "image.built", image = %image, no_cache = no_cache);
    } else {
        warn!(event = "image.build_failed", image = %image, no_cache = no_cache);
    }
}

pub fn emit_client_resolved(client: &str, image: &str) {
    info!(event = "client.resolved", client = %client, image = %image);
}

pub fn emit_container_started(container: &str, image: &str) {
    info!(event = "container.started", container = %container, image = %image);
}

/// Warning level: the watchdog had to kill a container.
pub fn emit_container_timed_out(container: &str, elapsed_ms: u64) {
    warn!(event = "container.timed_out", container = %container, elapsed_ms = elapsed_ms);
}

pub fn emit_execution_finished(client: &str, test: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "execution.finished",
        client = %client,
        test = %test,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

pub fn emit_category_finished(category: Category, executions: usize, passed: usize) {
    info!(
        event = "category.finished",
        %category,
        executions = executions,
        passed = passed,
    );
}
