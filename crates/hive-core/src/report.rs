//! Run report and its aggregator.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::HiveResult;
use crate::runner::ExecutionResult;
use crate::selector::Category;

/// Per-client entry under `clients`: version metadata, or the build error
/// that stopped the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientEntry {
    Version(BTreeMap<String, String>),
    Error { error: String },
}

/// client → test name → result.
pub type CategoryResults = BTreeMap<String, BTreeMap<String, ExecutionResult>>;

/// The final output of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub clients: BTreeMap<String, ClientEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub validations: CategoryResults,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub simulations: CategoryResults,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub benchmarks: CategoryResults,
}

impl Report {
    /// A report holding only a client's build failure.
    pub fn client_failure(client: &str, error: &str) -> Self {
        let mut report = Report::default();
        report.clients.insert(
            client.to_string(),
            ClientEntry::Error {
                error: error.to_string(),
            },
        );
        report
    }

    pub fn category(&self, category: Category) -> &CategoryResults {
        match category {
            Category::Validation => &self.validations,
            Category::Simulation => &self.simulations,
            Category::Benchmark => &self.benchmarks,
        }
    }

    fn category_mut(&mut self, category: Category) -> &mut CategoryResults {
        match category {
            Category::Validation => &mut self.validations,
            Category::Simulation => &mut self.simulations,
            Category::Benchmark => &mut self.benchmarks,
        }
    }

    /// Look up a single result.
    pub fn result(&self, category: Category, client: &str, test: &str) -> Option<&ExecutionResult> {
        self.category(category).get(client)?.get(test)
    }

    pub fn to_json_pretty(&self) -> HiveResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Collects results from concurrent workers into one [`Report`].
#[derive(Debug, Default)]
pub struct ResultAggregator {
    report: Mutex<Report>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Report> {
        self.report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_client(&self, client: &str, version: BTreeMap<String, String>) {
        self.lock()
            .clients
            .insert(client.to_string(), ClientEntry::Version(version));
    }

    /// File one result under its category, client and test.
    pub fn record(&self, client: &str, test: &str, result: ExecutionResult) {
        self.lock()
            .category_mut(result.category)
            .entry(client.to_string())
            .or_default()
            .insert(test.to_string(), result);
    }

    pub fn snapshot(&self) -> Report {
        self.lock().clone()
    }

    pub fn finish(self) -> Report {
        self.report
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
