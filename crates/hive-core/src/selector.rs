//! Test discovery and selection.
//!
//! Tests live under `<root>/<validators|simulators|benchmarks>/`; any
//! directory below a category root that holds a `Dockerfile` is a test, named
//! by its `/`-separated path relative to the category root.

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{HiveError, HiveResult};
use crate::image::BuildContext;
use crate::overrides::OverrideRule;
use crate::pattern;

/// Prefix of the restricted test subtree used in smoke mode.
pub const SMOKE_PREFIX: &str = "smoke/";

/// The three classes of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Validation,
    Simulation,
    Benchmark,
}

impl Category {
    /// Execution order within a run.
    pub const ALL: [Category; 3] = [
        Category::Validation,
        Category::Simulation,
        Category::Benchmark,
    ];

    /// Directory holding this category's tests, relative to the hive root.
    pub fn dir(&self) -> &'static str {
        match self {
            Category::Validation => "validators",
            Category::Simulation => "simulators",
            Category::Benchmark => "benchmarks",
        }
    }

    pub fn image_tag(&self, test_name: &str) -> String {
        format!("hive/{}/{}", self.dir(), test_name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Validation => write!(f, "validation"),
            Category::Simulation => write!(f, "simulation"),
            Category::Benchmark => write!(f, "benchmark"),
        }
    }
}

/// A selected test, immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub category: Category,
    pub name: String,
    pub context: BuildContext,
}

impl TestCase {
    pub fn image_tag(&self) -> String {
        self.category.image_tag(&self.name)
    }
}

/// How tests of one category are chosen.
#[derive(Debug, Clone)]
pub enum TestFilter {
    /// Tests whose name matches the regex.
    Pattern(Regex),
    /// Only tests in the smoke subtree.
    Smoke,
}

impl TestFilter {
    pub fn pattern(what: &str, pattern: &str) -> HiveResult<Self> {
        pattern::compile(what, pattern).map(TestFilter::Pattern)
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            TestFilter::Pattern(re) => re.is_match(name),
            TestFilter::Smoke => name.starts_with(SMOKE_PREFIX),
        }
    }
}

/// Expands test filters into [`TestCase`]s.
#[derive(Debug, Clone)]
pub struct TestSelector {
    root: PathBuf,
    overrides: Vec<OverrideRule>,
}

impl TestSelector {
    pub fn new(root: impl Into<PathBuf>, overrides: Vec<OverrideRule>) -> Self {
        Self {
            root: root.into(),
            overrides,
        }
    }

    fn category_root(&self, category: Category) -> PathBuf {
        self.root.join(category.dir())
    }

    /// All test names under a category, sorted. A missing category
    /// directory simply has no tests.
    pub fn discover(&self, category: Category) -> HiveResult<Vec<String>> {
        let root = self.category_root(category);
        if !root.is_dir() {
            debug!(%category, root = %root.display(), "no test directory");
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| HiveError::Io(std::io::Error::other(e)))?;
            if entry.file_type().is_dir() && entry.path().join("Dockerfile").is_file() {
                names.push(test_name(&root, entry.path()));
            }
        }
        names.sort();
        Ok(names)
    }

    /// The tests of `category` accepted by `filter`, with the override rules
    /// that apply to each attached to its build context.
    pub fn select(&self, category: Category, filter: &TestFilter) -> HiveResult<Vec<TestCase>> {
        let root = self.category_root(category);
        let cases = self
            .discover(category)?
            .into_iter()
            .filter(|name| filter.matches(name))
            .map(|name| {
                let overrides = self
                    .overrides
                    .iter()
                    .filter(|rule| rule.applies_to(&name))
                    .cloned()
                    .collect();
                TestCase {
                    category,
                    context: BuildContext::new(root.join(&name)).with_overrides(overrides),
                    name,
                }
            })
            .collect::<Vec<_>>();
        debug!(%category, selected = cases.len(), "tests selected");
        Ok(cases)
    }
}

fn test_name(root: &Path, dir: &Path) -> String {
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
