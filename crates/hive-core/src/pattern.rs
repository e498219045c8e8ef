//! Regex selection of clients and tests.

use regex::Regex;

use crate::error::{HiveError, HiveResult};

/// Compile a user-supplied selection pattern. `what` names the flag in errors.
pub fn compile(what: &str, pattern: &str) -> HiveResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| HiveError::config(format!("invalid {what} pattern {pattern:?}: {e}")))
}

/// The candidates matched by `pattern`, in candidate order.
pub fn select<'a, I>(pattern: &Regex, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    candidates
        .into_iter()
        .filter(|c| pattern.is_match(c))
        .cloned()
        .collect()
}
