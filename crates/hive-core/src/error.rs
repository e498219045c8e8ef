//! Error taxonomy for hive runs.
//!
//! Only configuration errors, client-level build errors and runtime errors
//! abort a run. Test failures and timeouts are captured as data inside the
//! report (see [`crate::runner::Outcome`]).

use std::fmt;

use crate::report::Report;
use crate::runtime::RuntimeError;

/// What an image build was producing when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    /// A client under test, identified by `name[:tag]`.
    Client(String),
    /// A validation, simulation or benchmark image, identified by name.
    Test(String),
    /// Internal helper images such as the DAG generator.
    Internal(String),
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTarget::Client(name) => write!(f, "client {name}"),
            BuildTarget::Test(name) => write!(f, "test {name}"),
            BuildTarget::Internal(name) => write!(f, "internal image {name}"),
        }
    }
}

/// An image failed to build.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to build {target}: {cause}")]
pub struct BuildError {
    pub target: BuildTarget,
    pub cause: String,
}

impl BuildError {
    pub fn client(name: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            target: BuildTarget::Client(name.into()),
            cause: cause.into(),
        }
    }

    pub fn test(name: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            target: BuildTarget::Test(name.into()),
            cause: cause.into(),
        }
    }

    /// The client identifier, when the failed build was a client image.
    pub fn client_name(&self) -> Option<&str> {
        match &self.target {
            BuildTarget::Client(name) => Some(name),
            _ => None,
        }
    }
}

/// Run-level errors.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("DAG generation failed: {0}")]
    Dag(String),

    #[error("execution worker failed: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HiveError {
    pub fn config(msg: impl Into<String>) -> Self {
        HiveError::Config(msg.into())
    }

    /// The minimal report emitted in place of results when a client failed
    /// to build. `None` for every other error kind.
    pub fn failure_report(&self) -> Option<Report> {
        match self {
            HiveError::Build(err) => err
                .client_name()
                .map(|client| Report::client_failure(client, &err.to_string())),
            _ => None,
        }
    }
}

/// Result type for hive operations.
pub type HiveResult<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_display_names_target() {
        let err = BuildError::client("geth:master", "exit status 1");
        assert_eq!(
            err.to_string(),
            "failed to build client geth:master: exit status 1"
        );
        assert_eq!(err.client_name(), Some("geth:master"));

        let err = BuildError::test("smoke/genesis", "no Dockerfile");
        assert!(err.to_string().contains("test smoke/genesis"));
        assert!(err.client_name().is_none());
    }

    #[test]
    fn test_failure_report_only_for_client_builds() {
        let err = HiveError::from(BuildError::client("geth", "boom"));
        let report = err.failure_report().expect("client failure report");
        assert_eq!(report.clients.len(), 1);

        let err = HiveError::from(BuildError::test("t1", "boom"));
        assert!(err.failure_report().is_none());

        assert!(HiveError::config("bad regex").failure_report().is_none());
    }
}
