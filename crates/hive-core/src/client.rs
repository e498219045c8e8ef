//! Client resolution: pattern → built client images with version metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{BuildError, HiveError, HiveResult};
use crate::image::{BuildContext, ImageStore};
use crate::obs;
use crate::pattern;
use crate::runtime::{ContainerLease, ImageRef, RunSpec, RuntimeError};

/// Directory under the hive root holding one build context per client.
pub const CLIENTS_DIR: &str = "clients";

/// File inside every client image describing the build (repo, branch, commit).
pub const VERSION_FILE: &str = "/version.json";

/// A client under test. Immutable once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSpec {
    /// `name[:tag]`, the client's directory name.
    pub name: String,
    pub context: BuildContext,
    pub image: Option<ImageRef>,
    pub version: BTreeMap<String, String>,
}

impl ClientSpec {
    pub fn image_tag(&self) -> String {
        client_image_tag(&self.name)
    }
}

pub fn client_image_tag(name: &str) -> String {
    format!("hive/{CLIENTS_DIR}/{name}")
}

fn list_clients(dir: &Path) -> HiveResult<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().join("Dockerfile").is_file() {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Expands a client pattern into built [`ClientSpec`]s.
pub struct ClientResolver {
    root: PathBuf,
    images: Arc<ImageStore>,
}

impl ClientResolver {
    pub fn new(root: impl Into<PathBuf>, images: Arc<ImageStore>) -> Self {
        Self {
            root: root.into(),
            images,
        }
    }

    /// Names of every client directory that holds a `Dockerfile`, sorted.
    pub async fn discover(&self) -> HiveResult<Vec<String>> {
        let dir = self.root.join(CLIENTS_DIR);
        tokio::task::spawn_blocking(move || list_clients(&dir))
            .await
            .map_err(|e| HiveError::Worker(e.to_string()))?
    }

    /// Build every client matching `pattern` and read its version metadata.
    ///
    /// Stops at the first client whose image fails to build: no partial
    /// client set is ever returned.
    pub async fn resolve(&self, pattern: &Regex) -> HiveResult<Vec<ClientSpec>> {
        let names = pattern::select(pattern, &self.discover().await?);
        if names.is_empty() {
            warn!(pattern = pattern.as_str(), "client pattern matched no clients");
        }

        let mut clients = Vec::with_capacity(names.len());
        for name in names {
            let context = BuildContext::new(self.root.join(CLIENTS_DIR).join(&name));
            let tag = client_image_tag(&name);
            let image = match self.images.ensure(&tag, &context).await {
                Ok(image) => image,
                Err(RuntimeError::BuildFailed { output, .. }) => {
                    return Err(BuildError::client(name, output).into());
                }
                Err(e) => return Err(HiveError::Runtime(e)),
            };
            let version = self.probe_version(&name, &image).await?;
            obs::emit_client_resolved(&name, image.as_str());
            clients.push(ClientSpec {
                name,
                context,
                image: Some(image),
                version,
            });
        }
        Ok(clients)
    }

    /// Start the client image just long enough to read its version file.
    async fn probe_version(
        &self,
        name: &str,
        image: &ImageRef,
    ) -> HiveResult<BTreeMap<String, String>> {
        let runtime = Arc::clone(self.images.runtime());
        let handle = runtime.run(image, &RunSpec::default()).await?;
        let lease = ContainerLease::new(Arc::clone(&runtime), handle);

        let copied = runtime.copy_from(lease.handle(), VERSION_FILE).await;
        lease.release().await?;

        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(RuntimeError::FileNotFound { .. }) => {
                warn!(client = name, "client image has no {VERSION_FILE}");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(parse_version(name, &bytes))
    }
}

/// Flatten a version document into strings. Malformed documents yield an
/// empty map.
fn parse_version(client: &str, bytes: &[u8]) -> BTreeMap<String, String> {
    match serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(bytes) {
        Ok(doc) => doc
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        Err(e) => {
            warn!(client, error = %e, "malformed version metadata");
            debug!(client, raw = %String::from_utf8_lossy(bytes));
            BTreeMap::new()
        }
    }
}
