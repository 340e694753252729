//! Sources of dogu descriptors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ces_core::{DoguDescriptor, DoguVersion};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("dogu {name} not found in registry")]
    NotFound { name: String },
    #[error("dogu {name} has no version {version}")]
    VersionNotFound { name: String, version: String },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing descriptor {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("descriptor {} declares {found}, expected {expected}", path.display())]
    Mismatch { path: PathBuf, expected: String, found: String },
}

/// Looks up descriptors by qualified dogu name.
#[async_trait::async_trait]
pub trait DoguRegistry: Send + Sync {
    async fn get_latest(&self, name: &str) -> Result<DoguDescriptor, RegistryError>;
    async fn get(&self, name: &str, version: &str) -> Result<DoguDescriptor, RegistryError>;
}

/// Highest parseable version among `versions`; unparseable entries are ignored.
fn latest<'a>(versions: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    versions
        .filter_map(|v| v.parse::<DoguVersion>().ok().map(|p| (p, v)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v)
}

fn same_version(a: &str, b: &str) -> bool {
    match (a.parse::<DoguVersion>(), b.parse::<DoguVersion>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// In-memory registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    dogus: BTreeMap<String, Vec<DoguDescriptor>>,
}

impl StaticRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, d: DoguDescriptor) { self.dogus.entry(d.name.clone()).or_default().push(d); }

    pub fn with(mut self, d: DoguDescriptor) -> Self {
        self.insert(d);
        self
    }
}

impl FromIterator<DoguDescriptor> for StaticRegistry {
    fn from_iter<I: IntoIterator<Item = DoguDescriptor>>(iter: I) -> Self {
        let mut r = Self::new();
        for d in iter {
            r.insert(d);
        }
        r
    }
}

#[async_trait::async_trait]
impl DoguRegistry for StaticRegistry {
    async fn get_latest(&self, name: &str) -> Result<DoguDescriptor, RegistryError> {
        let all = self.dogus.get(name).ok_or_else(|| RegistryError::NotFound { name: name.to_string() })?;
        let v = latest(all.iter().map(|d| d.version.as_str())).ok_or_else(|| RegistryError::NotFound { name: name.to_string() })?;
        self.get(name, v).await
    }

    async fn get(&self, name: &str, version: &str) -> Result<DoguDescriptor, RegistryError> {
        self.dogus
            .get(name)
            .and_then(|all| all.iter().find(|d| same_version(&d.version, version)))
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound { name: name.to_string(), version: version.to_string() })
    }
}

/// Descriptors on disk under `<root>/<namespace>/<name>/<version>.json`.
#[derive(Debug, Clone)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }


    fn dogu_dir(&self, name: &str) -> PathBuf { self.root.join(name) }

    async fn versions(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        let dir = self.dogu_dir(name);
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound { name: name.to_string() })
            }
            Err(source) => return Err(RegistryError::Io { path: dir, source }),
        };
        let mut out = Vec::new();
        loop {
            match rd.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            out.push(stem.to_string());
                        }
                    }
                }
                Ok(None) => break,
                Err(source) => return Err(RegistryError::Io { path: dir, source }),
            }
        }
        Ok(out)
    }

    async fn read(&self, name: &str, version: &str) -> Result<DoguDescriptor, RegistryError> {
        let path = self.dogu_dir(name).join(format!("{}.json", version));
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::VersionNotFound { name: name.to_string(), version: version.to_string() })
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };
        let d: DoguDescriptor = serde_json::from_slice(&bytes).map_err(|source| RegistryError::Parse { path: path.clone(), source })?;
        if d.name != name {
            return Err(RegistryError::Mismatch { path, expected: name.to_string(), found: d.name });
        }
        debug!(dogu = %d.name, version = %d.version, path = %path.display(), "descriptor loaded");
        Ok(d)
    }
}

#[async_trait::async_trait]
impl DoguRegistry for DirRegistry {
    async fn get_latest(&self, name: &str) -> Result<DoguDescriptor, RegistryError> {
        let versions = self.versions(name).await?;
        let v = latest(versions.iter().map(String::as_str)).ok_or_else(|| RegistryError::NotFound { name: name.to_string() })?;
        self.read(name, v).await
    }

    async fn get(&self, name: &str, version: &str) -> Result<DoguDescriptor, RegistryError> { self.read(name, version).await }
}
