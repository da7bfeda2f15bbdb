//! npm registry client.
//!
//! Two seams are exposed as traits so the resolver and the fetch pipeline
//! can run against in-memory fakes: [`Registry`] answers metadata queries,
//! [`ArtifactFetcher`] downloads tarball bytes. [`RegistryClient`]
//! implements both over HTTP.

use super::error::{codes, PkgError};
use super::integrity::Integrity;
use super::npmrc::{load_npmrc_files, NpmrcConfig};
use super::spec::{encode_name, PackageSpec};
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override registry URL.
pub const REGISTRY_ENV: &str = "HYPERPM_REGISTRY";

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Abbreviated metadata is much smaller and carries everything resolution needs.
const ACCEPT_METADATA: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Download timeout in seconds.
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Where to download a version and what it must hash to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Tarball URL.
    pub url: String,
    /// Expected integrity (SRI string).
    pub integrity: String,
}

/// One published version of a package.
#[derive(Debug, Clone)]
pub struct PackageVersion {
    pub name: String,
    pub version: Version,
    /// Required dependencies, sorted by name.
    pub dependencies: Vec<PackageSpec>,
    /// Dependencies whose absence is tolerated.
    pub optional_dependencies: Vec<PackageSpec>,
    /// Dependencies that must be provided by the parent scope.
    pub peer_dependencies: Vec<PackageSpec>,
    /// Peer names marked optional in `peerDependenciesMeta`.
    pub optional_peers: BTreeSet<String>,
    pub artifact: ArtifactRef,
}

/// Everything the registry knows about one package name.
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    pub name: String,
    pub versions: BTreeMap<Version, PackageVersion>,
    pub dist_tags: BTreeMap<String, Version>,
}

impl PackageMetadata {
    /// Build metadata from a packument JSON document.
    ///
    /// Versions that are not valid semver or have no tarball are skipped, as
    /// are dependency entries with invalid names.
    ///
    /// # Errors
    /// Returns an error if the document is not a packument.
    pub fn from_packument(name: &str, packument: Value) -> Result<Self, PkgError> {
        let raw: Packument = serde_json::from_value(packument)?;

        let mut versions = BTreeMap::new();
        for (key, entry) in raw.versions {
            let Ok(version) = Version::parse(&key) else {
                debug!(package = name, version = %key, "skipping non-semver version");
                continue;
            };
            let Some(artifact) = entry.dist.as_ref().and_then(Dist::artifact) else {
                debug!(package = name, version = %key, "skipping version without tarball");
                continue;
            };

            let optional = specs(name, &entry.optional_dependencies);
            let optional_names: BTreeSet<&str> =
                optional.iter().map(|s| s.name.as_str()).collect();
            let dependencies = specs(name, &entry.dependencies)
                .into_iter()
                .filter(|s| !optional_names.contains(s.name.as_str()))
                .collect();

            let optional_peers = entry
                .peer_dependencies_meta
                .iter()
                .filter(|(_, meta)| meta.get("optional").and_then(Value::as_bool) == Some(true))
                .map(|(peer, _)| peer.clone())
                .collect();

            versions.insert(
                version.clone(),
                PackageVersion {
                    name: name.to_string(),
                    version,
                    dependencies,
                    peer_dependencies: specs(name, &entry.peer_dependencies),
                    optional_dependencies: optional,
                    optional_peers,
                    artifact,
                },
            );
        }

        let dist_tags = raw
            .dist_tags
            .into_iter()
            .filter_map(|(tag, v)| Some((tag, Version::parse(v.as_str()?).ok()?)))
            .collect();

        Ok(Self {
            name: name.to_string(),
            versions,
            dist_tags,
        })
    }

    /// Look up an exact version.
    #[must_use]
    pub fn get(&self, version: &Version) -> Option<&PackageVersion> {
        self.versions.get(version)
    }

    /// Version a dist-tag points at.
    #[must_use]
    pub fn tag(&self, tag: &str) -> Option<&Version> {
        self.dist_tags.get(tag)
    }
}

fn specs(owner: &str, map: &BTreeMap<String, Value>) -> Vec<PackageSpec> {
    map.iter()
        .filter_map(|(dep, range)| {
            let range = range.as_str()?;
            match PackageSpec::new(dep, range) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    debug!(package = owner, dependency = %dep, error = %e, "ignoring dependency");
                    None
                }
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct Packument {
    #[serde(rename = "dist-tags", default)]
    dist_tags: BTreeMap<String, Value>,
    #[serde(default)]
    versions: BTreeMap<String, PackumentVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackumentVersion {
    #[serde(default, deserialize_with = "object_or_empty")]
    dependencies: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "object_or_empty")]
    optional_dependencies: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "object_or_empty")]
    peer_dependencies: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "object_or_empty")]
    peer_dependencies_meta: BTreeMap<String, Value>,
    dist: Option<Dist>,
}

#[derive(Deserialize)]
struct Dist {
    tarball: Option<String>,
    integrity: Option<String>,
    shasum: Option<String>,
}

impl Dist {
    fn artifact(&self) -> Option<ArtifactRef> {
        let url = self.tarball.clone()?;
        let integrity = self
            .integrity
            .clone()
            .filter(|sri| Integrity::parse(sri).is_some())
            .or_else(|| {
                self.shasum
                    .as_deref()
                    .and_then(Integrity::from_sha1_hex)
                    .map(|i| i.to_string())
            })
            .or_else(|| self.integrity.clone())
            .unwrap_or_default();
        Some(ArtifactRef { url, integrity })
    }
}

/// Old packuments contain arrays or strings where objects belong.
fn object_or_empty<'de, D>(de: D) -> Result<BTreeMap<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(de)? {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    })
}

/// Source of package metadata.
#[allow(async_fn_in_trait)]
pub trait Registry: Send + Sync {
    /// All published versions of `name`.
    ///
    /// # Errors
    /// `PKG_NOT_FOUND` if the package does not exist, `PKG_REGISTRY_ERROR`
    /// for transport failures.
    async fn get_versions(&self, name: &str) -> Result<Arc<PackageMetadata>, PkgError>;

    /// Download location and expected integrity for a version.
    fn artifact_location(&self, version: &PackageVersion) -> ArtifactRef {
        version.artifact.clone()
    }
}

/// Failure class of a download attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Worth retrying: connection errors, timeouts, 5xx, 429.
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help: other 4xx, oversized bodies, bad URLs.
    #[error("{0}")]
    Permanent(String),
}

/// Downloads artifact bytes.
#[allow(async_fn_in_trait)]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch the full body at `url`.
    ///
    /// # Errors
    /// Classifies failures as transient or permanent.
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError>;
}

type MetadataCell = Arc<OnceCell<Arc<PackageMetadata>>>;

/// HTTP registry client with a per-process metadata memo.
#[derive(Debug)]
pub struct RegistryClient {
    base_url: Url,
    npmrc: NpmrcConfig,
    http: Client,
    max_tarball_bytes: u64,
    memo: Mutex<HashMap<String, MetadataCell>>,
    metadata_requests: AtomicU64,
    tarball_requests: AtomicU64,
}

impl RegistryClient {
    /// Create a new registry client with the given base URL.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)
        } else {
            Url::parse(&format!("{base_url}/"))
        }
        .map_err(|e| PkgError::registry(format!("Invalid registry URL '{base_url}': {e}")))?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("hyperpm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PkgError::registry(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            npmrc: NpmrcConfig::default(),
            http,
            max_tarball_bytes: MAX_TARBALL_SIZE,
            memo: Mutex::new(HashMap::new()),
            metadata_requests: AtomicU64::new(0),
            tarball_requests: AtomicU64::new(0),
        })
    }

    /// Create a client for a project.
    ///
    /// Registry URL precedence: `HYPERPM_REGISTRY`, then `registry=` from
    /// `.npmrc`, then the public npm registry.
    ///
    /// # Errors
    /// Returns an error if the client cannot be created.
    pub fn for_project(project_dir: &Path) -> Result<Self, PkgError> {
        let npmrc = load_npmrc_files(project_dir);
        let url = std::env::var(REGISTRY_ENV)
            .ok()
            .or_else(|| npmrc.registry.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        debug!(registry = %url, "using registry");
        Ok(Self::new(&url)?.with_npmrc(npmrc))
    }

    /// Use scoped registries and auth tokens from `.npmrc`.
    #[must_use]
    pub fn with_npmrc(mut self, npmrc: NpmrcConfig) -> Self {
        self.npmrc = npmrc;
        self
    }

    /// Override the tarball size limit.
    #[must_use]
    pub fn with_max_tarball_bytes(mut self, max: u64) -> Self {
        self.max_tarball_bytes = max;
        self
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of metadata documents fetched over the network.
    #[must_use]
    pub fn metadata_requests(&self) -> u64 {
        self.metadata_requests.load(Ordering::Relaxed)
    }

    /// Number of tarball downloads attempted over the network.
    #[must_use]
    pub fn tarball_requests(&self) -> u64 {
        self.tarball_requests.load(Ordering::Relaxed)
    }

    /// Fetch the packument (package metadata) for a package.
    ///
    /// # Errors
    /// Returns an error if the request fails or the package is not found.
    pub async fn fetch_packument(&self, name: &str) -> Result<Value, PkgError> {
        let registry = self.npmrc.registry_for(name, &self.base_url);
        let url = registry
            .join(&encode_name(name))
            .map_err(|e| PkgError::registry(format!("Failed to build URL for '{name}': {e}")))?;

        self.metadata_requests.fetch_add(1, Ordering::Relaxed);
        debug!(package = name, url = %url, "fetching metadata");

        let mut request = self.http.get(url.as_str()).header("Accept", ACCEPT_METADATA);
        if let Some(token) = self.npmrc.auth_token_for(&url) {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }

        if !response.status().is_success() {
            return Err(PkgError::registry(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

impl Registry for RegistryClient {
    async fn get_versions(&self, name: &str) -> Result<Arc<PackageMetadata>, PkgError> {
        let cell = {
            let mut memo = self.memo.lock().await;
            Arc::clone(memo.entry(name.to_string()).or_default())
        };

        // Concurrent callers for one name share a single request
        let metadata = cell
            .get_or_try_init(|| async {
                let packument = self.fetch_packument(name).await?;
                PackageMetadata::from_packument(name, packument).map(Arc::new)
            })
            .await?;

        Ok(Arc::clone(metadata))
    }
}

impl ArtifactFetcher for RegistryClient {
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::Permanent(format!("invalid tarball URL: {e}")))?;

        self.tarball_requests.fetch_add(1, Ordering::Relaxed);

        let mut request = self
            .http
            .get(parsed.as_str())
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS));
        if let Some(token) = self.npmrc.auth_token_for(&parsed) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                TransportError::Permanent(e.to_string())
            } else {
                TransportError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TransportError::Permanent(format!("HTTP {status}")));
        }

        let max_bytes = self.max_tarball_bytes;
        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(TransportError::Permanent(format!(
                    "Tarball too large: {len} bytes (max: {max_bytes})"
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Transient(format!("Failed to read response body: {e}")))?;

        if bytes.len() as u64 > max_bytes {
            return Err(TransportError::Permanent(format!(
                "Tarball too large: {} bytes (max: {max_bytes})",
                bytes.len()
            )));
        }

        Ok(bytes)
    }
}

/// Whether a registry error means the package does not exist.
#[must_use]
pub fn is_not_found(err: &PkgError) -> bool {
    err.code() == codes::PKG_NOT_FOUND
}
