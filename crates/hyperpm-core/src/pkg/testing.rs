//! In-memory registry used by unit tests.

use super::error::PkgError;
use super::integrity::{HashAlgorithm, Integrity};
use super::registry::{
    ArtifactFetcher, ArtifactRef, PackageMetadata, PackageVersion, Registry, TransportError,
};
use super::spec::PackageSpec;
use super::tarball::tests::make_tgz;
use bytes::Bytes;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves metadata and tarballs from memory and counts requests.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    packages: BTreeMap<String, PackageMetadata>,
    tarballs: HashMap<String, Bytes>,
    failures: HashMap<String, TransportError>,
    delays: HashMap<String, Duration>,
    metadata_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

pub(crate) fn spec(name: &str, range: &str) -> PackageSpec {
    PackageSpec::new(name, range).unwrap()
}

impl FakeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish `name@version` with the given dependencies and a real tarball.
    pub(crate) fn publish(
        &mut self,
        name: &str,
        version: &str,
        deps: &[(&str, &str)],
    ) -> &mut PackageVersion {
        let version = Version::parse(version).unwrap();
        let manifest = format!(r#"{{"name":"{name}","version":"{version}"}}"#);
        let main = format!("module.exports = '{name}@{version}';");
        let tgz = make_tgz(&[
            ("package/package.json", manifest.as_bytes()),
            ("package/index.js", main.as_bytes()),
        ]);
        let basename = name.rsplit('/').next().unwrap_or(name);
        let url = format!("https://registry.test/{name}/-/{basename}-{version}.tgz");
        let integrity = Integrity::compute(HashAlgorithm::Sha512, &tgz).to_string();
        self.tarballs.insert(url.clone(), Bytes::from(tgz));

        let meta = self
            .packages
            .entry(name.to_string())
            .or_insert_with(|| PackageMetadata {
                name: name.to_string(),
                versions: BTreeMap::new(),
                dist_tags: BTreeMap::new(),
            });
        if version.pre.is_empty() && meta.dist_tags.get("latest").map_or(true, |v| *v < version) {
            meta.dist_tags.insert("latest".to_string(), version.clone());
        }
        meta.versions.insert(
            version.clone(),
            PackageVersion {
                name: name.to_string(),
                version: version.clone(),
                dependencies: deps.iter().map(|(n, r)| spec(n, r)).collect(),
                optional_dependencies: Vec::new(),
                peer_dependencies: Vec::new(),
                optional_peers: BTreeSet::new(),
                artifact: ArtifactRef { url, integrity },
            },
        );
        meta.versions.get_mut(&version).unwrap()
    }

    /// Point a dist-tag at a version.
    pub(crate) fn tag(&mut self, name: &str, tag: &str, version: &str) {
        self.packages
            .get_mut(name)
            .unwrap()
            .dist_tags
            .insert(tag.to_string(), Version::parse(version).unwrap());
    }

    /// Make every download of `name@version` fail with `error`.
    pub(crate) fn fail_tarball(&mut self, name: &str, version: &str, error: TransportError) {
        let url = self.version(name, version).artifact.url.clone();
        self.failures.insert(url, error);
    }

    /// Serve different bytes than the published integrity describes.
    pub(crate) fn tamper_tarball(&mut self, name: &str, version: &str) {
        let url = self.version(name, version).artifact.url.clone();
        let evil = make_tgz(&[("package/index.js", b"tampered")]);
        self.tarballs.insert(url, Bytes::from(evil));
    }

    /// Delay metadata answers for `name`.
    pub(crate) fn delay(&mut self, name: &str, delay: Duration) {
        self.delays.insert(name.to_string(), delay);
    }

    pub(crate) fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// URLs downloaded so far, in request order.
    pub(crate) fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    fn version(&self, name: &str, version: &str) -> &PackageVersion {
        self.packages[name]
            .get(&Version::parse(version).unwrap())
            .unwrap()
    }
}

impl Registry for FakeRegistry {
    async fn get_versions(&self, name: &str) -> Result<Arc<PackageMetadata>, PkgError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }
        self.packages
            .get(name)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| PkgError::not_found(name))
    }
}

impl ArtifactFetcher for FakeRegistry {
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(url.to_string());
        if let Some(error) = self.failures.get(url) {
            return Err(error.clone());
        }
        self.tarballs
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::Permanent("HTTP 404 Not Found".to_string()))
    }
}
