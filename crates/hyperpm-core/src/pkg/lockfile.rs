//! Lockfile types for deterministic package installation.
//!
//! The lockfile records the exact tree an install produced: every placed
//! package keyed by its install path, with version, integrity and the
//! install path each of its dependencies resolved to.
//!
//! ## File Format
//!
//! The lockfile is a JSON file named `hyperpm.lock`:
//!
//! ```json
//! {
//!   "lockfile_version": 1,
//!   "root": { "name": "my-project", "version": "1.0.0" },
//!   "dependencies": {
//!     "lib": { "range": "^1.0.0", "kind": "prod", "resolved": "node_modules/lib" }
//!   },
//!   "packages": {
//!     "node_modules/lib": {
//!       "name": "lib",
//!       "version": "1.2.0",
//!       "integrity": "sha512-...",
//!       "resolved": "https://registry.npmjs.org/lib/-/lib-1.2.0.tgz",
//!       "dependencies": { "util": "node_modules/util" }
//!     }
//!   }
//! }
//! ```
//!
//! There is no timestamp, so an unchanged tree always serializes to the
//! same bytes.

use super::graph::{install_path_for, DependencyGraph, NodeId};
use super::manifest::{DependencyKind, RootDependency};
use super::registry::ArtifactRef;
use super::spec::PackageSpec;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Schema version for the lockfile format.
///
/// Changes to this version indicate breaking changes to the format.
pub const PKG_LOCK_SCHEMA_VERSION: u32 = 1;

/// Lockfile filename.
pub const LOCKFILE_NAME: &str = "hyperpm.lock";

/// Lockfile error codes.
pub mod codes {
    /// Lockfile not found at the expected path.
    pub const PKG_LOCK_NOT_FOUND: &str = "PKG_LOCK_NOT_FOUND";
    /// Lockfile has invalid JSON.
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    /// Lockfile schema version mismatch.
    pub const PKG_LOCK_VERSION_MISMATCH: &str = "PKG_LOCK_VERSION_MISMATCH";
    /// A package entry is malformed or sits at the wrong path.
    pub const PKG_LOCK_INVALID_ENTRY: &str = "PKG_LOCK_INVALID_ENTRY";
    /// An edge points at a path with no package entry.
    pub const PKG_LOCK_PACKAGE_MISSING: &str = "PKG_LOCK_PACKAGE_MISSING";
    /// Lockfile write failed.
    pub const PKG_LOCK_WRITE_FAILED: &str = "PKG_LOCK_WRITE_FAILED";
    /// Lockfile is out of date (package.json changed).
    pub const PKG_LOCK_STALE: &str = "PKG_LOCK_STALE";
}

/// Information about the root package (from package.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRoot {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl LockRoot {
    #[must_use]
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Metadata about the lockfile itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LockMeta {
    /// Version of hyperpm that generated this lockfile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyperpm_version: Option<String>,
}

/// A declared dependency of the root package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDep {
    /// The range as written in package.json.
    pub range: String,
    pub kind: DependencyKind,
    /// Install path of the selected package (a key in `packages`).
    /// Absent for optional dependencies that could not be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
}

impl LockDep {
    #[must_use]
    pub fn new(range: impl Into<String>, kind: DependencyKind, resolved: Option<String>) -> Self {
        Self {
            range: range.into(),
            kind,
            resolved,
        }
    }
}

/// A locked package placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPackage {
    pub name: String,
    pub version: String,
    /// Subresource integrity hash (e.g., "sha512-...").
    pub integrity: String,
    /// Tarball URL.
    pub resolved: String,
    /// Dependency name to the install path it resolved to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

impl LockPackage {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        integrity: impl Into<String>,
        resolved: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            integrity: integrity.into(),
            resolved: resolved.into(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Add a dependency edge.
    pub fn add_dependency(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.dependencies.insert(name.into(), path.into());
    }
}

/// The complete lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub lockfile_version: u32,
    #[serde(default, skip_serializing_if = "is_default_meta")]
    pub meta: LockMeta,
    pub root: LockRoot,
    /// Root-level dependencies. `BTreeMap` keeps output ordering stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, LockDep>,
    /// All placed packages keyed by install path.
    #[serde(default)]
    pub packages: BTreeMap<String, LockPackage>,
}

fn is_default_meta(m: &LockMeta) -> bool {
    m.hyperpm_version.is_none()
}

impl Lockfile {
    /// Create a new empty lockfile.
    #[must_use]
    pub fn new(root: LockRoot) -> Self {
        Self {
            lockfile_version: PKG_LOCK_SCHEMA_VERSION,
            meta: LockMeta::default(),
            root,
            dependencies: BTreeMap::new(),
            packages: BTreeMap::new(),
        }
    }

    /// Add a package placed at `path`.
    pub fn add_package(&mut self, path: impl Into<String>, pkg: LockPackage) {
        self.packages.insert(path.into(), pkg);
    }

    /// Add a root dependency.
    pub fn add_dependency(&mut self, name: impl Into<String>, dep: LockDep) {
        self.dependencies.insert(name.into(), dep);
    }

    /// Get the package placed at `path`.
    #[must_use]
    pub fn get_package(&self, path: &str) -> Option<&LockPackage> {
        self.packages.get(path)
    }

    /// Record a resolved graph.
    #[must_use]
    pub fn from_graph(root: LockRoot, deps: &[RootDependency], graph: &DependencyGraph) -> Self {
        let mut lockfile = Self::new(root);

        for dep in deps {
            let resolved = graph
                .roots()
                .get(&dep.spec.name)
                .map(|id| graph.node(*id).install_path.clone());
            lockfile.add_dependency(
                dep.spec.name.clone(),
                LockDep::new(dep.spec.constraint.raw(), dep.kind, resolved),
            );
        }

        for node in graph.nodes() {
            let mut pkg = LockPackage::new(
                node.name.clone(),
                node.version.to_string(),
                node.artifact.integrity.clone(),
                node.artifact.url.clone(),
            );
            for (name, child) in &node.children {
                pkg.add_dependency(name.clone(), graph.node(*child).install_path.clone());
            }
            lockfile.add_package(node.install_path.clone(), pkg);
        }

        lockfile
    }

    /// Whether the root dependencies are exactly the ones declared.
    #[must_use]
    pub fn matches_roots(&self, deps: &[RootDependency]) -> bool {
        self.dependencies.len() == deps.len()
            && deps.iter().all(|dep| {
                self.dependencies.get(&dep.spec.name).is_some_and(|locked| {
                    locked.range == dep.spec.constraint.raw() && locked.kind == dep.kind
                })
            })
    }

    /// Rebuild the dependency graph recorded in this lockfile.
    ///
    /// # Errors
    /// Returns an error if an entry is malformed, sits at a path that does
    /// not match its name, or an edge points at a missing entry.
    pub fn to_graph(&self) -> Result<DependencyGraph, LockfileError> {
        let mut graph = DependencyGraph::new();
        let mut ids: HashMap<&str, NodeId> = HashMap::new();

        // Parents sort before their nested children
        for (path, pkg) in &self.packages {
            PackageSpec::new(&pkg.name, "*").map_err(|e| {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_ENTRY,
                    format!("Invalid package name at {path}: {}", e.message()),
                )
            })?;

            let version = Version::parse(&pkg.version).map_err(|e| {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_ENTRY,
                    format!("Invalid version '{}' at {path}: {e}", pkg.version),
                )
            })?;

            let parent = match path.rfind("/node_modules/") {
                Some(idx) => {
                    let parent_path = &path[..idx];
                    Some(*ids.get(parent_path).ok_or_else(|| {
                        LockfileError::new(
                            codes::PKG_LOCK_PACKAGE_MISSING,
                            format!("No package at {parent_path} (parent of {path})"),
                        )
                    })?)
                }
                None => None,
            };

            let expected = install_path_for(
                parent.map(|p| graph.node(p).install_path.as_str()),
                &pkg.name,
            );
            if &expected != path {
                return Err(LockfileError::new(
                    codes::PKG_LOCK_INVALID_ENTRY,
                    format!("Package {} is recorded at {path}, expected {expected}", pkg.name),
                ));
            }

            let artifact = ArtifactRef {
                url: pkg.resolved.clone(),
                integrity: pkg.integrity.clone(),
            };
            let id = graph.add_node(&pkg.name, version, artifact, parent);
            ids.insert(path.as_str(), id);
        }

        let target = |path: &str| {
            ids.get(path).copied().ok_or_else(|| {
                LockfileError::new(
                    codes::PKG_LOCK_PACKAGE_MISSING,
                    format!("Dependency points at missing package {path}"),
                )
            })
        };

        for (path, pkg) in &self.packages {
            let from = target(path)?;
            for (name, dep_path) in &pkg.dependencies {
                graph.add_edge(from, name, target(dep_path)?);
            }
        }

        for (name, dep) in &self.dependencies {
            if let Some(resolved) = &dep.resolved {
                graph.add_root(name, target(resolved)?);
            }
        }

        Ok(graph)
    }

    /// Read a lockfile from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn read_from(path: &Path) -> Result<Self, LockfileError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LockfileError::new(
                    codes::PKG_LOCK_NOT_FOUND,
                    format!("Lockfile not found: {}", path.display()),
                )
            } else {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_JSON,
                    format!("Failed to read lockfile: {e}"),
                )
            }
        })?;

        let lockfile = Self::from_json(&content)?;

        if lockfile.lockfile_version != PKG_LOCK_SCHEMA_VERSION {
            return Err(LockfileError::new(
                codes::PKG_LOCK_VERSION_MISMATCH,
                format!(
                    "Lockfile version {} not supported (expected {})",
                    lockfile.lockfile_version, PKG_LOCK_SCHEMA_VERSION
                ),
            ));
        }

        Ok(lockfile)
    }

    /// Write the lockfile to a path atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<(), LockfileError> {
        let mut content = self.to_json()?;
        content.push('\n');

        hyperpm_util::fs::atomic_write(path, content.as_bytes()).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to write lockfile: {e}"),
            )
        })
    }

    /// Serialize to a pretty JSON string.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, LockfileError> {
        serde_json::to_string_pretty(self).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to serialize lockfile: {e}"),
            )
        })
    }

    /// Deserialize from JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self, LockfileError> {
        serde_json::from_str(json).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_INVALID_JSON,
                format!("Invalid lockfile JSON: {e}"),
            )
        })
    }
}

/// Lockfile error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockfileError {
    code: &'static str,
    message: String,
}

impl LockfileError {
    /// Create a new error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LockfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LockfileError {}

/// Compute a deterministic hash of a lockfile's content.
///
/// Serializes the lockfile to JSON (`BTreeMap` guarantees deterministic
/// order) and returns a BLAKE3 hex digest.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn lockfile_content_hash(lockfile: &Lockfile) -> Result<String, LockfileError> {
    let json = serde_json::to_vec(lockfile).map_err(|e| {
        LockfileError::new(
            codes::PKG_LOCK_WRITE_FAILED,
            format!("Failed to serialize lockfile: {e}"),
        )
    })?;
    Ok(hyperpm_util::hash::blake3_bytes(&json))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str, version: &str) -> ArtifactRef {
        ArtifactRef {
            url: format!("https://r.example.com/{name}/-/{name}-{version}.tgz"),
            integrity: format!("sha512-{name}{version}"),
        }
    }

    /// app -> lib@1 -> util@2 (nested), app -> util@1 (root).
    fn sample_graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let lib = graph.add_node("lib", Version::new(1, 0, 0), artifact("lib", "1.0.0"), None);
        let util1 = graph.add_node("util", Version::new(1, 0, 0), artifact("util", "1.0.0"), None);
        let util2 = graph.add_node(
            "util",
            Version::new(2, 0, 0),
            artifact("util", "2.0.0"),
            Some(lib),
        );
        graph.add_root("lib", lib);
        graph.add_root("util", util1);
        graph.add_edge(lib, "util", util2);
        graph
    }

    fn sample_deps() -> Vec<RootDependency> {
        vec![
            RootDependency::new(
                PackageSpec::new("lib", "^1.0.0").unwrap(),
                DependencyKind::Prod,
            ),
            RootDependency::new(
                PackageSpec::new("util", "~1.0.0").unwrap(),
                DependencyKind::Dev,
            ),
        ]
    }

    #[test]
    fn test_lockfile_schema_version_is_stable() {
        assert_eq!(PKG_LOCK_SCHEMA_VERSION, 1);
    }

    #[test]
    fn test_error_codes_are_uppercase() {
        let all_codes = [
            codes::PKG_LOCK_NOT_FOUND,
            codes::PKG_LOCK_INVALID_JSON,
            codes::PKG_LOCK_VERSION_MISMATCH,
            codes::PKG_LOCK_INVALID_ENTRY,
            codes::PKG_LOCK_PACKAGE_MISSING,
            codes::PKG_LOCK_WRITE_FAILED,
            codes::PKG_LOCK_STALE,
        ];

        for code in all_codes {
            assert!(
                code.chars().all(|c| c.is_uppercase() || c == '_'),
                "Error code '{code}' should be SCREAMING_SNAKE_CASE"
            );
        }
    }

    #[test]
    fn test_from_graph_keys_by_install_path() {
        let lock = Lockfile::from_graph(LockRoot::new("app", None), &sample_deps(), &sample_graph());

        let keys: Vec<&str> = lock.packages.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [
                "node_modules/lib",
                "node_modules/lib/node_modules/util",
                "node_modules/util"
            ]
        );
        let lib = lock.get_package("node_modules/lib").unwrap();
        assert_eq!(
            lib.dependencies.get("util").map(String::as_str),
            Some("node_modules/lib/node_modules/util")
        );
        assert_eq!(
            lock.dependencies["util"],
            LockDep::new("~1.0.0", DependencyKind::Dev, Some("node_modules/util".to_string()))
        );
    }

    #[test]
    fn test_to_graph_restores_structure() {
        let original = sample_graph();
        let lock = Lockfile::from_graph(LockRoot::new("app", None), &sample_deps(), &original);

        let graph = lock.to_graph().unwrap();

        assert_eq!(graph.len(), original.len());
        let nested = graph.find_by_path("node_modules/lib/node_modules/util").unwrap();
        assert_eq!(nested.version, Version::new(2, 0, 0));
        let lib = graph.find_by_path("node_modules/lib").unwrap();
        assert_eq!(nested.parent, Some(lib.id));
        assert_eq!(lib.children["util"], nested.id);
        assert_eq!(graph.roots().len(), 2);

        // Recording the rebuilt graph reproduces the same lockfile
        let again = Lockfile::from_graph(LockRoot::new("app", None), &sample_deps(), &graph);
        assert_eq!(again, lock);
    }

    #[test]
    fn test_to_graph_rejects_dangling_edge() {
        let mut lock = Lockfile::new(LockRoot::new("app", None));
        let mut pkg = LockPackage::new("a", "1.0.0", "sha512-a", "https://r/a.tgz");
        pkg.add_dependency("b", "node_modules/b");
        lock.add_package("node_modules/a", pkg);

        let err = lock.to_graph().unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_PACKAGE_MISSING);
    }

    #[test]
    fn test_to_graph_rejects_misplaced_entry() {
        let mut lock = Lockfile::new(LockRoot::new("app", None));
        lock.add_package(
            "node_modules/a",
            LockPackage::new("b", "1.0.0", "sha512-a", "https://r/b.tgz"),
        );

        let err = lock.to_graph().unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_INVALID_ENTRY);
    }

    #[test]
    fn test_to_graph_rejects_path_traversal_name() {
        let mut lock = Lockfile::new(LockRoot::new("app", None));
        lock.add_package(
            "node_modules/../../escaped",
            LockPackage::new("../../escaped", "1.0.0", "sha512-a", "https://r/a.tgz"),
        );
        lock.add_dependency(
            "../../escaped",
            LockDep::new(
                "^1.0.0",
                DependencyKind::Prod,
                Some("node_modules/../../escaped".to_string()),
            ),
        );

        let err = lock.to_graph().unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_INVALID_ENTRY);

        let mut scoped = Lockfile::new(LockRoot::new("app", None));
        scoped.add_package(
            "node_modules/@s/..",
            LockPackage::new("@s/..", "1.0.0", "sha512-a", "https://r/a.tgz"),
        );
        assert_eq!(
            scoped.to_graph().unwrap_err().code(),
            codes::PKG_LOCK_INVALID_ENTRY
        );
    }

    #[test]
    fn test_matches_roots() {
        let deps = sample_deps();
        let lock = Lockfile::from_graph(LockRoot::new("app", None), &deps, &sample_graph());
        assert!(lock.matches_roots(&deps));

        let mut changed = deps.clone();
        changed[0] = RootDependency::new(
            PackageSpec::new("lib", "^2.0.0").unwrap(),
            DependencyKind::Prod,
        );
        assert!(!lock.matches_roots(&changed));
        assert!(!lock.matches_roots(&deps[..1]));
    }

    #[test]
    fn test_lockfile_json_is_stable() {
        let lock = Lockfile::from_graph(LockRoot::new("app", None), &sample_deps(), &sample_graph());
        assert_eq!(lock.to_json().unwrap(), lock.to_json().unwrap());
        assert_eq!(
            lockfile_content_hash(&lock).unwrap(),
            lockfile_content_hash(&Lockfile::from_json(&lock.to_json().unwrap()).unwrap()).unwrap()
        );
    }

    #[test]
    fn test_lockfile_error() {
        let err = LockfileError::new(codes::PKG_LOCK_NOT_FOUND, "File not found");
        assert_eq!(err.code(), codes::PKG_LOCK_NOT_FOUND);
        assert_eq!(err.message(), "File not found");
        assert!(err.to_string().contains("PKG_LOCK_NOT_FOUND"));
    }

    #[test]
    fn test_lockfile_read_not_found() {
        let err = Lockfile::read_from(Path::new("/nonexistent/hyperpm.lock")).unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_NOT_FOUND);
    }

    #[test]
    fn test_lockfile_read_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCKFILE_NAME);
        std::fs::write(&path, "not valid json").unwrap();

        let err = Lockfile::read_from(&path).unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_INVALID_JSON);
    }

    #[test]
    fn test_lockfile_read_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCKFILE_NAME);
        std::fs::write(
            &path,
            r#"{"lockfile_version": 99, "root": {"name": "x"}, "packages": {}}"#,
        )
        .unwrap();

        let err = Lockfile::read_from(&path).unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_VERSION_MISMATCH);
    }

    #[test]
    fn test_lockfile_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCKFILE_NAME);

        let lock = Lockfile::from_graph(
            LockRoot::new("test-project", Some("1.0.0".to_string())),
            &sample_deps(),
            &sample_graph(),
        );
        lock.write_to(&path).unwrap();

        assert_eq!(Lockfile::read_from(&path).unwrap(), lock);
    }
}
