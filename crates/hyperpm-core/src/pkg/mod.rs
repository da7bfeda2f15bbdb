//! Package manager functionality.
//!
//! Provides:
//! - Reading and saving `package.json` dependency sections
//! - npm package specs, version ranges and dist-tags
//! - Fetching package metadata and tarballs from an npm registry
//! - Resolving a deterministic, node-style nested dependency graph
//! - A content-addressed store of extracted packages
//! - Hard-linking store entries into `node_modules`
//! - A deterministic lockfile
//! - The install orchestrator tying all of the above together

pub mod error;
pub mod fetch;
pub mod graph;
pub mod install;
pub mod integrity;
pub mod link;
pub mod locks;
pub mod lockfile;
pub mod manifest;
pub mod npmrc;
pub mod range;
pub mod registry;
pub mod resolve;
pub mod spec;
pub mod store;
pub mod tarball;

#[cfg(test)]
mod testing;

pub use error::{codes as pkg_codes, FetchError, LinkError, PkgError, ResolutionError};
pub use fetch::{Materializer, RetryPolicy, Sleeper, TokioSleeper};
pub use graph::{install_path_for, DependencyGraph, NodeId, ResolvedNode};
pub use install::{
    FailedNode, InstallError, InstallEvent, InstallObserver, InstallOptions, InstallReport,
    Installer, NodeState, NoopObserver, DEFAULT_CONCURRENCY,
};
pub use integrity::{HashAlgorithm, Integrity};
pub use link::{InstalledTree, LinkOutcome, Linker, PlacementMarker, MARKER_FILE};
pub use lockfile::{
    codes as lockfile_codes, lockfile_content_hash, LockDep, LockMeta, LockPackage, LockRoot,
    Lockfile, LockfileError, LOCKFILE_NAME, PKG_LOCK_SCHEMA_VERSION,
};
pub use manifest::{
    read_manifest, save_dependencies, DependencyKind, Manifest, PkgDepError, RootDependency,
    MANIFEST_NAME,
};
pub use npmrc::NpmrcConfig;
pub use range::{version_satisfies, VersionRange};
pub use registry::{
    ArtifactFetcher, ArtifactRef, PackageMetadata, PackageVersion, Registry, RegistryClient,
    TransportError, DEFAULT_REGISTRY, REGISTRY_ENV,
};
pub use resolve::Resolver;
pub use spec::{Constraint, PackageSpec};
pub use store::{ContentStore, StoreEntry, STORE_DIR_ENV};
