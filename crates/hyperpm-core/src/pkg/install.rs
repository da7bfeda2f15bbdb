//! Installation orchestrator.
//!
//! Drives a project install end to end: read the manifest, resolve the
//! graph, then fetch, extract and link every node with bounded concurrency.
//! Each node runs its own pipeline and failures never cancel siblings. The
//! lockfile is written only when every node reached `Done`.

use super::error::{codes, PkgError, ResolutionError};
use super::fetch::{Materializer, RetryPolicy};
use super::graph::{DependencyGraph, NodeId, ResolvedNode};
use super::link::{LinkOutcome, Linker};
use super::lockfile::{
    codes as lock_codes, lockfile_content_hash, LockRoot, Lockfile, LockfileError, LOCKFILE_NAME,
};
use super::manifest::{
    read_manifest, save_dependencies, DependencyKind, RootDependency, MANIFEST_NAME,
};
use super::registry::{ArtifactFetcher, Registry};
use super::resolve::Resolver;
use super::spec::{Constraint, PackageSpec};
use super::store::ContentStore;
use crate::version::VERSION;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default number of nodes fetched and linked at once.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Reason recorded for nodes that never started because of cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

/// Knobs for one install run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Maximum nodes in flight.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Place `devDependencies`. They are resolved and locked either way.
    pub include_dev: bool,
    /// Place `optionalDependencies`. They are resolved and locked either way.
    pub include_optional: bool,
    /// Fail instead of resolving when the lockfile is missing or stale.
    pub frozen_lockfile: bool,
}

impl InstallOptions {
    /// Whether root dependencies of `kind` are placed.
    #[must_use]
    pub fn includes(&self, kind: DependencyKind) -> bool {
        match kind {
            DependencyKind::Prod => true,
            DependencyKind::Dev => self.include_dev,
            DependencyKind::Optional => self.include_optional,
        }
    }
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            include_dev: true,
            include_optional: true,
            frozen_lockfile: false,
        }
    }
}

/// Per-node lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Fetching,
    Extracted,
    Linked,
    Done,
    Failed(String),
}

impl NodeState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: &NodeState) -> bool {
        use NodeState::{Done, Extracted, Failed, Fetching, Linked, Pending};
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Extracted)
                | (Extracted, Linked)
                | (Linked, Done)
                | (Pending | Fetching | Extracted, Failed(_))
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Fetching => f.write_str("fetching"),
            Self::Extracted => f.write_str("extracted"),
            Self::Linked => f.write_str("linked"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Progress notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallEvent {
    NodeStateChanged {
        node: NodeId,
        package: String,
        old: NodeState,
        new: NodeState,
    },
    /// Emitted once after every node is terminal.
    OverallResult {
        /// Install paths that reached `Done`.
        done: BTreeSet<String>,
        /// Failed nodes keyed by install path.
        failed: BTreeMap<String, FailedNode>,
    },
}

/// Receives install events. Must not block.
pub trait InstallObserver: Send + Sync {
    fn on_event(&self, event: InstallEvent);
}

impl InstallObserver for mpsc::UnboundedSender<InstallEvent> {
    fn on_event(&self, event: InstallEvent) {
        // A dropped receiver just means nobody is listening
        let _ = self.send(event);
    }
}

/// Observer that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl InstallObserver for NoopObserver {
    fn on_event(&self, _event: InstallEvent) {}
}

/// Failure of an install as a whole (before any node work, or of the
/// manifest/lockfile bookkeeping). Per-node failures are in the report.
#[derive(Debug, Clone, Error)]
pub enum InstallError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("{0}")]
    Lockfile(#[from] LockfileError),

    #[error("{0}")]
    Manifest(#[from] PkgError),
}

impl InstallError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolution(e) => e.code(),
            Self::Lockfile(e) => e.code(),
            Self::Manifest(e) => e.code(),
        }
    }
}

/// A node that did not reach `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedNode {
    /// `name@version`.
    pub package: String,
    pub code: &'static str,
    pub reason: String,
}

/// Outcome of an install run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    /// Every node reached `Done`.
    pub ok: bool,
    /// Nodes selected for placement.
    pub packages: usize,
    pub done: usize,
    /// Failed nodes keyed by install path.
    pub failed: BTreeMap<String, FailedNode>,
    /// Placements written this run.
    pub linked: usize,
    /// Placements that were already up to date.
    pub unchanged: usize,
    /// Nodes served from the store.
    pub store_hits: u64,
    /// Download attempts, retries included.
    pub fetches: u64,
    pub cancelled: bool,
    /// Extraneous placements removed.
    pub pruned: Vec<String>,
    /// Ranges written to `package.json` for requested packages.
    pub saved: BTreeMap<String, String>,
    pub lockfile_written: bool,
    /// BLAKE3 of the lockfile describing this tree, when successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockfile_hash: Option<String>,
}

/// Current state of every node, with transition checking.
struct StateTable<'o> {
    states: Mutex<Vec<NodeState>>,
    observer: &'o dyn InstallObserver,
}

impl<'o> StateTable<'o> {
    fn new(len: usize, observer: &'o dyn InstallObserver) -> Self {
        Self {
            states: Mutex::new(vec![NodeState::Pending; len]),
            observer,
        }
    }

    fn advance(&self, node: &ResolvedNode, next: NodeState) {
        let old = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let current = &mut states[node.id.0];
            if !current.can_transition_to(&next) {
                warn!(package = %node.label(), from = %current, to = %next, "illegal state transition");
                return;
            }
            std::mem::replace(current, next.clone())
        };

        debug!(package = %node.label(), from = %old, to = %next, "node state");
        self.observer.on_event(InstallEvent::NodeStateChanged {
            node: node.id,
            package: node.label(),
            old,
            new: next,
        });
    }
}

enum NodeResult {
    Done(LinkOutcome),
    Failed(FailedNode),
}

/// Installs a project's dependencies.
pub struct Installer<'a, R> {
    project_root: PathBuf,
    registry: &'a R,
    store: &'a ContentStore,
    options: InstallOptions,
    cancel: Arc<AtomicBool>,
}

impl<'a, R: Registry + ArtifactFetcher> Installer<'a, R> {
    #[must_use]
    pub fn new(
        project_root: impl Into<PathBuf>,
        registry: &'a R,
        store: &'a ContentStore,
        options: InstallOptions,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            registry,
            store,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancel flag, e.g. with a Ctrl-C handler.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops dispatching queued nodes when set.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Install the manifest's dependencies plus `requested` packages.
    ///
    /// Requested packages become production dependencies and are saved to
    /// `package.json` after a successful install; dist-tag requests are
    /// saved as `^<resolved version>`.
    ///
    /// # Errors
    /// Manifest, lockfile and resolution problems fail the whole install.
    /// Node failures are reported in [`InstallReport::failed`].
    pub async fn install(
        &self,
        requested: &[PackageSpec],
        observer: &dyn InstallObserver,
    ) -> Result<InstallReport, InstallError> {
        let manifest_path = self.project_root.join(MANIFEST_NAME);
        // Every section is read so the lockfile always describes the full tree
        let manifest = read_manifest(&manifest_path, true, true)?;
        for err in &manifest.errors {
            warn!(dependency = %err.name, code = err.code, "{}", err.message);
        }

        let mut roots: BTreeMap<String, RootDependency> = manifest
            .dependencies
            .into_iter()
            .map(|dep| (dep.spec.name.clone(), dep))
            .collect();
        for spec in requested {
            roots.insert(
                spec.name.clone(),
                RootDependency::new(spec.clone(), DependencyKind::Prod),
            );
        }
        let roots: Vec<RootDependency> = roots.into_values().collect();

        let lock_path = self.project_root.join(LOCKFILE_NAME);
        let existing = self.read_lockfile(&lock_path, &roots)?;

        let graph = Resolver::new(self.registry)
            .with_concurrency(self.options.concurrency)
            .resolve(&roots, existing.as_ref())
            .await?;

        let saved = saved_ranges(requested, &graph);
        let lock_roots: Vec<RootDependency> = roots
            .into_iter()
            .map(|dep| match saved.get(&dep.spec.name) {
                Some(range) => PackageSpec::new(&dep.spec.name, range)
                    .map(|spec| RootDependency::new(spec, dep.kind)),
                None => Ok(dep),
            })
            .collect::<Result<_, _>>()?;

        let selected = select_nodes(&graph, &lock_roots, &self.options);
        if selected.len() < graph.len() {
            info!(
                skipped = graph.len() - selected.len(),
                "skipping excluded dependency kinds"
            );
        }

        let mut report = self.install_nodes(&graph, &selected, observer).await;
        if !report.ok {
            warn!(failed = report.failed.len(), "install incomplete, lockfile not written");
            return Ok(report);
        }

        // Excluded nodes stay in the keep set, so earlier placements survive
        let linker = Linker::new(&self.project_root);
        match linker.prune_extraneous(&graph) {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!(error = %e, "failed to prune extraneous packages"),
        }

        let root = LockRoot::new(
            manifest.name.unwrap_or_else(|| "unknown".to_string()),
            manifest.version,
        );
        let mut lockfile = Lockfile::from_graph(root, &lock_roots, &graph);
        lockfile.meta.hyperpm_version = Some(VERSION.to_string());
        report.lockfile_hash = Some(lockfile_content_hash(&lockfile)?);

        if existing.as_ref() != Some(&lockfile) {
            lockfile.write_to(&lock_path)?;
            report.lockfile_written = true;
        }

        save_dependencies(&manifest_path, &saved)?;
        report.saved = saved;

        info!(
            packages = report.packages,
            linked = report.linked,
            unchanged = report.unchanged,
            "install complete"
        );
        Ok(report)
    }

    /// Fetch, extract and link every node of an already resolved graph.
    pub async fn install_graph(
        &self,
        graph: &DependencyGraph,
        observer: &dyn InstallObserver,
    ) -> InstallReport {
        let all: Vec<NodeId> = graph.nodes().map(|node| node.id).collect();
        self.install_nodes(graph, &all, observer).await
    }

    async fn install_nodes(
        &self,
        graph: &DependencyGraph,
        selected: &[NodeId],
        observer: &dyn InstallObserver,
    ) -> InstallReport {
        let materializer = Materializer::new(self.store, self.registry, self.options.retry);
        let linker = Linker::new(&self.project_root);
        let table = StateTable::new(graph.len(), observer);

        let (materializer, linker, table) = (&materializer, &linker, &table);
        let nodes = selected.iter().map(|id| graph.node(*id));
        let results: Vec<(NodeId, NodeResult)> = stream::iter(nodes)
            .map(move |node| async move {
                (node.id, self.run_node(node, materializer, linker, table).await)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut done = BTreeSet::new();
        let mut report = InstallReport {
            packages: selected.len(),
            cancelled: self.cancel.load(Ordering::SeqCst),
            ..InstallReport::default()
        };
        for (id, result) in results {
            let path = &graph.node(id).install_path;
            match result {
                NodeResult::Done(outcome) => {
                    done.insert(path.clone());
                    match outcome {
                        LinkOutcome::Linked(_) => report.linked += 1,
                        LinkOutcome::Unchanged => report.unchanged += 1,
                    }
                }
                NodeResult::Failed(failure) => {
                    report.failed.insert(path.clone(), failure);
                }
            }
        }
        report.done = done.len();
        report.ok = report.failed.is_empty();
        report.store_hits = materializer.store_hits();
        report.fetches = materializer.fetches();

        observer.on_event(InstallEvent::OverallResult {
            done,
            failed: report.failed.clone(),
        });
        report
    }

    async fn run_node(
        &self,
        node: &ResolvedNode,
        materializer: &Materializer<'_, R>,
        linker: &Linker,
        table: &StateTable<'_>,
    ) -> NodeResult {
        let fail = |code: &'static str, reason: String| {
            table.advance(node, NodeState::Failed(reason.clone()));
            NodeResult::Failed(FailedNode {
                package: node.label(),
                code,
                reason,
            })
        };

        if self.cancel.load(Ordering::SeqCst) {
            return fail(codes::PKG_INSTALL_CANCELLED, CANCELLED_REASON.to_string());
        }

        table.advance(node, NodeState::Fetching);
        let entry = match materializer.materialize(node).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(package = %node.label(), error = %e, "fetch failed");
                return fail(e.code(), e.to_string());
            }
        };
        table.advance(node, NodeState::Extracted);

        match linker.link_node(node, &entry).await {
            Ok(outcome) => {
                table.advance(node, NodeState::Linked);
                table.advance(node, NodeState::Done);
                NodeResult::Done(outcome)
            }
            Err(e) => {
                warn!(package = %node.label(), error = %e, "link failed");
                fail(e.code(), e.to_string())
            }
        }
    }

    fn read_lockfile(
        &self,
        path: &Path,
        roots: &[RootDependency],
    ) -> Result<Option<Lockfile>, InstallError> {
        let existing = match Lockfile::read_from(path) {
            Ok(lock) => Some(lock),
            Err(e) if e.code() == lock_codes::PKG_LOCK_NOT_FOUND => {
                if self.options.frozen_lockfile {
                    return Err(e.into());
                }
                None
            }
            Err(e) => {
                if self.options.frozen_lockfile {
                    return Err(e.into());
                }
                warn!(error = %e, "ignoring unreadable lockfile");
                None
            }
        };

        if self.options.frozen_lockfile {
            if let Some(lock) = &existing {
                if !lock.matches_roots(roots) {
                    return Err(LockfileError::new(
                        lock_codes::PKG_LOCK_STALE,
                        format!("{LOCKFILE_NAME} does not match {MANIFEST_NAME}"),
                    )
                    .into());
                }
            }
        }
        Ok(existing)
    }
}

/// Nodes reachable from the root dependencies whose kind is included, in
/// graph order.
fn select_nodes(
    graph: &DependencyGraph,
    roots: &[RootDependency],
    options: &InstallOptions,
) -> Vec<NodeId> {
    let mut seen = vec![false; graph.len()];
    let mut stack: Vec<NodeId> = roots
        .iter()
        .filter(|dep| options.includes(dep.kind))
        .filter_map(|dep| graph.roots().get(&dep.spec.name).copied())
        .collect();

    while let Some(id) = stack.pop() {
        if std::mem::replace(&mut seen[id.0], true) {
            continue;
        }
        stack.extend(graph.node(id).children.values().copied());
    }

    graph
        .nodes()
        .filter(|node| seen[node.id.0])
        .map(|node| node.id)
        .collect()
}

/// Ranges to save for explicitly requested packages.
fn saved_ranges(requested: &[PackageSpec], graph: &DependencyGraph) -> BTreeMap<String, String> {
    requested
        .iter()
        .filter_map(|spec| {
            let range = match &spec.constraint {
                Constraint::Tag(_) => {
                    let node = graph.roots().get(&spec.name)?;
                    format!("^{}", graph.node(*node).version)
                }
                other => other.raw().to_string(),
            };
            Some((spec.name.clone(), range))
        })
        .collect()
}
