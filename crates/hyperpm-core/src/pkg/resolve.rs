//! Dependency resolution.
//!
//! Builds a [`DependencyGraph`] breadth-first, one wave at a time. Metadata
//! for every name a wave needs is fetched concurrently first; the wave is
//! then processed in queue order, so the graph depends only on the metadata
//! answers and never on their arrival order.
//!
//! Placement follows Node's lookup rules. A dependency reuses the nearest
//! visible node with its name when that node satisfies the constraint. When
//! no node with the name is visible, the best version is placed at the root.
//! When the visible node conflicts, a private copy is nested in the
//! requester's own `node_modules`. Already placed nodes are never upgraded.

use super::error::{PkgError, ResolutionError};
use super::graph::{DependencyGraph, NodeId};
use super::lockfile::Lockfile;
use super::manifest::{DependencyKind, RootDependency};
use super::registry::{is_not_found, PackageMetadata, PackageVersion, Registry};
use super::spec::{Constraint, PackageSpec};
use futures::stream::{self, StreamExt};
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum concurrent metadata fetches.
pub const MAX_CONCURRENT_FETCHES: usize = 32;

/// Maximum nesting depth before giving up on a dependency chain.
const MAX_DEPTH: usize = 100;

/// Label used for the project root in conflict reports.
const ROOT_LABEL: &str = "<root>";

/// Resolves root dependencies against a [`Registry`].
#[derive(Debug)]
pub struct Resolver<'a, R> {
    registry: &'a R,
    concurrency: usize,
}

impl<'a, R: Registry> Resolver<'a, R> {
    #[must_use]
    pub fn new(registry: &'a R) -> Self {
        Self {
            registry,
            concurrency: MAX_CONCURRENT_FETCHES,
        }
    }

    /// Limit concurrent metadata fetches.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Resolve `roots` into a dependency graph.
    ///
    /// When `existing` records exactly these root dependencies its graph is
    /// rebuilt without contacting the registry. Otherwise versions it
    /// records are preferred whenever they satisfy a constraint.
    ///
    /// # Errors
    /// Any [`ResolutionError`] is fatal for the whole graph.
    pub async fn resolve(
        &self,
        roots: &[RootDependency],
        existing: Option<&Lockfile>,
    ) -> Result<DependencyGraph, ResolutionError> {
        if let Some(lock) = existing.filter(|lock| lock.matches_roots(roots)) {
            match lock.to_graph() {
                Ok(graph) => {
                    info!(nodes = graph.len(), "using graph from lockfile");
                    return Ok(graph);
                }
                Err(e) => warn!(error = %e, "lockfile is inconsistent, resolving from registry"),
            }
        }

        let mut state = ResolveState::new(self.registry, self.concurrency, existing);

        let names = roots
            .iter()
            .filter(|dep| !matches!(dep.spec.constraint, Constraint::Unsupported(_)))
            .map(|dep| dep.spec.name.clone())
            .collect();
        state.prefetch(names).await;

        for dep in roots {
            let optional = dep.kind == DependencyKind::Optional;
            if let Some(target) = state.resolve_edge(None, &dep.spec, optional).await? {
                state.graph.add_root(&dep.spec.name, target);
            }
        }

        while !state.queue.is_empty() {
            let wave: Vec<NodeId> = state.queue.drain(..).collect();
            let names = wave
                .iter()
                .filter_map(|id| state.version_of(*id))
                .flat_map(|pv| {
                    pv.dependencies
                        .iter()
                        .chain(&pv.optional_dependencies)
                        .chain(&pv.peer_dependencies)
                        .map(|s| s.name.clone())
                        .collect::<Vec<_>>()
                })
                .collect();
            state.prefetch(names).await;

            for id in wave {
                state.process_node(id).await?;
            }
        }

        info!(nodes = state.graph.len(), roots = state.graph.roots().len(), "resolved dependency graph");
        Ok(state.graph)
    }
}

type MetadataResult = Result<Arc<PackageMetadata>, PkgError>;

struct ResolveState<'a, R> {
    registry: &'a R,
    concurrency: usize,
    graph: DependencyGraph,
    /// Scope (owning node, `None` for the root) to the names placed in it.
    scopes: HashMap<Option<NodeId>, BTreeMap<String, NodeId>>,
    metadata: HashMap<String, MetadataResult>,
    preferred: HashMap<String, BTreeSet<Version>>,
    queue: VecDeque<NodeId>,
}

impl<'a, R: Registry> ResolveState<'a, R> {
    fn new(registry: &'a R, concurrency: usize, existing: Option<&Lockfile>) -> Self {
        let mut preferred: HashMap<String, BTreeSet<Version>> = HashMap::new();
        for pkg in existing.iter().flat_map(|lock| lock.packages.values()) {
            if let Ok(version) = Version::parse(&pkg.version) {
                preferred.entry(pkg.name.clone()).or_default().insert(version);
            }
        }

        Self {
            registry,
            concurrency,
            graph: DependencyGraph::new(),
            scopes: HashMap::new(),
            metadata: HashMap::new(),
            preferred,
            queue: VecDeque::new(),
        }
    }

    /// Fetch metadata for every name not seen yet.
    async fn prefetch(&mut self, names: BTreeSet<String>) {
        let missing: Vec<String> = names
            .into_iter()
            .filter(|name| !self.metadata.contains_key(name))
            .collect();
        if missing.is_empty() {
            return;
        }
        debug!(count = missing.len(), "fetching metadata");

        let registry = self.registry;
        let results: Vec<(String, MetadataResult)> = stream::iter(missing)
            .map(|name| async move {
                let result = registry.get_versions(&name).await;
                (name, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        self.metadata.extend(results);
    }

    async fn metadata(&mut self, name: &str) -> Result<Arc<PackageMetadata>, ResolutionError> {
        if !self.metadata.contains_key(name) {
            let result = self.registry.get_versions(name).await;
            self.metadata.insert(name.to_string(), result);
        }

        match &self.metadata[name] {
            Ok(meta) => Ok(Arc::clone(meta)),
            Err(e) if is_not_found(e) => Err(ResolutionError::NotFound {
                name: name.to_string(),
                version: None,
            }),
            Err(e) => Err(ResolutionError::Registry {
                name: name.to_string(),
                message: e.message().to_string(),
            }),
        }
    }

    /// Published version record behind a placed node.
    fn version_of(&self, id: NodeId) -> Option<PackageVersion> {
        let node = self.graph.node(id);
        let meta = self.metadata.get(&node.name)?.as_ref().ok()?;
        meta.get(&node.version).cloned()
    }

    async fn process_node(&mut self, id: NodeId) -> Result<(), ResolutionError> {
        let Some(pv) = self.version_of(id) else {
            return Ok(());
        };

        let mut edges: Vec<(&PackageSpec, bool)> = pv
            .dependencies
            .iter()
            .map(|s| (s, false))
            .chain(pv.optional_dependencies.iter().map(|s| (s, true)))
            .collect();
        edges.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        for (spec, optional) in edges {
            if let Some(target) = self.resolve_edge(Some(id), spec, optional).await? {
                self.link(id, &spec.name, target, &spec.constraint)?;
            }
        }

        for peer in &pv.peer_dependencies {
            let optional = pv.optional_peers.contains(&peer.name);
            self.resolve_peer(id, peer, optional).await?;
        }

        Ok(())
    }

    /// Record `from -> target`, rejecting a second different node under one name.
    fn link(
        &mut self,
        from: NodeId,
        name: &str,
        target: NodeId,
        constraint: &Constraint,
    ) -> Result<(), ResolutionError> {
        match self.graph.node(from).children.get(name) {
            Some(existing) if *existing == target => Ok(()),
            Some(existing) => Err(self.conflict(Some(from), *existing, constraint, Some(from))),
            None => {
                self.graph.add_edge(from, name, target);
                Ok(())
            }
        }
    }

    /// Resolve one dependency edge of `requester` (`None` for the project).
    ///
    /// Returns `None` when an optional dependency is skipped.
    async fn resolve_edge(
        &mut self,
        requester: Option<NodeId>,
        spec: &PackageSpec,
        optional: bool,
    ) -> Result<Option<NodeId>, ResolutionError> {
        match self.select(requester, spec).await {
            Ok(target) => Ok(Some(target)),
            Err(e @ (ResolutionError::NotFound { .. }
            | ResolutionError::ConstraintUnsatisfiable { .. }
            | ResolutionError::UnsupportedSpec { .. }))
                if optional =>
            {
                warn!(dependency = %spec, error = %e, "skipping optional dependency");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn select(
        &mut self,
        requester: Option<NodeId>,
        spec: &PackageSpec,
    ) -> Result<NodeId, ResolutionError> {
        if let Constraint::Unsupported(raw) = &spec.constraint {
            return Err(ResolutionError::UnsupportedSpec {
                name: spec.name.clone(),
                spec: raw.clone(),
            });
        }

        let visible = self.lookup(requester, &spec.name);
        if let Some(existing) = visible {
            if self.satisfies(existing, &spec.constraint).await? {
                return Ok(existing);
            }
        }

        let meta = self.metadata(&spec.name).await?;
        let version = self.pick(&meta, spec)?;

        let Some(existing) = visible else {
            return Ok(self.place(&meta, &version, None));
        };

        // A cycle back to a package already on the requester's path
        if let Some(ancestor) = self
            .chain(requester)
            .into_iter()
            .flatten()
            .find(|id| {
                let node = self.graph.node(*id);
                node.name == spec.name && node.version == version
            })
        {
            return Ok(ancestor);
        }

        if self.scope(requester).contains_key(&spec.name) {
            return Err(self.conflict(requester, existing, &spec.constraint, requester));
        }

        let depth = requester.map_or(0, |id| self.graph.ancestors(id).count() + 1);
        if depth >= MAX_DEPTH {
            return Err(self.conflict(requester, existing, &spec.constraint, requester));
        }

        Ok(self.place(&meta, &version, requester))
    }

    /// Peers must come from the dependent's parent scope.
    async fn resolve_peer(
        &mut self,
        dependent: NodeId,
        peer: &PackageSpec,
        optional: bool,
    ) -> Result<(), ResolutionError> {
        if matches!(peer.constraint, Constraint::Unsupported(_)) {
            warn!(dependent = %self.graph.node(dependent).label(), peer = %peer, "ignoring unsupported peer specifier");
            return Ok(());
        }

        let own = self.graph.node(dependent).children.get(&peer.name).copied();
        let parent = self.graph.node(dependent).parent;
        let visible = own.or_else(|| self.lookup(parent, &peer.name));

        match visible {
            Some(existing) => {
                if !self.satisfies(existing, &peer.constraint).await? {
                    return Err(self.conflict(
                        parent,
                        existing,
                        &peer.constraint,
                        Some(dependent),
                    ));
                }
                self.link(dependent, &peer.name, existing, &peer.constraint)
            }
            None if optional => Ok(()),
            None => {
                debug!(dependent = %self.graph.node(dependent).label(), peer = %peer, "installing missing peer");
                let meta = self.metadata(&peer.name).await?;
                let version = self.pick(&meta, peer)?;
                let target = self.place(&meta, &version, None);
                self.link(dependent, &peer.name, target, &peer.constraint)
            }
        }
    }

    /// Choose the version a fresh placement gets.
    fn pick(&self, meta: &PackageMetadata, spec: &PackageSpec) -> Result<Version, ResolutionError> {
        match &spec.constraint {
            Constraint::Range(range) => {
                let preferred = self.preferred.get(&spec.name).and_then(|versions| {
                    versions
                        .iter()
                        .rev()
                        .find(|v| range.satisfies(v) && meta.versions.contains_key(*v))
                });
                if let Some(version) = preferred {
                    return Ok(version.clone());
                }

                if let Some(version) = range.max_satisfying(meta.versions.keys()) {
                    return Ok(version.clone());
                }

                // An exact version that was never published is missing, not unsatisfiable
                let raw = range.raw();
                if Version::parse(raw.trim_start_matches(['=', 'v'])).is_ok() {
                    return Err(ResolutionError::NotFound {
                        name: spec.name.clone(),
                        version: Some(raw.to_string()),
                    });
                }
                Err(ResolutionError::ConstraintUnsatisfiable {
                    name: spec.name.clone(),
                    range: raw.to_string(),
                })
            }
            Constraint::Tag(tag) => meta
                .tag(tag)
                .filter(|v| meta.versions.contains_key(*v))
                .cloned()
                .ok_or_else(|| ResolutionError::NotFound {
                    name: spec.name.clone(),
                    version: Some(tag.clone()),
                }),
            Constraint::Unsupported(raw) => Err(ResolutionError::UnsupportedSpec {
                name: spec.name.clone(),
                spec: raw.clone(),
            }),
        }
    }

    async fn satisfies(
        &mut self,
        id: NodeId,
        constraint: &Constraint,
    ) -> Result<bool, ResolutionError> {
        let node = self.graph.node(id);
        match constraint {
            Constraint::Range(range) => Ok(range.satisfies(&node.version)),
            Constraint::Tag(tag) => {
                let (name, version) = (node.name.clone(), node.version.clone());
                let meta = self.metadata(&name).await?;
                Ok(meta.tag(tag) == Some(&version))
            }
            Constraint::Unsupported(_) => Ok(false),
        }
    }

    /// Create a node in `scope` and queue it for processing.
    fn place(&mut self, meta: &PackageMetadata, version: &Version, scope: Option<NodeId>) -> NodeId {
        let artifact = meta
            .get(version)
            .map(|pv| self.registry.artifact_location(pv))
            .unwrap_or_default();
        let id = self
            .graph
            .add_node(&meta.name, version.clone(), artifact, scope);
        self.scopes
            .entry(scope)
            .or_default()
            .insert(meta.name.clone(), id);
        self.queue.push_back(id);

        let node = self.graph.node(id);
        debug!(package = %node.label(), path = %node.install_path, "placed");
        id
    }

    fn scope(&self, scope: Option<NodeId>) -> &BTreeMap<String, NodeId> {
        static EMPTY: BTreeMap<String, NodeId> = BTreeMap::new();
        self.scopes.get(&scope).unwrap_or(&EMPTY)
    }

    /// Scopes searched from `from`, nearest first, ending with the root.
    fn chain(&self, from: Option<NodeId>) -> Vec<Option<NodeId>> {
        let mut chain = vec![from];
        let mut current = from;
        while let Some(id) = current {
            current = self.graph.node(id).parent;
            chain.push(current);
        }
        chain
    }

    /// Nearest node named `name` visible from `from`.
    fn lookup(&self, from: Option<NodeId>, name: &str) -> Option<NodeId> {
        self.chain(from)
            .into_iter()
            .find_map(|scope| self.scope(scope).get(name).copied())
    }

    fn conflict(
        &self,
        scope: Option<NodeId>,
        existing: NodeId,
        constraint: &Constraint,
        required_by: Option<NodeId>,
    ) -> ResolutionError {
        let label = |id: Option<NodeId>| {
            id.map_or_else(|| ROOT_LABEL.to_string(), |id| self.graph.node(id).label())
        };
        let existing = self.graph.node(existing);
        ResolutionError::Conflict {
            name: existing.name.clone(),
            scope: scope.map_or_else(
                || ROOT_LABEL.to_string(),
                |id| self.graph.node(id).install_path.clone(),
            ),
            existing: existing.version.to_string(),
            range: constraint.raw().to_string(),
            required_by: label(required_by),
        }
    }
}
