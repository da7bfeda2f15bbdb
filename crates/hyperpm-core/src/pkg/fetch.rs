//! Fetch & extract pipeline.
//!
//! [`Materializer::materialize`] turns a resolved node into a published
//! [`StoreEntry`]: look up the store, otherwise download with retries,
//! verify integrity, unpack into staging and publish by rename. Calls for
//! the same integrity key are serialized by the store's writer lock, so a
//! package is downloaded at most once per process.

use super::error::{codes, FetchError};
use super::graph::ResolvedNode;
use super::integrity::Integrity;
use super::registry::{ArtifactFetcher, TransportError};
use super::store::{ContentStore, StoreEntry};
use super::tarball;
use bytes::Bytes;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Bounded exponential backoff for transient download failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Async sleep, injectable so retries can be tested without waiting.
#[allow(async_fn_in_trait)]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Downloads, verifies and unpacks artifacts into a [`ContentStore`].
#[derive(Debug)]
pub struct Materializer<'a, F, S = TokioSleeper> {
    store: &'a ContentStore,
    fetcher: &'a F,
    sleeper: S,
    policy: RetryPolicy,
    store_hits: AtomicU64,
    fetches: AtomicU64,
}

impl<'a, F: ArtifactFetcher> Materializer<'a, F, TokioSleeper> {
    #[must_use]
    pub fn new(store: &'a ContentStore, fetcher: &'a F, policy: RetryPolicy) -> Self {
        Self {
            store,
            fetcher,
            sleeper: TokioSleeper,
            policy,
            store_hits: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }
}

impl<'a, F: ArtifactFetcher, S: Sleeper> Materializer<'a, F, S> {
    /// Replace the sleeper used between retries.
    #[must_use]
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> Materializer<'a, F, S2> {
        Materializer {
            store: self.store,
            fetcher: self.fetcher,
            sleeper,
            policy: self.policy,
            store_hits: self.store_hits,
            fetches: self.fetches,
        }
    }

    /// Nodes satisfied from the store without downloading.
    #[must_use]
    pub fn store_hits(&self) -> u64 {
        self.store_hits.load(Ordering::Relaxed)
    }

    /// Download attempts made, retries included.
    #[must_use]
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Ensure the node's package body is in the store.
    ///
    /// # Errors
    /// See [`FetchError`]. Nothing is published on failure.
    pub async fn materialize(&self, node: &ResolvedNode) -> Result<StoreEntry, FetchError> {
        let expected = Integrity::parse(&node.artifact.integrity).ok_or_else(|| {
            FetchError::InvalidIntegrity {
                name: node.label(),
                integrity: node.artifact.integrity.clone(),
            }
        })?;
        let key = expected.key();

        if let Some(entry) = self.store.lookup(&key) {
            trace!(package = %node.label(), "store hit");
            self.store_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        let _guard = self.store.lock(&key).await;
        // Another task may have published while we waited
        if let Some(entry) = self.store.lookup(&key) {
            trace!(package = %node.label(), "store hit after lock");
            self.store_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        let bytes = self.download(&node.artifact.url).await?;

        if let Err(actual) = expected.verify(&bytes) {
            warn!(package = %node.label(), expected = %expected, actual = %actual, "integrity mismatch");
            return Err(FetchError::IntegrityMismatch {
                name: node.label(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let entry = self.extract(node, &key, bytes).await?;
        debug!(package = %node.label(), key = %key, "materialized");
        Ok(entry)
    }

    async fn download(&self, url: &str) -> Result<Bytes, FetchError> {
        let mut attempt = 1;
        loop {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            match self.fetcher.fetch(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(TransportError::Permanent(message)) => {
                    return Err(FetchError::Download {
                        url: url.to_string(),
                        message,
                    });
                }
                Err(TransportError::Transient(message)) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(FetchError::NetworkFailure {
                            url: url.to_string(),
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(url, attempt, ?delay, error = %message, "retrying download");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn extract(
        &self,
        node: &ResolvedNode,
        key: &str,
        bytes: Bytes,
    ) -> Result<StoreEntry, FetchError> {
        let staging = self.store.staging_dir(key);
        let target = staging.clone();
        let unpacked = tokio::task::spawn_blocking(move || tarball::unpack(&bytes, &target)).await;

        let extracted = match unpacked {
            Ok(Ok(root)) => root,
            Ok(Err(e)) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(if e.code() == codes::PKG_EXTRACT_FAILED {
                    FetchError::CorruptArchive {
                        name: node.label(),
                        message: e.message().to_string(),
                    }
                } else {
                    FetchError::Store(e.to_string())
                });
            }
            Err(join) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(FetchError::Store(join.to_string()));
            }
        };

        self.store
            .publish(key, &extracted, &staging)
            .map_err(|e| FetchError::Store(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pkg::graph::{DependencyGraph, NodeId};
    use crate::pkg::integrity::HashAlgorithm;
    use crate::pkg::registry::ArtifactRef;
    use crate::pkg::tarball::tests::make_tgz;
    use semver::Version;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Fetcher that plays back a script, then repeats `fallback`.
    pub(crate) struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Bytes, TransportError>>>,
        fallback: Result<Bytes, TransportError>,
        delay: Duration,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        pub(crate) fn always(result: Result<Bytes, TransportError>) -> Self {
            Self::scripted(Vec::new(), result)
        }

        pub(crate) fn scripted(
            script: Vec<Result<Bytes, TransportError>>,
            fallback: Result<Bytes, TransportError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ArtifactFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for &RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn tgz() -> Vec<u8> {
        make_tgz(&[
            ("package/package.json", br#"{"name":"demo","version":"1.0.0"}"#),
            ("package/index.js", b"module.exports = 1;"),
        ])
    }

    fn node_for(bytes: &[u8]) -> (DependencyGraph, NodeId) {
        let mut graph = DependencyGraph::new();
        let integrity = Integrity::compute(HashAlgorithm::Sha512, bytes).to_string();
        let id = graph.add_node(
            "demo",
            Version::new(1, 0, 0),
            ArtifactRef {
                url: "https://r.example.com/demo-1.0.0.tgz".to_string(),
                integrity,
            },
            None,
        );
        (graph, id)
    }

    fn transient() -> Result<Bytes, TransportError> {
        Err(TransportError::Transient("connection reset".to_string()))
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(64), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_materialize_publishes_entry() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let bytes = tgz();
        let (graph, id) = node_for(&bytes);
        let fetcher = ScriptedFetcher::always(Ok(Bytes::from(bytes)));
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let entry = materializer.materialize(graph.node(id)).await.unwrap();

        assert!(entry.path.join("index.js").exists());
        assert_eq!(Some(entry.key.clone()), graph.node(id).store_key());
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(store.active_locks(), 0);
        assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_store_hit_skips_network() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let bytes = tgz();
        let (graph, id) = node_for(&bytes);
        let fetcher = ScriptedFetcher::always(Ok(Bytes::from(bytes)));
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let first = materializer.materialize(graph.node(id)).await.unwrap();
        let second = materializer.materialize(graph.node(id)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(materializer.store_hits(), 1);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_never_publishes() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let (graph, id) = node_for(&tgz());
        let tampered = make_tgz(&[("package/index.js", b"evil")]);
        let fetcher = ScriptedFetcher::always(Ok(Bytes::from(tampered)));
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let err = materializer.materialize(graph.node(id)).await.unwrap_err();

        assert_eq!(err.code(), codes::PKG_INTEGRITY_MISMATCH);
        let key = graph.node(id).store_key().unwrap();
        assert!(store.lookup(&key).is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_with_backoff() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let bytes = tgz();
        let (graph, id) = node_for(&bytes);
        let fetcher =
            ScriptedFetcher::scripted(vec![transient(), transient()], Ok(Bytes::from(bytes)));
        let sleeper = RecordingSleeper::default();
        let materializer =
            Materializer::new(&store, &fetcher, RetryPolicy::default()).with_sleeper(&sleeper);

        materializer.materialize(graph.node(id)).await.unwrap();

        assert_eq!(fetcher.calls(), 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            [Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[tokio::test]
    async fn test_retry_ceiling_gives_network_failure() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let (graph, id) = node_for(&tgz());
        let fetcher = ScriptedFetcher::always(transient());
        let sleeper = RecordingSleeper::default();
        let materializer =
            Materializer::new(&store, &fetcher, RetryPolicy::default()).with_sleeper(&sleeper);

        let err = materializer.materialize(graph.node(id)).await.unwrap_err();

        assert!(matches!(err, FetchError::NetworkFailure { attempts: 4, .. }));
        assert_eq!(fetcher.calls(), 4);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let (graph, id) = node_for(&tgz());
        let fetcher =
            ScriptedFetcher::always(Err(TransportError::Permanent("HTTP 404".to_string())));
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let err = materializer.materialize(graph.node(id)).await.unwrap_err();

        assert_eq!(err.code(), codes::PKG_DOWNLOAD_FAILED);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_archive() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let garbage = b"not a tarball at all".to_vec();
        let (graph, id) = node_for(&garbage);
        let fetcher = ScriptedFetcher::always(Ok(Bytes::from(garbage)));
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let err = materializer.materialize(graph.node(id)).await.unwrap_err();

        assert_eq!(err.code(), codes::PKG_ARCHIVE_CORRUPT);
        assert_eq!(fetcher.calls(), 1);
        assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_invalid_integrity() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let mut graph = DependencyGraph::new();
        let id = graph.add_node(
            "demo",
            Version::new(1, 0, 0),
            ArtifactRef {
                url: "https://r.example.com/demo.tgz".to_string(),
                integrity: "md5-abc".to_string(),
            },
            None,
        );
        let fetcher = ScriptedFetcher::always(transient());
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let err = materializer.materialize(graph.node(id)).await.unwrap_err();

        assert_eq!(err.code(), codes::PKG_INTEGRITY_INVALID);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_downloads_once() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let bytes = tgz();
        let (graph, id) = node_for(&bytes);
        let fetcher = ScriptedFetcher::always(Ok(Bytes::from(bytes)))
            .with_delay(Duration::from_millis(20));
        let materializer = Materializer::new(&store, &fetcher, RetryPolicy::default());

        let results = futures::future::join_all(
            (0..4).map(|_| materializer.materialize(graph.node(id))),
        )
        .await;

        assert_eq!(fetcher.calls(), 1);
        let paths: Vec<_> = results.into_iter().map(|r| r.unwrap().path).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.active_locks(), 0);
    }
}
