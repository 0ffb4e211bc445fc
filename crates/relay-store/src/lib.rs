//! In-memory artifact store for Relay CI.
//!
//! Artifacts are byte blobs keyed by `(producing job, path)`, ephemeral
//! per run. Reads are gated by the reader's transitive dependency closure,
//! fixed at construction from the execution graph: a job can only consume
//! artifacts of jobs it (transitively) depends on. Each producer writes
//! its own keys exactly once, so concurrent workers never contend on a
//! key; reads happen only after the scheduler has observed the producer's
//! completion.

use relay_core::ids::JobId;
use relay_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

pub struct ArtifactStore {
    blobs: RwLock<HashMap<(JobId, String), Vec<u8>>>,
    /// Transitive dependency closure per job, indexed like the pipeline's
    /// job list.
    closures: Vec<HashSet<JobId>>,
    /// Job names for diagnostics, indexed the same way.
    names: Vec<String>,
}

impl ArtifactStore {
    /// `closures[j]` must hold every job that job `j` transitively
    /// depends on; `names[j]` the matching job name.
    pub fn new(closures: Vec<HashSet<JobId>>, names: Vec<String>) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            closures,
            names,
        }
    }

    fn name(&self, job: JobId) -> String {
        self.names
            .get(job.index())
            .cloned()
            .unwrap_or_else(|| job.to_string())
    }

    /// Publish an artifact produced by `producer`.
    pub async fn put(&self, producer: JobId, path: impl Into<String>, bytes: Vec<u8>) {
        let path = path.into();
        debug!(producer = %self.name(producer), %path, size = bytes.len(), "artifact stored");
        self.blobs.write().await.insert((producer, path), bytes);
    }

    /// Read one artifact on behalf of `reader`.
    ///
    /// Fails with [`Error::Scope`] when `producer` is outside `reader`'s
    /// dependency closure, so hidden coupling between unrelated jobs is a
    /// hard error instead of an accident.
    pub async fn get(&self, reader: JobId, producer: JobId, path: &str) -> Result<Vec<u8>> {
        if !self.in_closure(reader, producer) {
            return Err(Error::Scope {
                job: self.name(reader),
                producer: self.name(producer),
                path: path.to_string(),
            });
        }
        self.blobs
            .read()
            .await
            .get(&(producer, path.to_string()))
            .cloned()
            .ok_or_else(|| Error::ArtifactNotFound {
                job: self.name(producer),
                path: path.to_string(),
            })
    }

    /// All artifacts visible to `reader`: everything its transitive
    /// dependencies produced.
    pub async fn visible_to(&self, reader: JobId) -> Vec<(JobId, String, Vec<u8>)> {
        let closure = match self.closures.get(reader.index()) {
            Some(c) => c,
            None => return Vec::new(),
        };
        let blobs = self.blobs.read().await;
        let mut visible: Vec<_> = blobs
            .iter()
            .filter(|((producer, _), _)| closure.contains(producer))
            .map(|((producer, path), bytes)| (*producer, path.clone(), bytes.clone()))
            .collect();
        // Stable staging order regardless of map iteration.
        visible.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        visible
    }

    fn in_closure(&self, reader: JobId, producer: JobId) -> bool {
        self.closures
            .get(reader.index())
            .is_some_and(|c| c.contains(&producer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// build(0) <- test(1) <- deploy(2), lint(3) independent.
    fn store() -> ArtifactStore {
        let closures = vec![
            HashSet::new(),
            HashSet::from([JobId(0)]),
            HashSet::from([JobId(0), JobId(1)]),
            HashSet::new(),
        ];
        let names = ["build", "test", "deploy", "lint"]
            .map(String::from)
            .to_vec();
        ArtifactStore::new(closures, names)
    }

    #[tokio::test]
    async fn direct_and_transitive_dependents_can_read() {
        let store = store();
        store.put(JobId(0), "bin", b"blob".to_vec()).await;

        let direct = store.get(JobId(1), JobId(0), "bin").await.unwrap();
        assert_eq!(direct, b"blob");

        let transitive = store.get(JobId(2), JobId(0), "bin").await.unwrap();
        assert_eq!(transitive, b"blob");
    }

    #[tokio::test]
    async fn read_outside_closure_is_a_scope_error() {
        let store = store();
        store.put(JobId(0), "bin", b"blob".to_vec()).await;

        let err = store.get(JobId(3), JobId(0), "bin").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Scope { job, producer, path }
                if job == "lint" && producer == "build" && path == "bin"
        ));
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let store = store();
        let err = store.get(JobId(1), JobId(0), "absent").await.unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn visible_to_is_limited_to_the_closure() {
        let store = store();
        store.put(JobId(0), "bin", b"a".to_vec()).await;
        store.put(JobId(1), "report.xml", b"b".to_vec()).await;
        store.put(JobId(3), "lint.log", b"c".to_vec()).await;

        let visible = store.visible_to(JobId(2)).await;
        let paths: Vec<&str> = visible.iter().map(|(_, p, _)| p.as_str()).collect();
        assert_eq!(paths, ["bin", "report.xml"]);

        assert!(store.visible_to(JobId(3)).await.is_empty());
    }
}
