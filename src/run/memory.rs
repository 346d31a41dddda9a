//! In-memory run registry using `DashMap`.
//!
//! Data is lost on process restart. For persistence, use `SqliteRegistry`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::registry::check_commit;
use super::{NewRun, Run, RunCommit, RunFilter, RunId, RunRegistry, RunStatus};
use crate::lineage::LineageEdge;
use crate::task::Output;
use crate::{Artifact, Error, Result};

/// A run plus the data committed alongside it.
///
/// Edges and groups live in the consumer's entry so that a commit touches a
/// single map entry and is observed atomically.
#[derive(Debug, Clone)]
struct Entry {
    run: Run,
    log: String,
    edges: Vec<LineageEdge>,
    groups: BTreeMap<String, Output<Artifact>>,
}

/// In-memory run registry.
///
/// Thread-safe; ids come from an atomic counter so they are unique and
/// strictly increasing within the process.
///
/// # Example
///
/// ```rust
/// use trueno_lineage::run::{MemoryRegistry, NewRun, RunRegistry, RunStatus};
///
/// # fn example() -> trueno_lineage::Result<()> {
/// let registry = MemoryRegistry::new();
/// let run_id = registry.create(NewRun::new("download"))?;
/// assert_eq!(registry.get(run_id)?.status(), RunStatus::Pending);
/// # Ok(())
/// # }
/// ```
pub struct MemoryRegistry {
    runs: DashMap<RunId, Entry>,
    next_id: AtomicU64,
}

impl MemoryRegistry {
    /// Create a new in-memory registry. The first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the number of recorded runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Check if no run was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry for MemoryRegistry {
    fn create(&self, new: NewRun) -> Result<RunId> {
        let run_id = RunId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.runs.insert(
            run_id,
            Entry {
                run: Run::pending(run_id, new),
                log: String::new(),
                edges: Vec::new(),
                groups: BTreeMap::new(),
            },
        );
        Ok(run_id)
    }

    fn commit(&self, run_id: RunId, commit: RunCommit) -> Result<Run> {
        check_commit(run_id, &commit)?;
        // Producers are checked before taking the entry's shard lock; runs are
        // never removed, so the answer cannot change underneath us.
        for edge in &commit.edges {
            if !self.runs.contains_key(&edge.producer) {
                return Err(Error::RunNotFound(edge.producer));
            }
        }
        let mut entry = self.runs.get_mut(&run_id).ok_or(Error::RunNotFound(run_id))?;
        if entry.run.status() != RunStatus::Pending {
            return Err(Error::AlreadyCommitted(run_id));
        }
        entry.run.apply(&commit);
        entry.log = commit.log;
        entry.edges = commit.edges;
        entry.groups = commit.groups;
        Ok(entry.run.clone())
    }

    fn get(&self, run_id: RunId) -> Result<Run> {
        self.runs
            .get(&run_id)
            .map(|e| e.run.clone())
            .ok_or(Error::RunNotFound(run_id))
    }

    fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|e| filter.matches(&e.run))
            .map(|e| e.run.clone())
            .collect();
        runs.sort_by_key(Run::run_id);
        Ok(runs)
    }

    fn log(&self, run_id: RunId) -> Result<String> {
        self.runs
            .get(&run_id)
            .map(|e| e.log.clone())
            .ok_or(Error::RunNotFound(run_id))
    }

    fn group(&self, run_id: RunId, group: &str) -> Result<Output<Artifact>> {
        let entry = self.runs.get(&run_id).ok_or(Error::RunNotFound(run_id))?;
        entry
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| Error::ArtifactNotFound(format!("group '{group}' of run {run_id}")))
    }

    fn edges(&self) -> Result<Vec<LineageEdge>> {
        let mut edges: Vec<LineageEdge> = self
            .runs
            .iter()
            .flat_map(|e| e.edges.clone())
            .collect();
        edges.sort();
        Ok(edges)
    }

    fn find_cached(&self, task_name: &str, fingerprint: &str) -> Result<Option<Run>> {
        Ok(self
            .runs
            .iter()
            .filter(|e| {
                e.run.task_name() == task_name
                    && e.run.status() == RunStatus::Success
                    && e.run.replay_of().is_none()
                    && e.run.fingerprint() == Some(fingerprint)
            })
            .map(|e| e.run.clone())
            .max_by_key(Run::run_id))
    }
}
