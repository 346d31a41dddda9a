//! Run Registry - append-only metadata store for runs
//!
//! The registry is the single source of truth for run metadata and lineage
//! edges. Mutation is limited to creating runs and committing each run
//! exactly once; both operations are atomic with respect to readers.

use super::{NewRun, Run, RunCommit, RunId, RunStatus};
use crate::lineage::LineageEdge;
use crate::task::Output;
use crate::{Artifact, Result};

/// Filter for [`RunRegistry::list`]. Empty filter matches every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Only runs of this task
    pub task_name: Option<String>,
    /// Only runs in this status
    pub status: Option<RunStatus>,
}

impl RunFilter {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one task.
    #[must_use]
    pub fn task(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    /// Restrict to one status.
    #[must_use]
    pub const fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Does `run` pass this filter?
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        self.task_name
            .as_deref()
            .map_or(true, |name| name == run.task_name())
            && self.status.map_or(true, |status| status == run.status())
    }
}

/// Backing store for run metadata.
///
/// Implementations must allocate strictly increasing, never reused ids and
/// apply each `create`/`commit` as a single atomic write.
pub trait RunRegistry: Send + Sync {
    /// Allocate a new id and persist the run as `Pending`.
    ///
    /// # Errors
    /// Returns error if the backing store rejects the write.
    fn create(&self, new: NewRun) -> Result<RunId>;

    /// Transition a `Pending` run to its final status, together with its
    /// outputs, log, lineage edges and artifact groups.
    ///
    /// # Errors
    /// `InvalidInput` if the commit status is `Pending`, `RunNotFound` for an
    /// unknown id, `AlreadyCommitted` if the run left `Pending` before,
    /// `LineageOrder` if an edge does not point to an earlier run.
    fn commit(&self, run_id: RunId, commit: RunCommit) -> Result<Run>;

    /// Fetch one run.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown id.
    fn get(&self, run_id: RunId) -> Result<Run>;

    /// Runs matching `filter`, ordered by ascending id.
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read.
    fn list(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Captured log text (empty while the run is `Pending`).
    ///
    /// # Errors
    /// `RunNotFound` for an unknown id.
    fn log(&self, run_id: RunId) -> Result<String>;

    /// A named artifact group dumped by the run.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown id, `ArtifactNotFound` for an unknown group.
    fn group(&self, run_id: RunId, group: &str) -> Result<Output<Artifact>>;

    /// Every recorded lineage edge, ordered by consumer id.
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read.
    fn edges(&self) -> Result<Vec<LineageEdge>>;

    /// Most recent original (non-replay) successful run of `task_name` with
    /// this fingerprint.
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read.
    fn find_cached(&self, task_name: &str, fingerprint: &str) -> Result<Option<Run>>;

    /// Highest id recorded for `task_name`, if any.
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read.
    fn last_run_id(&self, task_name: &str) -> Result<Option<RunId>> {
        Ok(self
            .list(&RunFilter::all().task(task_name))?
            .last()
            .map(Run::run_id))
    }
}

/// Validate a commit before any state is touched: the status must be
/// terminal and every edge must respect id ordering.
pub(crate) fn check_commit(run_id: RunId, commit: &RunCommit) -> Result<()> {
    if !commit.status.is_terminal() {
        return Err(crate::Error::InvalidInput(format!(
            "run {run_id} cannot be committed as {}",
            commit.status
        )));
    }
    check_edges(run_id, &commit.edges)
}

/// Reject edges that would break the monotonic-id ordering.
pub(crate) fn check_edges(consumer: RunId, edges: &[LineageEdge]) -> Result<()> {
    for edge in edges {
        if edge.consumer != consumer || edge.producer >= edge.consumer {
            return Err(crate::Error::LineageOrder {
                producer: edge.producer,
                consumer: edge.consumer,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let run = Run::pending(RunId::new(1), NewRun::new("download"));
        assert!(RunFilter::all().matches(&run));
        assert!(RunFilter::all().task("download").matches(&run));
        assert!(!RunFilter::all().task("split").matches(&run));
        assert!(RunFilter::all().status(RunStatus::Pending).matches(&run));
        assert!(!RunFilter::all().status(RunStatus::Success).matches(&run));
    }

    #[test]
    fn test_check_edges_rejects_forward_edges() {
        let edge = LineageEdge::new(RunId::new(5), RunId::new(3), "runs/5/artifacts/a.json");
        assert!(matches!(
            check_edges(RunId::new(3), &[edge]),
            Err(crate::Error::LineageOrder { .. })
        ));
        let edge = LineageEdge::new(RunId::new(2), RunId::new(3), "runs/2/artifacts/a.json");
        assert!(check_edges(RunId::new(3), &[edge]).is_ok());
    }

    #[test]
    fn test_check_commit_requires_terminal_status() {
        let id = RunId::new(1);
        assert!(matches!(
            check_commit(id, &RunCommit::new(RunStatus::Pending)),
            Err(crate::Error::InvalidInput(_))
        ));
        assert!(check_commit(id, &RunCommit::new(RunStatus::Success)).is_ok());
        assert!(check_commit(id, &RunCommit::new(RunStatus::Failed)).is_ok());
    }
}
