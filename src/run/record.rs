//! Run Record - one recorded invocation of a task

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::git::GitStatus;
use crate::artifact::Artifact;
use crate::task::Output;
use crate::Error;

/// Process-wide, persisted, strictly increasing run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(u64);

impl RunId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw integer value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run.
///
/// A run is created `Pending` and leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, callable not finished yet.
    Pending,
    /// Callable returned and every output was persisted.
    Success,
    /// Callable raised, panicked, or an output could not be persisted.
    Failed,
}

impl RunStatus {
    /// Registry spelling of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// True once the run has left `Pending`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown run status '{other}'"))),
        }
    }
}

/// How one input parameter was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    /// Small literal, embedded verbatim.
    Literal {
        /// The value
        value: serde_json::Value,
    },
    /// Literal too large to embed; only its size and digest are kept.
    Summary {
        /// Size of the canonical JSON encoding
        bytes: usize,
        /// blake3 digest of the canonical JSON encoding
        digest: String,
    },
    /// Reference to an artifact produced by an earlier run.
    Artifact {
        /// The handle
        artifact: Artifact,
    },
    /// Excluded from recording by the task definition.
    Skipped,
    /// Ordered container holding at least one artifact.
    Seq {
        /// Element bindings
        items: Vec<Binding>,
    },
    /// Keyed container holding at least one artifact.
    Map {
        /// Entry bindings
        entries: BTreeMap<String, Binding>,
    },
}

impl Binding {
    /// Every artifact referenced by this binding, depth first.
    pub fn artifacts(&self) -> Box<dyn Iterator<Item = &Artifact> + '_> {
        match self {
            Self::Artifact { artifact } => Box::new(std::iter::once(artifact)),
            Self::Seq { items } => Box::new(items.iter().flat_map(Self::artifacts)),
            Self::Map { entries } => Box::new(entries.values().flat_map(Self::artifacts)),
            Self::Literal { .. } | Self::Summary { .. } | Self::Skipped => Box::new(std::iter::empty()),
        }
    }
}

/// Host and process facts captured when a run is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    /// Host name, if one can be determined
    pub hostname: Option<String>,
    /// `os/arch`
    pub platform: String,
    /// Process id of the invoking process
    pub pid: u32,
    /// trueno-lineage version that recorded the run
    pub version: String,
    /// Batch scheduler job id (`SLURM_JOB_ID`), if any
    pub job_id: Option<String>,
    /// Free-form caller annotations
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
    /// Source-control state of the invoking checkout, when recorded
    #[serde(default)]
    pub git: Option<GitStatus>,
}

impl RunMeta {
    /// Snapshot the current process environment.
    ///
    /// Git state is left empty; the ledger fills it per call.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            hostname: hostname(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            job_id: std::env::var("SLURM_JOB_ID").ok(),
            tags: BTreeMap::new(),
            git: None,
        }
    }
}

/// Host name of this machine, looked up once per process.
///
/// Tries the kernel, then `HOSTNAME`/`COMPUTERNAME`, then the `hostname`
/// command.
#[must_use]
pub fn hostname() -> Option<String> {
    static HOSTNAME: OnceLock<Option<String>> = OnceLock::new();
    HOSTNAME
        .get_or_init(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .and_then(non_empty)
                .or_else(|| std::env::var("HOSTNAME").ok().and_then(non_empty))
                .or_else(|| std::env::var("COMPUTERNAME").ok().and_then(non_empty))
                .or_else(|| {
                    Command::new("hostname")
                        .output()
                        .ok()
                        .filter(|out| out.status.success())
                        .and_then(|out| non_empty(String::from_utf8_lossy(&out.stdout).into_owned()))
                })
        })
        .clone()
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// A recorded invocation of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    run_id: RunId,
    task_name: String,
    status: RunStatus,
    inputs: BTreeMap<String, Binding>,
    outputs: Output<Artifact>,
    fingerprint: Option<String>,
    replay_of: Option<RunId>,
    meta: RunMeta,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Build the `Pending` record for a freshly allocated id.
    #[must_use]
    pub fn pending(run_id: RunId, new: NewRun) -> Self {
        Self {
            run_id,
            task_name: new.task_name,
            status: RunStatus::Pending,
            inputs: new.inputs,
            outputs: Output::None,
            fingerprint: new.fingerprint,
            replay_of: new.replay_of,
            meta: new.meta,
            started_at: new.started_at,
            ended_at: None,
        }
    }

    /// Apply a commit. Callers check the `Pending` precondition.
    pub(crate) fn apply(&mut self, commit: &RunCommit) {
        self.status = commit.status;
        self.outputs = commit.outputs.clone();
        self.ended_at = Some(commit.ended_at);
    }

    /// Get the run ID.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Get the qualified task name.
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Get the current run status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Recorded input bindings, by parameter name.
    #[must_use]
    pub const fn inputs(&self) -> &BTreeMap<String, Binding> {
        &self.inputs
    }

    /// Recorded output bindings (`Output::None` until committed).
    #[must_use]
    pub const fn outputs(&self) -> &Output<Artifact> {
        &self.outputs
    }

    /// Cache fingerprint computed at invocation time.
    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// The run whose outputs this run replayed, if it was a cache replay.
    #[must_use]
    pub const fn replay_of(&self) -> Option<RunId> {
        self.replay_of
    }

    /// Host/process metadata.
    #[must_use]
    pub const fn meta(&self) -> &RunMeta {
        &self.meta
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Completion timestamp, once committed.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Run directory relative to the storage root.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        run_dir_for(self.run_id)
    }
}

/// Relative run directory for an id: `runs/<id>`.
#[must_use]
pub fn run_dir_for(run_id: RunId) -> PathBuf {
    PathBuf::from("runs").join(run_id.to_string())
}

/// Everything the registry needs to create a `Pending` run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Qualified task name
    pub task_name: String,
    /// Recorded input bindings
    pub inputs: BTreeMap<String, Binding>,
    /// Cache fingerprint
    pub fingerprint: Option<String>,
    /// Original run when this is a cache replay
    pub replay_of: Option<RunId>,
    /// Host/process metadata
    pub meta: RunMeta,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
}

impl NewRun {
    /// A minimal draft with no inputs, stamped now.
    #[must_use]
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            inputs: BTreeMap::new(),
            fingerprint: None,
            replay_of: None,
            meta: RunMeta::capture(),
            started_at: Utc::now(),
        }
    }

    /// Attach input bindings.
    #[must_use]
    pub fn inputs(mut self, inputs: BTreeMap<String, Binding>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Attach a fingerprint.
    #[must_use]
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Mark as a replay of `original`.
    #[must_use]
    pub const fn replay_of(mut self, original: RunId) -> Self {
        self.replay_of = Some(original);
        self
    }

    /// Attach source-control state.
    #[must_use]
    pub fn git(mut self, git: Option<GitStatus>) -> Self {
        self.meta.git = git;
        self
    }
}

/// The single transition out of `Pending`.
#[derive(Debug, Clone)]
pub struct RunCommit {
    /// Final status (`Success` or `Failed`)
    pub status: RunStatus,
    /// Output bindings (`Output::None` for failed runs)
    pub outputs: Output<Artifact>,
    /// Captured log text
    pub log: String,
    /// Edges from this run to the producers of its artifact inputs
    pub edges: Vec<crate::lineage::LineageEdge>,
    /// Extra artifact groups dumped by the callable
    pub groups: BTreeMap<String, Output<Artifact>>,
    /// Completion timestamp
    pub ended_at: DateTime<Utc>,
}

impl RunCommit {
    /// Commit with the given status and nothing else attached.
    #[must_use]
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            outputs: Output::None,
            log: String::new(),
            edges: Vec::new(),
            groups: BTreeMap::new(),
            ended_at: Utc::now(),
        }
    }

    /// Attach outputs.
    #[must_use]
    pub fn outputs(mut self, outputs: Output<Artifact>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Attach the captured log.
    #[must_use]
    pub fn log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    /// Attach lineage edges.
    #[must_use]
    pub fn edges(mut self, edges: Vec<crate::lineage::LineageEdge>) -> Self {
        self.edges = edges;
        self
    }

    /// Attach artifact groups.
    #[must_use]
    pub fn groups(mut self, groups: BTreeMap<String, Output<Artifact>>) -> Self {
        self.groups = groups;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_default() {
        let run = Run::pending(RunId::new(1), NewRun::new("download"));
        assert_eq!(run.status(), RunStatus::Pending);
        assert!(run.ended_at().is_none());
        assert_eq!(run.outputs(), &Output::None);
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::pending(RunId::new(1), NewRun::new("download"));
        run.apply(&RunCommit::new(RunStatus::Success));
        assert_eq!(run.status(), RunStatus::Success);
        assert!(run.ended_at().unwrap() >= run.started_at());
    }

    #[test]
    fn test_status_parse() {
        for status in [RunStatus::Pending, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("interrupted".parse::<RunStatus>().is_err());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_run_dir_layout() {
        assert_eq!(run_dir_for(RunId::new(42)), PathBuf::from("runs/42"));
    }

    #[test]
    fn test_binding_serialization_is_tagged() {
        let json = serde_json::to_value(Binding::Skipped).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "skipped"}));
    }

    #[test]
    fn test_nested_binding_artifacts() {
        let handle = |run: u64| -> Artifact {
            serde_json::from_value(serde_json::json!({
                "run_id": run, "path": format!("runs/{run}/artifacts/x.json"),
                "codec": "json", "digest": format!("d{run}"),
            }))
            .unwrap()
        };
        let (a, b) = (handle(1), handle(2));
        let binding = Binding::Map {
            entries: BTreeMap::from([
                ("k".to_string(), Binding::Literal { value: serde_json::json!(1) }),
                (
                    "xs".to_string(),
                    Binding::Seq {
                        items: vec![Binding::Artifact { artifact: a.clone() }, Binding::Artifact { artifact: b.clone() }],
                    },
                ),
            ]),
        };
        assert_eq!(binding.artifacts().cloned().collect::<Vec<_>>(), vec![a, b]);

        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["kind"], "map");
        assert_eq!(json["entries"]["xs"]["kind"], "seq");
        assert_eq!(serde_json::from_value::<Binding>(json).unwrap(), binding);
    }

    #[test]
    fn test_meta_captures_host() {
        let meta = RunMeta::capture();
        assert_eq!(meta.pid, std::process::id());
        assert!(meta.git.is_none());
        #[cfg(target_os = "linux")]
        if let Ok(kernel) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
            assert_eq!(meta.hostname.as_deref(), Some(kernel.trim()));
        }
    }

    #[test]
    fn test_meta_without_git_deserializes() {
        let json = serde_json::json!({
            "hostname": null, "platform": "linux/x86_64", "pid": 1,
            "version": "0.1.0", "job_id": null,
        });
        let meta: RunMeta = serde_json::from_value(json).unwrap();
        assert!(meta.git.is_none());
        assert!(meta.tags.is_empty());
    }
}
