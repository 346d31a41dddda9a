//! Ledger - the task wrapper
//!
//! [`Ledger::call`] turns one invocation of a [`Task`] into one recorded run:
//!
//! 1. validate artifact arguments and fingerprint the call;
//! 2. consult the cache (see [`CachePolicy`]);
//! 3. create a `pending` run and allocate a fresh run directory;
//! 4. load artifact inputs and execute the callable under a `task_run` span;
//! 5. persist every returned object as an artifact owned by the run;
//! 6. commit status, outputs, log, groups and lineage edges in one write.
//!
//! A callable that errors or panics still leaves a committed `failed` run.
//! Its error is returned unchanged inside [`Error::TaskExecution`]; a panic
//! resumes unwinding once the run is recorded.
//!
//! [`Ledger::call_silent`] runs a task with its inputs resolved but records
//! nothing at all.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactStore, Codec, CodecRegistry, Object};
use crate::config::{CachePolicy, Config};
use crate::fingerprint::{fingerprint, provenance, record_arg};
use crate::lineage::{LineageEdge, LineageGraph};
use crate::notify::{LogNotifier, Notifier, RunEvent};
use crate::run::{
    run_dir_for, Binding, GitStatus, MemoryRegistry, NewRun, Run, RunCommit, RunId, RunRegistry,
    RunStatus, SqliteRegistry, REGISTRY_FILE,
};
use crate::task::{Arg, Args, Input, Inputs, Output, RunContext, Task};
use crate::{Error, Result};

/// Run metadata snapshot inside each run directory.
pub const META_FILE: &str = "meta.json";
/// Recorded input bindings inside each run directory.
pub const INPUTS_FILE: &str = "inputs.json";
/// Recorded output bindings inside each run directory.
pub const OUTPUTS_FILE: &str = "outputs.json";
/// Captured log inside each run directory.
pub const LOG_FILE: &str = "task.log";
/// Scratch directories of silent calls, under the storage root.
pub const SILENT_DIR: &str = "silent";

/// Result of [`Ledger::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Run that answers this call (the original run under `Reuse`)
    pub run_id: RunId,
    /// Returned value, every object replaced by its artifact handle
    pub output: Output<Artifact>,
    /// Prior run whose outputs were reused, on a cache hit
    pub cache_hit: Option<RunId>,
}

/// Why an execution attempt did not produce outputs.
enum Failure {
    /// The callable returned an error.
    Task(anyhow::Error),
    /// The callable panicked.
    Panic(Box<dyn Any + Send>),
    /// Bookkeeping around the callable failed.
    Ledger(Error),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Self::Ledger(err)
    }
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Self::Task(err) => format!("{err:#}"),
            Self::Panic(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            Self::Ledger(err) => err.to_string(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Outputs of a successful execution.
struct Executed {
    outputs: Output<Artifact>,
    groups: BTreeMap<String, Output<Artifact>>,
}

/// Builder for [`Ledger`].
pub struct LedgerBuilder {
    config: Config,
    registry: Option<Box<dyn RunRegistry>>,
    codecs: CodecRegistry,
    notifier: Option<Box<dyn Notifier>>,
}

impl LedgerBuilder {
    /// Use `registry` instead of the SQLite file under the storage root.
    #[must_use]
    pub fn registry(mut self, registry: impl RunRegistry + 'static) -> Self {
        self.registry = Some(Box::new(registry));
        self
    }

    /// Consult `codec` before the built-in codecs.
    ///
    /// # Errors
    /// `InvalidInput` if a codec with the same tag is already registered.
    pub fn codec(mut self, codec: impl Codec + 'static) -> Result<Self> {
        self.codecs.register_first(codec)?;
        Ok(self)
    }

    /// Replace the codec registry wholesale.
    #[must_use]
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Deliver run events to `notifier`.
    #[must_use]
    pub fn notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Some(Box::new(notifier));
        self
    }

    /// Open the storage root and rebuild the lineage index.
    ///
    /// # Errors
    /// `Io` if the storage root cannot be created, `Database` if the
    /// registry cannot be opened, `LineageOrder` if stored edges are
    /// inconsistent.
    pub fn build(self) -> Result<Ledger> {
        let root = &self.config.storage_dir;
        fs::create_dir_all(root)?;
        let registry: Box<dyn RunRegistry> = match self.registry {
            Some(registry) => registry,
            None => Box::new(SqliteRegistry::open(root.join(REGISTRY_FILE))?),
        };
        let graph = LineageGraph::from_edges(registry.edges()?)?;
        let notifier = self.notifier.or_else(|| {
            self.config
                .notify
                .then(|| Box::new(LogNotifier) as Box<dyn Notifier>)
        });
        info!(
            storage_dir = %root.display(),
            edges = graph.edge_count(),
            cache = ?self.config.cache,
            "opened ledger"
        );
        Ok(Ledger {
            store: ArtifactStore::new(root.clone(), self.codecs),
            config: self.config,
            registry,
            graph,
            notifier,
        })
    }
}

/// Entry point: wraps task invocations and answers lineage queries.
pub struct Ledger {
    config: Config,
    registry: Box<dyn RunRegistry>,
    store: ArtifactStore,
    graph: LineageGraph,
    notifier: Option<Box<dyn Notifier>>,
}

impl Ledger {
    /// Start configuring a ledger.
    #[must_use]
    pub fn builder(config: Config) -> LedgerBuilder {
        LedgerBuilder {
            config,
            registry: None,
            codecs: CodecRegistry::with_defaults(),
            notifier: None,
        }
    }

    /// Ledger backed by `registry.sqlite` under `config.storage_dir`.
    ///
    /// # Errors
    /// See [`LedgerBuilder::build`].
    pub fn open(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Ledger with an in-memory registry; artifacts still go to disk.
    ///
    /// # Errors
    /// See [`LedgerBuilder::build`].
    pub fn in_memory(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(Config::new(storage_dir))
            .registry(MemoryRegistry::new())
            .build()
    }

    /// Replace the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Some(Box::new(notifier));
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Artifact store rooted at the storage directory.
    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Lineage index as this handle last saw it. Traversal queries refresh
    /// it from the registry first, so edges committed through another handle
    /// on the same storage root are visible to them.
    #[must_use]
    pub const fn graph(&self) -> &LineageGraph {
        &self.graph
    }

    /// Fold every edge the registry knows into the index.
    pub(crate) fn sync_graph(&self) -> Result<()> {
        for edge in self.registry.edges()? {
            self.graph.record_edge(&edge)?;
        }
        Ok(())
    }

    /// Backing run registry.
    #[must_use]
    pub fn registry(&self) -> &dyn RunRegistry {
        self.registry.as_ref()
    }

    /// Invoke `task` with `args` and record the run.
    ///
    /// # Errors
    /// - `RunNotFound` / `InvalidInput` if an artifact argument does not come
    ///   from a known successful run (no run is created);
    /// - `TaskExecution` if the callable returned an error (run is `failed`);
    /// - `UnsupportedType`, `Corruption`, `ArtifactNotFound`, `RunDirExists`
    ///   or `Io` if bookkeeping around the callable failed (run is `failed`).
    ///
    /// # Panics
    /// Resumes a panic raised by the callable, after recording the run.
    pub fn call(&self, task: &Task, args: &Args) -> Result<Call> {
        let producers = self.producers(args)?;
        let fingerprint = fingerprint(task.name(), args.iter(), |artifact| {
            producers
                .get(&artifact.run_id())
                .map(provenance)
                .ok_or(Error::RunNotFound(artifact.run_id()))
        })?;
        let bindings = self.bindings(task, args)?;

        if let Some(prior) = self.cached(task, &fingerprint)? {
            match self.config.cache {
                CachePolicy::Reuse => {
                    info!(task = task.name(), cached = %prior.run_id(), "cache hit, reusing run");
                    return Ok(Call {
                        run_id: prior.run_id(),
                        output: prior.outputs().clone(),
                        cache_hit: Some(prior.run_id()),
                    });
                }
                CachePolicy::Replay => return self.replay(task, args, bindings, fingerprint, &prior),
                CachePolicy::Off => {}
            }
        }

        let run_id = self.registry.create(
            NewRun::new(task.name())
                .inputs(bindings)
                .fingerprint(fingerprint)
                .git(self.git_status()),
        )?;
        let span = info_span!("task_run", %run_id, task = task.name());
        let _enter = span.enter();
        debug!("created run");

        let edges = input_edges(run_id, args);
        let mut log = String::new();
        let mut dir_ready = false;
        match self.execute(task, args, run_id, &mut log, &mut dir_ready) {
            Ok(executed) => {
                if let Err(err) = self.write_run_file(run_id, LOG_FILE, log.as_bytes()) {
                    warn!(error = %err, "could not write task log");
                }
                let run = self.registry.commit(
                    run_id,
                    RunCommit::new(RunStatus::Success)
                        .outputs(executed.outputs.clone())
                        .log(log)
                        .edges(edges.clone())
                        .groups(executed.groups),
                )?;
                self.after_commit(&run, &edges)?;
                info!(outputs = executed.outputs.len(), "run succeeded");
                Ok(Call {
                    run_id,
                    output: executed.outputs,
                    cache_hit: None,
                })
            }
            Err(failure) => {
                let reason = failure.describe();
                warn!(error = %reason, "run failed");
                log.push_str("error: ");
                log.push_str(&reason);
                log.push('\n');
                self.record_failure(run_id, log, &edges, dir_ready);
                match failure {
                    Failure::Task(source) => Err(Error::TaskExecution {
                        run_id,
                        task: task.name().to_string(),
                        source,
                    }),
                    Failure::Ledger(err) => Err(err),
                    Failure::Panic(payload) => panic::resume_unwind(payload),
                }
            }
        }
    }

    /// Invoke `task` without recording anything.
    ///
    /// Artifact arguments are resolved as in [`call`](Self::call), honouring
    /// `skip_loading`. The callable sees [`UNRECORDED_RUN`] as its id and a
    /// fresh scratch directory under `silent/`. No run, edge, artifact or
    /// notification is produced, and the returned objects are handed back
    /// as they are.
    ///
    /// # Errors
    /// Whatever loading an input returns, or the callable's own error.
    ///
    /// [`UNRECORDED_RUN`]: crate::task::UNRECORDED_RUN
    pub fn call_silent(&self, task: &Task, args: &Args) -> anyhow::Result<Output<Object>> {
        let inputs = self.resolve(task, args)?;
        let scratch = self
            .store
            .root()
            .join(SILENT_DIR)
            .join(Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&scratch)?;

        let span = info_span!("task_silent", task = task.name());
        let _enter = span.enter();
        let mut ctx = RunContext::silent(task.name(), scratch, &self.store);
        let returned = task.invoke(&mut ctx, &inputs);
        let (log, _) = ctx.into_parts();
        debug!(log_bytes = log.len(), ok = returned.is_ok(), "silent call finished");
        returned
    }

    /// Producing runs of every artifact argument, which must have succeeded.
    fn producers(&self, args: &Args) -> Result<BTreeMap<RunId, Run>> {
        let mut producers = BTreeMap::new();
        for (name, artifact) in args.artifacts() {
            if producers.contains_key(&artifact.run_id()) {
                continue;
            }
            let run = self.registry.get(artifact.run_id())?;
            if run.status() != RunStatus::Success {
                return Err(Error::InvalidInput(format!(
                    "argument '{name}' comes from run {} which is {}",
                    run.run_id(),
                    run.status()
                )));
            }
            producers.insert(run.run_id(), run);
        }
        Ok(producers)
    }

    /// Artifact-bearing arguments are always recorded; `skip_recording`
    /// only hides plain data.
    fn bindings(&self, task: &Task, args: &Args) -> Result<BTreeMap<String, Binding>> {
        args.iter()
            .map(|(name, arg)| {
                let binding = if !task.records(name) && arg.artifacts().next().is_none() {
                    Binding::Skipped
                } else {
                    record_arg(arg, self.config.literal_limit_bytes)?
                };
                Ok((name.to_string(), binding))
            })
            .collect()
    }

    fn git_status(&self) -> Option<GitStatus> {
        if !self.config.record_git {
            return None;
        }
        let dir = self.config.git_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        GitStatus::capture(&dir)
    }

    /// Prior successful run with this fingerprint whose artifacts are intact.
    fn cached(&self, task: &Task, fingerprint: &str) -> Result<Option<Run>> {
        if self.config.cache == CachePolicy::Off {
            return Ok(None);
        }
        let Some(prior) = self.registry.find_cached(task.name(), fingerprint)? else {
            return Ok(None);
        };
        if let Some(missing) = prior.outputs().iter().find(|a| !self.store.exists(a)) {
            debug!(
                task = task.name(),
                cached = %prior.run_id(),
                missing = missing.path(),
                "cached artifacts missing, executing"
            );
            return Ok(None);
        }
        Ok(Some(prior))
    }

    /// Record a new run that answers the call with `prior`'s outputs.
    fn replay(
        &self,
        task: &Task,
        args: &Args,
        bindings: BTreeMap<String, Binding>,
        fingerprint: String,
        prior: &Run,
    ) -> Result<Call> {
        let run_id = self.registry.create(
            NewRun::new(task.name())
                .inputs(bindings)
                .fingerprint(fingerprint)
                .replay_of(prior.run_id())
                .git(self.git_status()),
        )?;
        let span = info_span!("task_run", %run_id, task = task.name());
        let _enter = span.enter();
        info!(cached = %prior.run_id(), "cache hit, recording replay");

        let edges = input_edges(run_id, args);
        let log = format!("replay of run {}\n", prior.run_id());
        let outputs = prior.outputs().clone();
        let mut dir_ready = false;
        let recorded = self.allocate_run_dir(run_id, &mut dir_ready).and_then(|_| {
            self.write_json(run_id, OUTPUTS_FILE, &outputs)?;
            self.write_run_file(run_id, LOG_FILE, log.as_bytes())
        });
        if let Err(err) = recorded {
            warn!(error = %err, "replay failed");
            self.record_failure(run_id, format!("{log}error: {err}\n"), &edges, dir_ready);
            return Err(err);
        }

        let run = self.registry.commit(
            run_id,
            RunCommit::new(RunStatus::Success)
                .outputs(outputs.clone())
                .log(log)
                .edges(edges.clone()),
        )?;
        self.after_commit(&run, &edges)?;
        Ok(Call {
            run_id,
            output: outputs,
            cache_hit: Some(prior.run_id()),
        })
    }

    fn execute(
        &self,
        task: &Task,
        args: &Args,
        run_id: RunId,
        log: &mut String,
        dir_ready: &mut bool,
    ) -> std::result::Result<Executed, Failure> {
        let run_dir = self.allocate_run_dir(run_id, dir_ready)?;
        let inputs = self.resolve(task, args)?;

        let mut ctx = RunContext::new(run_id, task.name(), run_dir, &self.store);
        let returned = panic::catch_unwind(AssertUnwindSafe(|| task.invoke(&mut ctx, &inputs)));
        let (captured, groups) = ctx.into_parts();
        log.push_str(&captured);
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }

        let output = match returned {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(Failure::Task(err)),
            Err(payload) => return Err(Failure::Panic(payload)),
        };
        let outputs = output.try_map_ref(|obj| self.store.put(obj, run_id))?;
        self.write_json(run_id, OUTPUTS_FILE, &outputs)?;
        Ok(Executed { outputs, groups })
    }

    fn resolve(&self, task: &Task, args: &Args) -> Result<Inputs> {
        let mut inputs = Inputs::default();
        for (name, arg) in args.iter() {
            inputs.insert(name, self.resolve_arg(arg, task.loads(name))?);
        }
        Ok(inputs)
    }

    /// Artifact-free subtrees arrive as one literal.
    fn resolve_arg(&self, arg: &Arg, load: bool) -> Result<Input> {
        if let Some(value) = arg.to_value() {
            return Ok(Input::Literal(value));
        }
        Ok(match arg {
            Arg::Literal(value) => Input::Literal(value.clone()),
            Arg::Artifact(artifact) if load => Input::Value(self.store.load(artifact)?),
            Arg::Artifact(artifact) => Input::Handle(artifact.clone()),
            Arg::Seq(items) => Input::Seq(
                items
                    .iter()
                    .map(|item| self.resolve_arg(item, load))
                    .collect::<Result<_>>()?,
            ),
            Arg::Map(items) => Input::Map(
                items
                    .iter()
                    .map(|(k, v)| self.resolve_arg(v, load).map(|input| (k.clone(), input)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Create `runs/<id>` (it must not exist yet) and snapshot the pending
    /// record into it. `dir_ready` flips as soon as the directory exists.
    fn allocate_run_dir(&self, run_id: RunId, dir_ready: &mut bool) -> Result<PathBuf> {
        let dir = self.store.root().join(run_dir_for(run_id));
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::create_dir(&dir) {
            Ok(()) => *dir_ready = true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::RunDirExists(dir)),
            Err(e) => return Err(e.into()),
        }
        let run = self.registry.get(run_id)?;
        self.write_json(run_id, META_FILE, &run)?;
        self.write_json(run_id, INPUTS_FILE, run.inputs())?;
        Ok(dir)
    }

    fn write_json<T: Serialize + ?Sized>(&self, run_id: RunId, file: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_run_file(run_id, file, &bytes)
    }

    fn write_run_file(&self, run_id: RunId, file: &str, bytes: &[u8]) -> Result<()> {
        let path = self.run_dir_path(run_id).join(file);
        fs::write(path, bytes)?;
        Ok(())
    }

    fn run_dir_path(&self, run_id: RunId) -> PathBuf {
        self.store.root().join(run_dir_for(run_id))
    }

    /// Commit `run_id` as failed. Errors are logged, not returned, so the
    /// caller still sees the original failure.
    fn record_failure(&self, run_id: RunId, log: String, edges: &[LineageEdge], dir_ready: bool) {
        if dir_ready {
            if let Err(err) = self.write_run_file(run_id, LOG_FILE, log.as_bytes()) {
                warn!(%run_id, error = %err, "could not write task log");
            }
        }
        let committed = self
            .registry
            .commit(
                run_id,
                RunCommit::new(RunStatus::Failed)
                    .log(log)
                    .edges(edges.to_vec()),
            )
            .and_then(|run| self.after_commit(&run, edges));
        if let Err(err) = committed {
            warn!(%run_id, error = %err, "could not record failed run");
        }
    }

    fn after_commit(&self, run: &Run, edges: &[LineageEdge]) -> Result<()> {
        for edge in edges {
            self.graph.record_edge(edge)?;
        }
        if let Some(notifier) = &self.notifier {
            notifier.notify(&RunEvent {
                run_id: run.run_id(),
                task_name: run.task_name().to_string(),
                status: run.status(),
            });
        }
        Ok(())
    }
}

/// One edge per distinct artifact argument.
fn input_edges(consumer: RunId, args: &Args) -> Vec<LineageEdge> {
    args.artifacts()
        .map(|(_, artifact)| LineageEdge::new(artifact.run_id(), consumer, artifact.path()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.config)
            .field("edges", &self.graph.edge_count())
            .field("notify", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

/// Location of `file` inside the directory of `run_id`.
#[must_use]
pub fn run_file(storage_dir: &Path, run_id: RunId, file: &str) -> PathBuf {
    storage_dir.join(run_dir_for(run_id)).join(file)
}
