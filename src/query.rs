//! Query Layer - read-only views over recorded runs
//!
//! Every query takes a run id and fails with `RunNotFound` when
//! the registry does not know it. Nothing here loads artifact bytes except
//! the explicit `load*` helpers.

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, Object};
use crate::ledger::Ledger;
use crate::lineage::Order;
use crate::run::{Binding, Run, RunFilter, RunId};
use crate::task::Output;
use crate::Result;

/// An input binding as reported by [`Ledger::inp`].
///
/// Artifact inputs are reported by provenance (producing run and path)
/// rather than by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
    /// Literal value, as recorded.
    Literal {
        /// The value
        value: serde_json::Value,
    },
    /// Literal that was too large to record.
    Summary {
        /// Size of its canonical JSON encoding
        bytes: usize,
        /// blake3 digest of its canonical JSON encoding
        digest: String,
    },
    /// Artifact produced by an earlier run.
    Artifact {
        /// Producing run
        run_id: RunId,
        /// Path relative to the storage root
        path: String,
    },
    /// Not recorded (`skip_recording`).
    Skipped,
    /// Container holding artifacts, elements resolved.
    Seq {
        /// Elements
        items: Vec<InputRef>,
    },
    /// Keyed container holding artifacts, entries resolved.
    Map {
        /// Entries
        entries: BTreeMap<String, InputRef>,
    },
}

impl From<&Binding> for InputRef {
    fn from(binding: &Binding) -> Self {
        match binding {
            Binding::Literal { value } => Self::Literal {
                value: value.clone(),
            },
            Binding::Summary { bytes, digest } => Self::Summary {
                bytes: *bytes,
                digest: digest.clone(),
            },
            Binding::Artifact { artifact } => Self::Artifact {
                run_id: artifact.run_id(),
                path: artifact.path().to_string(),
            },
            Binding::Skipped => Self::Skipped,
            Binding::Seq { items } => Self::Seq {
                items: items.iter().map(Self::from).collect(),
            },
            Binding::Map { entries } => Self::Map {
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            },
        }
    }
}

/// The artifacts of one binding, keeping container shape.
fn artifact_tree(binding: &Binding) -> Output<Artifact> {
    match binding {
        Binding::Artifact { artifact } => Output::One(artifact.clone()),
        Binding::Seq { items } => Output::Seq(items.iter().map(artifact_tree).collect()),
        Binding::Map { entries } => Output::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), artifact_tree(v)))
                .collect(),
        ),
        Binding::Literal { value } => Output::Literal(value.clone()),
        Binding::Summary { .. } | Binding::Skipped => Output::None,
    }
}

impl Ledger {
    /// Recorded inputs of a run, artifacts resolved to their producers.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn inp(&self, run_id: RunId) -> Result<BTreeMap<String, InputRef>> {
        let run = self.registry().get(run_id)?;
        Ok(run
            .inputs()
            .iter()
            .map(|(name, binding)| (name.clone(), InputRef::from(binding)))
            .collect())
    }

    /// Output artifacts of a run (`Output::None` while pending or failed).
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn out(&self, run_id: RunId) -> Result<Output<Artifact>> {
        Ok(self.registry().get(run_id)?.outputs().clone())
    }

    /// Full run record.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn get_meta(&self, run_id: RunId) -> Result<Run> {
        self.registry().get(run_id)
    }

    /// Captured log text.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn get_log(&self, run_id: RunId) -> Result<String> {
        self.registry().log(run_id)
    }

    /// A named artifact group. `outputs` answers with the run's outputs and
    /// `inputs` with the parameters that carried artifacts, by name.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run, `ArtifactNotFound` for an unknown
    /// group.
    pub fn get_artifacts(&self, run_id: RunId, group: &str) -> Result<Output<Artifact>> {
        match group {
            "outputs" => self.out(run_id),
            "inputs" => {
                let run = self.registry().get(run_id)?;
                Ok(Output::Map(
                    run.inputs()
                        .iter()
                        .filter(|(_, binding)| binding.artifacts().next().is_some())
                        .map(|(name, binding)| (name.clone(), artifact_tree(binding)))
                        .collect(),
                ))
            }
            _ => self.registry().group(run_id, group),
        }
    }

    /// Every run `run_id` transitively depends on, consumers before
    /// producers.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn ancestors(&self, run_id: RunId) -> Result<Vec<Run>> {
        self.ancestors_ordered(run_id, Order::ReverseTopological)
    }

    /// [`ancestors`](Self::ancestors) in the requested order.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn ancestors_ordered(&self, run_id: RunId, order: Order) -> Result<Vec<Run>> {
        self.registry().get(run_id)?;
        self.sync_graph()?;
        self.graph()
            .ancestors(run_id, order)
            .iter()
            .map(|id| self.registry().get(id))
            .collect()
    }

    /// Every run that transitively depends on `run_id`, producers before
    /// consumers.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn descendants(&self, run_id: RunId) -> Result<Vec<Run>> {
        self.descendants_ordered(run_id, Order::Topological)
    }

    /// [`descendants`](Self::descendants) in the requested order.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn descendants_ordered(&self, run_id: RunId, order: Order) -> Result<Vec<Run>> {
        self.registry().get(run_id)?;
        self.sync_graph()?;
        self.graph()
            .descendants(run_id, order)
            .iter()
            .map(|id| self.registry().get(id))
            .collect()
    }

    /// Runs matching `filter`, ascending by id.
    ///
    /// # Errors
    /// Registry failures only.
    pub fn runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        self.registry().list(filter)
    }

    /// Most recent run of `task_name`, in any status.
    ///
    /// # Errors
    /// Registry failures only.
    pub fn last_run_id(&self, task_name: &str) -> Result<Option<RunId>> {
        self.registry().last_run_id(task_name)
    }

    /// Load one artifact.
    ///
    /// # Errors
    /// See [`ArtifactStore::load`](crate::artifact::ArtifactStore::load).
    pub fn load(&self, artifact: &Artifact) -> Result<Object> {
        self.store().load(artifact)
    }

    /// Load one artifact as a `T`.
    ///
    /// # Errors
    /// See [`ArtifactStore::load_as`](crate::artifact::ArtifactStore::load_as).
    pub fn load_as<T: Any>(&self, artifact: &Artifact) -> Result<T> {
        self.store().load_as(artifact)
    }

    /// Load every output of a run, keeping its shape.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run, plus whatever loading returns.
    pub fn load_outputs(&self, run_id: RunId) -> Result<Output<Object>> {
        self.out(run_id)?.try_map(|artifact| self.load(&artifact))
    }

    /// Producer runs of a run's artifact inputs, resolved from the registry.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub fn parents(&self, run_id: RunId) -> Result<Vec<Run>> {
        self.registry().get(run_id)?;
        self.sync_graph()?;
        self.graph()
            .parents(run_id)
            .into_iter()
            .map(|id| self.registry().get(id))
            .collect()
    }
}
