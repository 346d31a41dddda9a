//! Task Wrapper surface - task definitions, call arguments and resolved inputs
//!
//! A [`Task`] wraps a plain callable. The callable receives a
//! [`RunContext`] (run id, fresh run directory, log sink) and the resolved
//! [`Inputs`], and returns an [`Output`] of objects. [`Ledger::call`]
//! does the rest: fingerprinting, caching, persistence and lineage.
//!
//! ```rust
//! use trueno_lineage::task::{Args, Output, Task};
//!
//! let double = Task::new("double", |ctx, inputs| {
//!     let x: f64 = inputs.literal("x")?;
//!     ctx.log(format!("doubling {x}"));
//!     Ok(Output::value(vec![x * 2.0]))
//! });
//! let args = Args::new().literal("x", 21.0);
//! # let _ = (double, args);
//! ```
//!
//! [`Ledger::call`]: crate::Ledger::call

mod context;
mod output;

pub use context::{RunContext, UNRECORDED_RUN};
pub use output::Output;

use std::any::{type_name, Any};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::DeserializeOwned;

use crate::artifact::{Artifact, Object};

/// Signature every wrapped callable satisfies.
pub type TaskFn =
    dyn Fn(&mut RunContext<'_>, &Inputs) -> anyhow::Result<Output<Object>> + Send + Sync;

/// A wrapped callable whose invocations are recorded.
pub struct Task {
    name: String,
    func: Box<TaskFn>,
    skip_recording: BTreeSet<String>,
    skip_loading: BTreeSet<String>,
}

impl Task {
    /// Wrap `func` under an explicit qualified name.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut RunContext<'_>, &Inputs) -> anyhow::Result<Output<Object>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
            skip_recording: BTreeSet::new(),
            skip_loading: BTreeSet::new(),
        }
    }

    /// Wrap a named function, using its Rust path as the task name.
    ///
    /// Closures get a compiler-generated name; use [`Task::new`] for them.
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&mut RunContext<'_>, &Inputs) -> anyhow::Result<Output<Object>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(type_name::<F>(), func)
    }

    /// Record these literal parameters as `Skipped` instead of their value.
    /// Parameters that carry artifacts are always recorded.
    #[must_use]
    pub fn skip_recording<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_recording.extend(names.into_iter().map(Into::into));
        self
    }

    /// Hand these artifact parameters to the callable unresolved.
    #[must_use]
    pub fn skip_loading<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_loading.extend(names.into_iter().map(Into::into));
        self
    }

    /// Qualified task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn records(&self, param: &str) -> bool {
        !self.skip_recording.contains(param)
    }

    pub(crate) fn loads(&self, param: &str) -> bool {
        !self.skip_loading.contains(param)
    }

    pub(crate) fn invoke(
        &self,
        ctx: &mut RunContext<'_>,
        inputs: &Inputs,
    ) -> anyhow::Result<Output<Object>> {
        (self.func)(ctx, inputs)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("skip_recording", &self.skip_recording)
            .field("skip_loading", &self.skip_loading)
            .finish_non_exhaustive()
    }
}

/// One call-site argument.
///
/// `Seq` and `Map` nest, so a parameter may carry a container that mixes
/// literals and artifacts at any depth.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Plain data, recorded verbatim (or summarized when large).
    Literal(serde_json::Value),
    /// Output of an earlier run; loaded before execution.
    Artifact(Artifact),
    /// Ordered container.
    Seq(Vec<Arg>),
    /// Keyed container.
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    /// Ordered container of arguments.
    #[must_use]
    pub fn seq<I, A>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Self>,
    {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Keyed container of arguments.
    #[must_use]
    pub fn map<I, K, A>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, A)>,
        K: Into<String>,
        A: Into<Self>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Every artifact in this argument, depth first.
    pub fn artifacts(&self) -> Box<dyn Iterator<Item = &Artifact> + '_> {
        match self {
            Self::Literal(_) => Box::new(std::iter::empty()),
            Self::Artifact(artifact) => Box::new(std::iter::once(artifact)),
            Self::Seq(items) => Box::new(items.iter().flat_map(Self::artifacts)),
            Self::Map(entries) => Box::new(entries.values().flat_map(Self::artifacts)),
        }
    }

    /// The argument as plain JSON, or `None` when it holds an artifact.
    #[must_use]
    pub fn to_value(&self) -> Option<serde_json::Value> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Artifact(_) => None,
            Self::Seq(items) => items
                .iter()
                .map(Self::to_value)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.to_value().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
        }
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<Artifact> for Arg {
    fn from(artifact: Artifact) -> Self {
        Self::Artifact(artifact)
    }
}

impl From<&Artifact> for Arg {
    fn from(artifact: &Artifact) -> Self {
        Self::Artifact(artifact.clone())
    }
}

/// Call-site arguments by parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    args: BTreeMap<String, Arg>,
}

impl Args {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a literal argument.
    #[must_use]
    pub fn literal(self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.arg(name, Arg::Literal(value.into()))
    }

    /// Add an artifact argument.
    #[must_use]
    pub fn artifact(self, name: impl Into<String>, artifact: &Artifact) -> Self {
        self.arg(name, artifact)
    }

    /// Add any argument, including nested containers.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.args.insert(name.into(), arg.into());
        self
    }

    /// Arguments in parameter-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arg)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every artifact, with the parameter it was passed under.
    pub fn artifacts(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.iter()
            .flat_map(|(k, v)| v.artifacts().map(move |a| (k, a)))
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True when there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// An input as the callable sees it.
#[derive(Debug)]
pub enum Input {
    /// Literal argument.
    Literal(serde_json::Value),
    /// Loaded artifact value.
    Value(Object),
    /// Artifact left unloaded (`skip_loading`).
    Handle(Artifact),
    /// Container holding at least one artifact, elements resolved.
    Seq(Vec<Input>),
    /// Keyed container holding at least one artifact, entries resolved.
    Map(BTreeMap<String, Input>),
}

impl Input {
    /// Borrow a loaded value as a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Value(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Element `index` of a `Seq` input.
    #[must_use]
    pub fn item(&self, index: usize) -> Option<&Self> {
        match self {
            Self::Seq(items) => items.get(index),
            _ => None,
        }
    }

    /// Entry `key` of a `Map` input.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Literal(_) => "a literal",
            Self::Value(_) => "a loaded artifact",
            Self::Handle(_) => "an unloaded artifact",
            Self::Seq(_) => "a sequence",
            Self::Map(_) => "a map",
        }
    }
}

/// Resolved inputs handed to the callable.
#[derive(Debug, Default)]
pub struct Inputs {
    inputs: BTreeMap<String, Input>,
}

impl Inputs {
    pub(crate) fn insert(&mut self, name: impl Into<String>, input: Input) {
        self.inputs.insert(name.into(), input);
    }

    /// Raw access to one input.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Input> {
        self.inputs.get(name)
    }

    /// Parameter names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    /// Deserialize a literal argument.
    ///
    /// # Errors
    /// Fails if the parameter is missing, is not a literal, or does not
    /// deserialize as `T`.
    pub fn literal<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        match self.inputs.get(name) {
            Some(Input::Literal(value)) => serde_json::from_value(value.clone())
                .map_err(|e| anyhow::anyhow!("parameter '{name}': {e}")),
            Some(other) => anyhow::bail!("parameter '{name}' is {}, not a literal", other.kind()),
            None => anyhow::bail!("missing parameter '{name}'"),
        }
    }

    /// Borrow a loaded artifact value as a `T`.
    ///
    /// # Errors
    /// Fails if the parameter is missing, was not loaded, or holds another
    /// type.
    pub fn value<T: Any>(&self, name: &str) -> anyhow::Result<&T> {
        match self.inputs.get(name) {
            Some(Input::Value(obj)) => obj.downcast_ref::<T>().ok_or_else(|| {
                anyhow::anyhow!(
                    "parameter '{name}' holds {}, not {}",
                    obj.type_name(),
                    type_name::<T>()
                )
            }),
            Some(Input::Handle(_)) => anyhow::bail!("parameter '{name}' was not loaded"),
            Some(other) => anyhow::bail!("parameter '{name}' is {}", other.kind()),
            None => anyhow::bail!("missing parameter '{name}'"),
        }
    }

    /// Borrow every element of a sequence parameter as a `T`.
    ///
    /// # Errors
    /// Fails if the parameter is missing, is not a sequence of loaded values,
    /// or an element holds another type.
    pub fn values<T: Any>(&self, name: &str) -> anyhow::Result<Vec<&T>> {
        match self.inputs.get(name) {
            Some(Input::Seq(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    item.downcast_ref::<T>().ok_or_else(|| {
                        anyhow::anyhow!(
                            "parameter '{name}'[{i}] is {}, not {}",
                            item.kind(),
                            type_name::<T>()
                        )
                    })
                })
                .collect(),
            Some(other) => anyhow::bail!("parameter '{name}' is {}, not a sequence", other.kind()),
            None => anyhow::bail!("missing parameter '{name}'"),
        }
    }

    /// Unresolved handle of an artifact parameter listed in `skip_loading`.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<&Artifact> {
        match self.inputs.get(name) {
            Some(Input::Handle(artifact)) => Some(artifact),
            _ => None,
        }
    }
}
