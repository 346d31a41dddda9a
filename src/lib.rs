//! # Trueno-Lineage: Run Tracking and Artifact Lineage
//!
//! **Version**: 0.1.0
//!
//! Trueno-Lineage turns ordinary function calls into recorded, cacheable,
//! lineage-tracked task runs, so a research pipeline's provenance can be
//! reconstructed after the fact.
//!
//! ## Components
//!
//! - **Artifact Store** ([`artifact`]): write-once, run-addressed object
//!   storage with capability-based codec dispatch
//! - **Run Registry** ([`run`]): append-only run records with atomic
//!   create/commit (SQLite or in-memory)
//! - **Lineage Graph** ([`lineage`]): producer/consumer index with lazy,
//!   restartable ancestry traversals
//! - **Task Wrapper** ([`Ledger::call`], [`task`]): fingerprinting, caching,
//!   execution and persistence of one invocation
//! - **Query Layer** ([`query`]): `inp`, `out`, `get_meta`, `get_log`,
//!   `ancestors`, `descendants`
//!
//! ## Example Usage
//!
//! ```rust
//! use trueno_lineage::{Args, Ledger, Object, Output, Task};
//!
//! # fn main() -> trueno_lineage::Result<()> {
//! # let dir = tempfile::tempdir()?;
//! let ledger = Ledger::in_memory(dir.path())?;
//!
//! let download = Task::new("download", |ctx, inputs| {
//!     let url: String = inputs.literal("url")?;
//!     ctx.log(format!("fetching {url}"));
//!     Ok(Output::value(String::from("a,b\n1,2\n")))
//! });
//! let split = Task::new("split", |_, inputs| {
//!     let csv = inputs.value::<String>("df")?.as_str();
//!     let (head, body) = csv.split_once('\n').unwrap_or((csv, ""));
//!     Ok(Output::named([
//!         ("header", Object::new(head.to_string())),
//!         ("body", Object::new(body.to_string())),
//!     ]))
//! });
//!
//! let df = ledger.call(&download, &Args::new().literal("url", "X"))?;
//! let parts = ledger.call(&split, &Args::new().artifact("df", df.output.one().unwrap()))?;
//!
//! let ancestors: Vec<_> = ledger.ancestors(parts.run_id)?.iter().map(|r| r.run_id()).collect();
//! assert_eq!(ancestors, vec![df.run_id]);
//! assert_eq!(ledger.get_log(df.run_id)?, "fetching X\n");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod artifact;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod lineage;
pub mod logging;
pub mod notify;
pub mod query;
pub mod run;
pub mod task;

pub use artifact::{Artifact, ArtifactStore, Codec, CodecRegistry, Object};
pub use config::{CachePolicy, Config};
pub use error::{Error, Result};
pub use ledger::{Call, Ledger, LedgerBuilder};
pub use lineage::{LineageEdge, LineageGraph, Order};
pub use notify::{LogNotifier, Notifier, RunEvent};
pub use query::InputRef;
pub use run::{GitStatus, Run, RunFilter, RunId, RunStatus};
pub use task::{Arg, Args, Input, Inputs, Output, RunContext, Task};
