//! Run Registry
//!
//! ## Schema Overview
//!
//! ```text
//! Run (1) ──< Binding (N)          [inputs, by parameter name]
//!   │
//!   ├──< Artifact (N)              [outputs and named groups, owned]
//!   └──< LineageEdge (N)           [consumer side, points at earlier runs]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_lineage::run::{MemoryRegistry, NewRun, RunCommit, RunRegistry, RunStatus};
//!
//! # fn example() -> trueno_lineage::Result<()> {
//! let registry = MemoryRegistry::new();
//! let run_id = registry.create(NewRun::new("download"))?;
//! registry.commit(run_id, RunCommit::new(RunStatus::Success))?;
//! assert_eq!(registry.get(run_id)?.status(), RunStatus::Success);
//! # Ok(())
//! # }
//! ```

mod git;
mod memory;
mod record;
mod registry;
mod sqlite;

pub use git::GitStatus;
pub use memory::MemoryRegistry;
pub use record::{
    hostname, run_dir_for, Binding, NewRun, Run, RunCommit, RunId, RunMeta, RunStatus,
};
pub use registry::{RunFilter, RunRegistry};
pub use sqlite::{SqliteRegistry, REGISTRY_FILE};
