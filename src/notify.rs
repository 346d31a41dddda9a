//! Completion notifications

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::run::{RunId, RunStatus};

/// Read-only event emitted once per committed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Committed run
    pub run_id: RunId,
    /// Task name
    pub task_name: String,
    /// Final status
    pub status: RunStatus,
}

/// Receives run completion events. Owns how (and whether) to announce them.
pub trait Notifier: Send + Sync {
    /// Called after the run's commit is durable.
    fn notify(&self, event: &RunEvent);
}

/// Announces events as `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &RunEvent) {
        match event.status {
            RunStatus::Failed => warn!(
                target: "trueno_lineage::notify",
                run_id = %event.run_id,
                task = %event.task_name,
                "run failed"
            ),
            _ => info!(
                target: "trueno_lineage::notify",
                run_id = %event.run_id,
                task = %event.task_name,
                status = %event.status,
                "run finished"
            ),
        }
    }
}

impl<F> Notifier for F
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn notify(&self, event: &RunEvent) {
        self(event);
    }
}
