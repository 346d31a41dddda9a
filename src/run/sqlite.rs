//! SQLite-backed run registry.
//!
//! Each run is one row holding the serialized record plus the columns that
//! queries filter on. `create` and `commit` each run inside a single
//! `BEGIN IMMEDIATE` transaction, so readers observe either the state before
//! or after a write, and id allocation is serialized across processes that
//! share the database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::registry::check_commit;
use super::{NewRun, Run, RunCommit, RunFilter, RunId, RunRegistry, RunStatus};
use crate::lineage::LineageEdge;
use crate::task::Output;
use crate::{Artifact, Error, Result};

/// File name of the registry database inside the storage root.
pub const REGISTRY_FILE: &str = "registry.sqlite";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id      INTEGER PRIMARY KEY AUTOINCREMENT,
        task_name   TEXT NOT NULL,
        status      TEXT NOT NULL,
        fingerprint TEXT,
        replay_of   INTEGER,
        record      TEXT NOT NULL,
        log         TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_name);
    CREATE INDEX IF NOT EXISTS idx_runs_fingerprint ON runs(fingerprint);
    CREATE TABLE IF NOT EXISTS edges (
        producer INTEGER NOT NULL REFERENCES runs(run_id),
        consumer INTEGER NOT NULL REFERENCES runs(run_id),
        artifact TEXT NOT NULL,
        PRIMARY KEY (producer, consumer, artifact)
    );
    CREATE TABLE IF NOT EXISTS artifact_groups (
        run_id    INTEGER NOT NULL REFERENCES runs(run_id),
        name      TEXT NOT NULL,
        artifacts TEXT NOT NULL,
        PRIMARY KEY (run_id, name)
    );
";

/// Durable run registry stored in a single SQLite file.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `path`.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened run registry at {:?}", path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Registry that lives only as long as this value.
    ///
    /// # Errors
    /// Returns error if SQLite cannot allocate the database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_sql_id(run_id: RunId) -> Result<i64> {
    i64::try_from(run_id.get())
        .map_err(|_| Error::InvalidInput(format!("run id {run_id} out of range")))
}

fn from_sql_id(raw: i64) -> Result<RunId> {
    u64::try_from(raw)
        .map(RunId::new)
        .map_err(|_| Error::InvalidInput(format!("negative run id {raw} in registry")))
}

fn decode_run(record: &str) -> Result<Run> {
    Ok(serde_json::from_str(record)?)
}

impl RunRegistry for SqliteRegistry {
    fn create(&self, new: NewRun) -> Result<RunId> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO runs (task_name, status, fingerprint, replay_of, record)
             VALUES (?1, ?2, ?3, ?4, '')",
            params![
                new.task_name,
                RunStatus::Pending.as_str(),
                new.fingerprint,
                new.replay_of.map(to_sql_id).transpose()?,
            ],
        )?;
        let run_id = from_sql_id(tx.last_insert_rowid())?;
        let run = Run::pending(run_id, new);
        tx.execute(
            "UPDATE runs SET record = ?1 WHERE run_id = ?2",
            params![serde_json::to_string(&run)?, to_sql_id(run_id)?],
        )?;
        tx.commit()?;
        debug!(%run_id, task = run.task_name(), "created run");
        Ok(run_id)
    }

    fn commit(&self, run_id: RunId, commit: RunCommit) -> Result<Run> {
        check_commit(run_id, &commit)?;
        let id = to_sql_id(run_id)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record: String = tx
            .query_row("SELECT record FROM runs WHERE run_id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(Error::RunNotFound(run_id))?;
        let mut run = decode_run(&record)?;
        if run.status() != RunStatus::Pending {
            return Err(Error::AlreadyCommitted(run_id));
        }

        for edge in &commit.edges {
            let known: Option<i64> = tx
                .query_row(
                    "SELECT run_id FROM runs WHERE run_id = ?1",
                    [to_sql_id(edge.producer)?],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(Error::RunNotFound(edge.producer));
            }
            tx.execute(
                "INSERT OR IGNORE INTO edges (producer, consumer, artifact) VALUES (?1, ?2, ?3)",
                params![to_sql_id(edge.producer)?, id, edge.artifact],
            )?;
        }

        for (name, artifacts) in &commit.groups {
            tx.execute(
                "INSERT INTO artifact_groups (run_id, name, artifacts) VALUES (?1, ?2, ?3)",
                params![id, name, serde_json::to_string(artifacts)?],
            )?;
        }

        run.apply(&commit);
        tx.execute(
            "UPDATE runs SET status = ?1, record = ?2, log = ?3
             WHERE run_id = ?4 AND status = 'pending'",
            params![
                run.status().as_str(),
                serde_json::to_string(&run)?,
                commit.log,
                id
            ],
        )?;
        tx.commit()?;
        debug!(%run_id, status = %run.status(), edges = commit.edges.len(), "committed run");
        Ok(run)
    }

    fn get(&self, run_id: RunId) -> Result<Run> {
        let record: String = self
            .conn()
            .query_row(
                "SELECT record FROM runs WHERE run_id = ?1",
                [to_sql_id(run_id)?],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::RunNotFound(run_id))?;
        decode_run(&record)
    }

    fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT record FROM runs
             WHERE (?1 IS NULL OR task_name = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY run_id",
        )?;
        let records = stmt
            .query_map(
                params![filter.task_name, filter.status.map(|s| s.as_str())],
                |row| row.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.iter().map(|r| decode_run(r)).collect()
    }

    fn log(&self, run_id: RunId) -> Result<String> {
        self.conn()
            .query_row(
                "SELECT log FROM runs WHERE run_id = ?1",
                [to_sql_id(run_id)?],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::RunNotFound(run_id))
    }

    fn group(&self, run_id: RunId, group: &str) -> Result<Output<Artifact>> {
        let conn = self.conn();
        let id = to_sql_id(run_id)?;
        let known: Option<i64> = conn
            .query_row("SELECT run_id FROM runs WHERE run_id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        if known.is_none() {
            return Err(Error::RunNotFound(run_id));
        }
        let artifacts: String = conn
            .query_row(
                "SELECT artifacts FROM artifact_groups WHERE run_id = ?1 AND name = ?2",
                params![id, group],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::ArtifactNotFound(format!("group '{group}' of run {run_id}")))?;
        Ok(serde_json::from_str(&artifacts)?)
    }

    fn edges(&self) -> Result<Vec<LineageEdge>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT producer, consumer, artifact FROM edges ORDER BY consumer, producer, artifact",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(producer, consumer, artifact)| {
                Ok(LineageEdge::new(
                    from_sql_id(producer)?,
                    from_sql_id(consumer)?,
                    artifact,
                ))
            })
            .collect()
    }

    fn find_cached(&self, task_name: &str, fingerprint: &str) -> Result<Option<Run>> {
        let record: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM runs
                 WHERE task_name = ?1 AND fingerprint = ?2
                   AND status = 'success' AND replay_of IS NULL
                 ORDER BY run_id DESC LIMIT 1",
                params![task_name, fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        record.as_deref().map(decode_run).transpose()
    }

    fn last_run_id(&self, task_name: &str) -> Result<Option<RunId>> {
        let raw: Option<i64> = self.conn().query_row(
            "SELECT MAX(run_id) FROM runs WHERE task_name = ?1",
            [task_name],
            |row| row.get(0),
        )?;
        raw.map(from_sql_id).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_create_and_get() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let id = registry.create(NewRun::new("download")).unwrap();
        assert_eq!(id, RunId::new(1));
        let run = registry.get(id).unwrap();
        assert_eq!(run.task_name(), "download");
        assert_eq!(run.status(), RunStatus::Pending);
    }

    #[test]
    fn test_sqlite_commit_exactly_once() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let id = registry.create(NewRun::new("download")).unwrap();
        registry
            .commit(id, RunCommit::new(RunStatus::Success).log("done\n"))
            .unwrap();
        assert!(matches!(
            registry.commit(id, RunCommit::new(RunStatus::Failed)),
            Err(Error::AlreadyCommitted(_))
        ));
        assert_eq!(registry.get(id).unwrap().status(), RunStatus::Success);
        assert_eq!(registry.log(id).unwrap(), "done\n");
    }

    #[test]
    fn test_sqlite_rejects_pending_commit() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let id = registry.create(NewRun::new("download")).unwrap();
        let err = registry
            .commit(id, RunCommit::new(RunStatus::Pending).log("half"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(registry.get(id).unwrap().status(), RunStatus::Pending);
        assert_eq!(registry.log(id).unwrap(), "");
        registry.commit(id, RunCommit::new(RunStatus::Failed)).unwrap();
        assert_eq!(registry.get(id).unwrap().status(), RunStatus::Failed);
    }

    #[test]
    fn test_sqlite_edge_to_unknown_producer_rolls_back() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let _a = registry.create(NewRun::new("a")).unwrap();
        let b = registry.create(NewRun::new("b")).unwrap();
        let edge = LineageEdge::new(RunId::new(1), b, "runs/1/artifacts/x.json");
        let ghost = LineageEdge::new(RunId::new(0), b, "runs/0/artifacts/y.json");
        let err = registry
            .commit(b, RunCommit::new(RunStatus::Success).edges(vec![edge, ghost]))
            .unwrap_err();
        assert!(err.is_not_found());
        // Nothing from the aborted transaction is visible.
        assert!(registry.edges().unwrap().is_empty());
        assert_eq!(registry.get(b).unwrap().status(), RunStatus::Pending);
    }

    #[test]
    fn test_sqlite_last_run_id() {
        let registry = SqliteRegistry::in_memory().unwrap();
        assert_eq!(registry.last_run_id("a").unwrap(), None);
        registry.create(NewRun::new("a")).unwrap();
        registry.create(NewRun::new("b")).unwrap();
        let last = registry.create(NewRun::new("a")).unwrap();
        assert_eq!(registry.last_run_id("a").unwrap(), Some(last));
    }
}
