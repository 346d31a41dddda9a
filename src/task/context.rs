//! Per-invocation context supplied to the callable

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::artifact::{Artifact, ArtifactStore, Object};
use crate::run::RunId;
use crate::task::Output;
use crate::{Error, Result};

/// Group names the run itself answers for.
pub(crate) const RESERVED_GROUPS: [&str; 2] = ["inputs", "outputs"];

/// Id handed to silent invocations. Registries never allocate it.
pub const UNRECORDED_RUN: RunId = RunId::new(0);

/// Explicit context of one run: identity, run directory and log sink.
///
/// Everything written through [`log`](Self::log) (or `write!`) becomes the
/// run's captured log. Each completed line is mirrored to `tracing` at
/// `info` level under the `trueno_lineage::task` target.
pub struct RunContext<'a> {
    run_id: RunId,
    task_name: &'a str,
    run_dir: PathBuf,
    store: &'a ArtifactStore,
    log: String,
    mirrored: usize,
    groups: BTreeMap<String, Output<Artifact>>,
    recorded: bool,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(
        run_id: RunId,
        task_name: &'a str,
        run_dir: PathBuf,
        store: &'a ArtifactStore,
    ) -> Self {
        Self {
            run_id,
            task_name,
            run_dir,
            store,
            log: String::new(),
            mirrored: 0,
            groups: BTreeMap::new(),
            recorded: true,
        }
    }

    /// Context for an invocation that records nothing.
    pub(crate) fn silent(task_name: &'a str, run_dir: PathBuf, store: &'a ArtifactStore) -> Self {
        Self {
            recorded: false,
            ..Self::new(UNRECORDED_RUN, task_name, run_dir, store)
        }
    }

    /// Id of the run being executed ([`UNRECORDED_RUN`] in a silent call).
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Name of the task being executed.
    #[must_use]
    pub const fn task_name(&self) -> &str {
        self.task_name
    }

    /// Fresh directory owned by this run, for side files.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Artifact store, for loading handles passed via `skip_loading`.
    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        self.store
    }

    /// Is this invocation being recorded?
    #[must_use]
    pub const fn is_recorded(&self) -> bool {
        self.recorded
    }

    /// Append a line to the run's log.
    pub fn log(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        self.append(line);
        if !line.ends_with('\n') {
            self.append("\n");
        }
    }

    fn append(&mut self, text: &str) {
        self.log.push_str(text);
        while let Some(end) = self.log[self.mirrored..].find('\n') {
            let end = self.mirrored + end;
            self.mirror(self.mirrored, end);
            self.mirrored = end + 1;
        }
    }

    fn mirror(&self, start: usize, end: usize) {
        let line = &self.log[start..end];
        info!(target: "trueno_lineage::task", run_id = %self.run_id, "{line}");
    }

    /// Log text captured so far.
    #[must_use]
    pub fn captured(&self) -> &str {
        &self.log
    }

    /// Persist an extra named group of artifacts owned by this run.
    ///
    /// # Errors
    /// `InvalidInput` in a silent call, `ReservedGroup` for
    /// `inputs`/`outputs`, `GroupExists` when the group was already dumped,
    /// and whatever [`ArtifactStore::put`] returns.
    pub fn dump(&mut self, group: &str, output: Output<Object>) -> Result<Output<Artifact>> {
        if !self.recorded {
            return Err(Error::InvalidInput(format!(
                "cannot dump group '{group}' from a silent call"
            )));
        }
        if RESERVED_GROUPS.iter().any(|reserved| *reserved == group) {
            return Err(Error::ReservedGroup(group.to_string()));
        }
        if self.groups.contains_key(group) {
            return Err(Error::GroupExists {
                run_id: self.run_id,
                group: group.to_string(),
            });
        }
        let artifacts = output.try_map_ref(|obj| self.store.put(obj, self.run_id))?;
        self.groups.insert(group.to_string(), artifacts.clone());
        Ok(artifacts)
    }

    /// Finish the log, mirroring a trailing unterminated line.
    pub(crate) fn into_parts(self) -> (String, BTreeMap<String, Output<Artifact>>) {
        if self.mirrored < self.log.len() {
            self.mirror(self.mirrored, self.log.len());
        }
        (self.log, self.groups)
    }
}

impl fmt::Write for RunContext<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s);
        Ok(())
    }
}

impl fmt::Debug for RunContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("task_name", &self.task_name)
            .field("run_dir", &self.run_dir)
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::artifact::CodecRegistry;

    #[test]
    fn test_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), CodecRegistry::with_defaults());
        let mut ctx = RunContext::new(RunId::new(1), "t", dir.path().join("runs/1"), &store);
        ctx.log("first");
        write!(ctx, "second {}", 2).unwrap();
        assert_eq!(ctx.captured(), "first\nsecond 2");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_written_lines_are_mirrored_to_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), CodecRegistry::with_defaults());
        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();

        let log = tracing::subscriber::with_default(subscriber, || {
            let mut ctx = RunContext::new(RunId::new(7), "t", dir.path().join("runs/7"), &store);
            ctx.log("first");
            write!(ctx, "second {}", 2).unwrap();
            write!(ctx, " part\nthird\n").unwrap();
            write!(ctx, "tail").unwrap();
            ctx.into_parts().0
        });

        assert_eq!(log, "first\nsecond 2 part\nthird\ntail");
        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let events: Vec<&str> = text.lines().filter(|l| l.contains("trueno_lineage::task")).collect();
        assert_eq!(events.len(), 4, "{text}");
        assert!(events[0].contains(": first"), "{text}");
        assert!(events[1].contains(": second 2 part"), "{text}");
        assert!(events[2].contains(": third"), "{text}");
        assert!(events[3].contains(": tail"), "{text}");
    }

    #[test]
    fn test_silent_context_cannot_dump() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), CodecRegistry::with_defaults());
        let mut ctx = RunContext::silent("t", dir.path().join("silent"), &store);
        assert_eq!(ctx.run_id(), UNRECORDED_RUN);
        assert!(!ctx.is_recorded());
        assert!(matches!(
            ctx.dump("plots", Output::value(String::from("x"))),
            Err(Error::InvalidInput(_))
        ));
        assert!(!dir.path().join("runs").exists());
    }

    #[test]
    fn test_dump_rules() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), CodecRegistry::with_defaults());
        let mut ctx = RunContext::new(RunId::new(5), "t", dir.path().join("runs/5"), &store);

        assert!(matches!(
            ctx.dump("outputs", Output::value(String::from("x"))),
            Err(Error::ReservedGroup(_))
        ));

        let plots = ctx
            .dump("plots", Output::named([("a", Object::new(String::from("png")))]))
            .unwrap();
        assert_eq!(plots.get("a").unwrap().run_id(), RunId::new(5));

        assert!(matches!(
            ctx.dump("plots", Output::None),
            Err(Error::GroupExists { .. })
        ));

        let (_, groups) = ctx.into_parts();
        assert_eq!(groups.len(), 1);
    }
}
