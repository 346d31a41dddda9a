//! Artifact Store - write-once, run-addressed object storage
//!
//! An [`Artifact`] is a lazy handle: the producing run, a path relative to
//! the storage root, the codec tag and a blake3 digest of the stored bytes.
//! The bytes live under the producing run's directory:
//!
//! ```text
//! <storage_dir>/runs/<run_id>/artifacts/<uuid>.<ext>
//! ```
//!
//! Files are created with `create_new`, so an artifact's bytes are written
//! exactly once. Loading never touches the file beyond reading it.

mod codec;

pub use codec::{
    ArrayCodec, BytesCodec, Codec, CodecRegistry, JsonCodec, Object, SerdeCodec, TextCodec,
};

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::run::{run_dir_for, RunId};
use crate::{Error, Result};

/// Subdirectory of a run directory that holds its artifacts.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Lazy, disk-backed handle to an object produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Artifact {
    run_id: RunId,
    path: String,
    codec: String,
    digest: String,
}

impl Artifact {
    /// Run that produced (and owns) this artifact.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Path relative to the storage root, `/`-separated.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tag of the codec that wrote the bytes.
    #[must_use]
    pub fn codec(&self) -> &str {
        &self.codec
    }

    /// blake3 digest of the stored bytes (hex).
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Load the underlying value.
    ///
    /// # Errors
    /// See [`ArtifactStore::load`].
    pub fn load(&self, store: &ArtifactStore) -> Result<Object> {
        store.load(self)
    }
}

/// Persists and loads objects under the storage root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    codecs: CodecRegistry,
}

impl ArtifactStore {
    /// Store rooted at `root` using `codecs` for dispatch.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, codecs: CodecRegistry) -> Self {
        Self {
            root: root.into(),
            codecs,
        }
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Codec registry used for dispatch.
    #[must_use]
    pub const fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Mutable codec registry, for registering additional codecs.
    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    /// Absolute location of an artifact's bytes.
    #[must_use]
    pub fn absolute_path(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.path)
    }

    /// Do the artifact's bytes exist on disk?
    #[must_use]
    pub fn exists(&self, artifact: &Artifact) -> bool {
        self.absolute_path(artifact).is_file()
    }

    /// Serialize `value` into the artifacts directory of `owner`.
    ///
    /// # Errors
    /// `UnsupportedType` if no codec accepts the value, `Io` if the bytes
    /// cannot be written.
    pub fn put(&self, value: &Object, owner: RunId) -> Result<Artifact> {
        let codec = self.codecs.select(value)?;
        let bytes = codec.encode(value).map_err(|e| {
            Error::UnsupportedType(format!(
                "{} (codec '{}' failed: {e:#})",
                value.type_name(),
                codec.tag()
            ))
        })?;

        let dir = self.root.join(run_dir_for(owner)).join(ARTIFACTS_DIR);
        fs::create_dir_all(&dir)?;
        let file_name = format!("{}.{}", Uuid::new_v4().simple(), codec.extension());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&file_name))?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        let artifact = Artifact {
            run_id: owner,
            path: format!("runs/{owner}/{ARTIFACTS_DIR}/{file_name}"),
            codec: codec.tag().to_string(),
            digest: blake3::hash(&bytes).to_hex().to_string(),
        };
        debug!(run_id = %owner, path = %artifact.path, codec = %artifact.codec, bytes = bytes.len(), "stored artifact");
        Ok(artifact)
    }

    /// Load an artifact's value. Repeated calls return equivalent objects.
    ///
    /// # Errors
    /// `ArtifactNotFound` if the bytes are missing, `Corruption` if the
    /// bytes do not match the recorded digest, carry an unknown codec tag or
    /// cannot be decoded.
    pub fn load(&self, artifact: &Artifact) -> Result<Object> {
        let bytes = match fs::read(self.absolute_path(artifact)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ArtifactNotFound(artifact.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = blake3::hash(&bytes).to_hex();
        if actual.as_str() != artifact.digest {
            return Err(Error::Corruption {
                path: artifact.path.clone(),
                reason: format!("digest mismatch: expected {} got {actual}", artifact.digest),
            });
        }

        let codec = self.codecs.by_tag(&artifact.codec).ok_or_else(|| Error::Corruption {
            path: artifact.path.clone(),
            reason: format!("unknown codec tag '{}'", artifact.codec),
        })?;
        codec.decode(&bytes).map_err(|e| Error::Corruption {
            path: artifact.path.clone(),
            reason: format!("{e:#}"),
        })
    }

    /// Load and downcast to `T`.
    ///
    /// # Errors
    /// Everything [`load`](Self::load) returns, plus `InvalidInput` when the
    /// stored value is not a `T`.
    pub fn load_as<T: Any>(&self, artifact: &Artifact) -> Result<T> {
        self.load(artifact)?.downcast::<T>().map_err(|obj| {
            Error::InvalidInput(format!(
                "artifact {} holds {}, not {}",
                artifact.path,
                obj.type_name(),
                std::any::type_name::<T>()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), CodecRegistry::with_defaults());
        (dir, store)
    }

    #[test]
    fn test_put_then_load() {
        let (_dir, store) = store();
        let artifact = store
            .put(&Object::new(vec![1.0f64, 2.0, 3.0]), RunId::new(4))
            .unwrap();
        assert_eq!(artifact.run_id(), RunId::new(4));
        assert!(artifact.path().starts_with("runs/4/artifacts/"));
        assert_eq!(artifact.codec(), "f64-array");
        assert!(store.exists(&artifact));
        assert_eq!(store.load_as::<Vec<f64>>(&artifact).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_load_is_idempotent_and_read_only() {
        let (_dir, store) = store();
        let artifact = store.put(&Object::new(String::from("hello")), RunId::new(1)).unwrap();
        let before = fs::read(store.absolute_path(&artifact)).unwrap();
        let a = store.load_as::<String>(&artifact).unwrap();
        let b = store.load_as::<String>(&artifact).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs::read(store.absolute_path(&artifact)).unwrap(), before);
    }

    #[test]
    fn test_put_unsupported() {
        let (dir, store) = store();
        let err = store.put(&Object::new(1u16), RunId::new(1)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
        assert!(!dir.path().join("runs/1/artifacts").exists());
    }

    #[test]
    fn test_load_detects_corruption() {
        let (_dir, store) = store();
        let artifact = store
            .put(&Object::new(serde_json::json!({"rows": 3})), RunId::new(2))
            .unwrap();
        fs::write(store.absolute_path(&artifact), b"{ not json").unwrap();
        assert!(matches!(store.load(&artifact), Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_load_unknown_codec_tag_is_corruption() {
        let (dir, store) = store();
        let artifact = store.put(&Object::new(String::from("x")), RunId::new(5)).unwrap();
        let bare = ArtifactStore::new(dir.path(), CodecRegistry::empty());
        match bare.load(&artifact) {
            Err(Error::Corruption { path, reason }) => {
                assert_eq!(path, artifact.path());
                assert!(reason.contains("unknown codec tag 'text'"), "{reason}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_bytes() {
        let (_dir, store) = store();
        let artifact = store.put(&Object::new(vec![0u8, 1]), RunId::new(3)).unwrap();
        fs::remove_file(store.absolute_path(&artifact)).unwrap();
        assert!(store.load(&artifact).unwrap_err().is_not_found());
        assert!(!store.exists(&artifact));
    }

    #[test]
    fn test_load_as_wrong_type() {
        let (_dir, store) = store();
        let artifact = store.put(&Object::new(String::from("x")), RunId::new(1)).unwrap();
        assert!(matches!(
            store.load_as::<Vec<u8>>(&artifact),
            Err(Error::InvalidInput(_))
        ));
    }
}
