//! Ledger configuration

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding [`Config::storage_dir`].
pub const ENV_STORAGE_DIR: &str = "TRUENO_LINEAGE_STORAGE_DIR";
/// Environment variable overriding [`Config::notify`].
pub const ENV_NOTIFY: &str = "TRUENO_LINEAGE_NOTIFY";
/// Environment variable overriding [`Config::cache`].
pub const ENV_CACHE: &str = "TRUENO_LINEAGE_CACHE";
/// Environment variable overriding [`Config::record_git`].
pub const ENV_GIT: &str = "TRUENO_LINEAGE_GIT";

/// Default storage root when nothing else is configured.
pub const DEFAULT_STORAGE_DIR: &str = ".trueno-lineage";

/// Literals whose canonical JSON exceeds this many bytes are summarized.
pub const DEFAULT_LITERAL_LIMIT: usize = 4096;

/// What to do when a prior successful run has the same fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Always execute.
    Off,
    /// Return the prior run itself; record nothing.
    Reuse,
    /// Record a new run marked as a replay of the prior one.
    #[default]
    Replay,
}

impl FromStr for CachePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "false" => Ok(Self::Off),
            "reuse" => Ok(Self::Reuse),
            "replay" => Ok(Self::Replay),
            other => Err(Error::InvalidInput(format!("unknown cache policy '{other}'"))),
        }
    }
}

/// Ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for all persisted state
    pub storage_dir: PathBuf,
    /// Announce run completion through the notifier
    pub notify: bool,
    /// Cache policy
    pub cache: CachePolicy,
    /// Size above which literal inputs are summarized
    pub literal_limit_bytes: usize,
    /// Record commit and dirty state of the invoking checkout
    pub record_git: bool,
    /// Checkout to inspect; the working directory when unset
    pub git_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            notify: false,
            cache: CachePolicy::default(),
            literal_limit_bytes: DEFAULT_LITERAL_LIMIT,
            record_git: true,
            git_dir: None,
        }
    }
}

impl Config {
    /// Defaults rooted at `storage_dir`.
    #[must_use]
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TRUENO_LINEAGE_*` environment variables.
    ///
    /// # Errors
    /// `InvalidInput` if a variable is set to something unparseable.
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (an environment accessor).
    fn merge_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STORAGE_DIR).filter(|d| !d.is_empty()) {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup(ENV_NOTIFY) {
            self.notify = parse_flag(&flag)?;
        }
        if let Some(policy) = lookup(ENV_CACHE) {
            self.cache = policy.parse()?;
        }
        if let Some(flag) = lookup(ENV_GIT) {
            self.record_git = parse_flag(&flag)?;
        }
        Ok(self)
    }

    /// Set notification on or off.
    #[must_use]
    pub const fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Set the cache policy.
    #[must_use]
    pub const fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Set the literal summarization threshold.
    #[must_use]
    pub const fn literal_limit_bytes(mut self, limit: usize) -> Self {
        self.literal_limit_bytes = limit;
        self
    }

    /// Turn git state recording on or off.
    #[must_use]
    pub const fn record_git(mut self, record: bool) -> Self {
        self.record_git = record;
        self
    }

    /// Inspect the checkout at `dir` instead of the working directory.
    #[must_use]
    pub fn git_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.git_dir = Some(dir.into());
        self
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::InvalidInput(format!("not a boolean: '{other}'"))),
    }
}
