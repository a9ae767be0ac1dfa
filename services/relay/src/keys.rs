//! Action to key resolution.
//!
//! Every action has a mapping file under the action base directory whose first
//! non-blank line is the content-addressed key of the function artifact. The
//! dot-delimited action forms a nested path: `user.create` is read from
//! `{base}/user/create`, falling back to a flat `{base}/user.create` file.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors from key resolution.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no mapping file for action at {}", path.display())]
    KeyNotFound { path: PathBuf },

    #[error("failed to read mapping file {}: {source}", path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("mapping file {} is empty", path.display())]
    EmptyMapping { path: PathBuf },

    #[error("invalid action name {0:?}")]
    InvalidAction(String),

    #[error("invalid key {0:?}: expected [A-Za-z0-9][A-Za-z0-9_.-]*")]
    InvalidKey(String),
}

impl KeyError {
    /// Stable name of the error kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            KeyError::KeyNotFound { .. } => "key_not_found",
            KeyError::KeyRead { .. } => "key_read",
            KeyError::EmptyMapping { .. } => "empty_mapping",
            KeyError::InvalidAction(_) => "invalid_action",
            KeyError::InvalidKey(_) => "invalid_key",
        }
    }
}

/// Content-addressed identifier of a function artifact.
///
/// Doubles as the container name and as the artifact directory name, so it is
/// restricted to characters that are safe in both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        let mut chars = value.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

        if valid {
            Ok(Self(value))
        } else {
            Err(KeyError::InvalidKey(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::new(s)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maps an action name to the key of the artifact that serves it.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, action: &str) -> Result<Key, KeyError>;
}

/// Resolver backed by mapping files on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileKeyResolver {
    base_dir: PathBuf,
}

impl FileKeyResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Candidate mapping file paths for `action`, nested layout first.
    fn candidate_paths(&self, action: &str) -> Result<[PathBuf; 2], KeyError> {
        let segments: Vec<&str> = action.split('.').collect();
        let valid = segments
            .iter()
            .all(|segment| !segment.is_empty() && !segment.contains(|c: char| c == '/' || c == '\\'));
        if !valid {
            return Err(KeyError::InvalidAction(action.to_string()));
        }

        let nested = segments
            .iter()
            .fold(self.base_dir.clone(), |path, segment| path.join(segment));
        let flat = self.base_dir.join(action);

        Ok([nested, flat])
    }
}

#[async_trait]
impl KeyResolver for FileKeyResolver {
    async fn resolve(&self, action: &str) -> Result<Key, KeyError> {
        let [nested, flat] = self.candidate_paths(action)?;

        let (path, contents) = match read_mapping(&nested).await? {
            Some(contents) => (nested, contents),
            None => match read_mapping(&flat).await? {
                Some(contents) => (flat, contents),
                None => return Err(KeyError::KeyNotFound { path: nested }),
            },
        };

        let line = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| KeyError::EmptyMapping { path: path.clone() })?;

        let key = Key::new(line)?;
        debug!(action, key = %key, path = %path.display(), "Resolved action key");
        Ok(key)
    }
}

/// Read a mapping file, treating a missing file as `None`.
async fn read_mapping(path: &Path) -> Result<Option<String>, KeyError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(KeyError::KeyRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}
