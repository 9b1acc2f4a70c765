//! Durable JSON artifacts shared between pipeline stages.
//!
//! Every stage hands off to the next one through files. Writers go through a
//! temporary sibling and a rename so a crash never leaves a half-written
//! artifact that a later run would mistake for finished output.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The artifact does not exist yet; usually handled by falling back or skipping.
    NotFound,
    /// The artifact exists but could not be decoded.
    Malformed,
    /// Anything else (permissions, full disk, encoder failure).
    Fatal,
}

/// Errors surfaced while loading or persisting an artifact.
#[derive(Debug)]
pub enum ArtifactError {
    /// No file at the given path.
    NotFound(PathBuf),
    /// The file exists but its JSON payload did not decode.
    Malformed {
        /// Offending file.
        path: PathBuf,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// Serializing the value failed before anything was written.
    Encode {
        /// Destination file.
        path: PathBuf,
        /// Encoder error.
        source: serde_json::Error,
    },
    /// Filesystem failure.
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl ArtifactError {
    /// Wraps an I/O error, promoting `NotFound` to its own variant.
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Returns the recovery class for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Malformed { .. } => ErrorKind::Malformed,
            Self::Encode { .. } | Self::Io { .. } => ErrorKind::Fatal,
        }
    }

    /// Path of the artifact involved.
    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound(path) => path,
            Self::Malformed { path, .. } | Self::Encode { path, .. } | Self::Io { path, .. } => {
                path
            }
        }
    }
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "{} not found", path.display()),
            Self::Malformed { path, source } => {
                write!(f, "malformed artifact {}: {source}", path.display())
            }
            Self::Encode { path, source } => {
                write!(f, "failed to encode {}: {source}", path.display())
            }
            Self::Io { path, source } => write!(f, "i/o error on {}: {source}", path.display()),
        }
    }
}

impl Error for ArtifactError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound(_) => None,
            Self::Malformed { source, .. } | Self::Encode { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
        }
    }
}

/// Reads and decodes a JSON artifact.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = fs::read(path).map_err(|err| ArtifactError::io(path, err))?;
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Encodes `value` as compact JSON and atomically replaces `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let bytes = encode(path, value, false)?;
    write_atomic(path, &bytes)
}

/// Same as [`write_json`] but indented, for files people read by hand.
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let bytes = encode(path, value, true)?;
    write_atomic(path, &bytes)
}

/// Serializes `value` to JSON bytes, tagging failures with the destination path.
pub fn encode<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<Vec<u8>, ArtifactError> {
    let encoded = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    };
    encoded.map_err(|source| ArtifactError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

/// Sibling path used as the staging file for atomic replacement.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replaces `path` with `bytes`, creating parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| ArtifactError::io(parent, err))?;
        }
    }
    let staging = staging_path(path);
    fs::write(&staging, bytes).map_err(|err| ArtifactError::io(&staging, err))?;
    fs::rename(&staging, path).map_err(|err| ArtifactError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_json::<Vec<u32>>(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        let err = read_json::<Vec<u32>>(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn write_creates_parents_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/value.json");
        let mut value = BTreeMap::new();
        value.insert("a", 1u32);
        write_json_pretty(&path, &value).unwrap();

        let loaded: BTreeMap<String, u32> = read_json(&path).unwrap();
        assert_eq!(loaded.get("a"), Some(&1));
        assert!(!staging_path(&path).exists());
    }
}
