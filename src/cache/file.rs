//! Disk-backed JSON cache with modification-time expiry.
//!
//! Loaders consult these helpers before touching the provider. A file is a
//! single JSON blob; its age is judged from the filesystem mtime. Unreadable
//! or unparsable entries are deleted so the next load falls through to the
//! provider.

use std::fs;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Profile name used when `TRITON_PROFILE` is unset.
pub const UNKNOWN_PROFILE: &str = "__unknown__";

/// Directory under the user's home that holds all tool state.
pub const TOOL_ROOT: &str = ".triton-pssh";

/// Errors raised by the file cache. All variants are treated as a miss by
/// loaders; only `Io` on write is ever surfaced further.
#[derive(Debug, Error)]
pub enum FileCacheError {
    /// No cached entry exists at the path.
    #[error("no cache entry at {path}")]
    Miss {
        /// Path that was probed.
        path: Utf8PathBuf,
    },
    /// The entry exists but its mtime is older than the TTL.
    #[error("cache entry {path} expired")]
    Expired {
        /// Path of the stale entry.
        path: Utf8PathBuf,
    },
    /// The entry could not be read or written; unreadable entries are
    /// removed before this is returned.
    #[error("cache I/O failed for {path}: {message}")]
    Io {
        /// Path of the failing entry.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The entry held invalid JSON and has been removed.
    #[error("cache entry {path} was corrupt and has been removed: {message}")]
    Corrupt {
        /// Path of the removed entry.
        path: Utf8PathBuf,
        /// Decoder error string.
        message: String,
    },
}

/// Reads and decodes a cached JSON value, enforcing `ttl` against the file
/// modification time.
///
/// # Errors
///
/// Returns [`FileCacheError::Miss`] when the file does not exist,
/// [`FileCacheError::Expired`] when it is older than `ttl`, and
/// [`FileCacheError::Io`]/[`FileCacheError::Corrupt`] for unreadable or
/// undecodable entries (both of which delete the file).
pub fn read_json<T: DeserializeOwned>(path: &Utf8Path, ttl: Duration) -> Result<T, FileCacheError> {
    let metadata = fs::metadata(path).map_err(|_| FileCacheError::Miss {
        path: path.to_path_buf(),
    })?;

    let modified = metadata
        .modified()
        .map_err(|err| FileCacheError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    if modified + ttl < SystemTime::now() {
        return Err(FileCacheError::Expired {
            path: path.to_path_buf(),
        });
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(path);
            return Err(FileCacheError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(err) => {
            let _ = fs::remove_file(path);
            Err(FileCacheError::Corrupt {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        }
    }
}

/// Encodes `value` as JSON and writes it to `path`, creating parent
/// directories and overwriting any previous entry.
///
/// # Errors
///
/// Returns [`FileCacheError::Io`] when the directory or file cannot be
/// written, and [`FileCacheError::Corrupt`] when encoding fails.
pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), FileCacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| FileCacheError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;
    }

    let bytes = serde_json::to_vec(value).map_err(|err| FileCacheError::Corrupt {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    fs::write(path, bytes).map_err(|err| FileCacheError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Deterministic pathname layout for the persistent cache.
///
/// Entries live under `<root>/cache/<profile>/` keyed by resource kind and
/// identifier, so distinct provider profiles never share state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheLayout {
    root: Utf8PathBuf,
    profile: String,
}

impl CacheLayout {
    /// Creates a layout rooted at `root` for the given profile.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            profile: profile.into(),
        }
    }

    /// Builds the layout from `$HOME` and `$TRITON_PROFILE`.
    #[must_use]
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("."));
        let profile = std::env::var("TRITON_PROFILE")
            .ok()
            .filter(|profile| !profile.is_empty())
            .unwrap_or_else(|| String::from(UNKNOWN_PROFILE));
        Self::new(Utf8PathBuf::from(home).join(TOOL_ROOT), profile)
    }

    fn kind_dir(&self, kind: &str) -> Utf8PathBuf {
        self.root.join("cache").join(&self.profile).join(kind)
    }

    /// Path of the cached image record for `id`.
    #[must_use]
    pub fn image(&self, id: &str) -> Utf8PathBuf {
        self.kind_dir("image").join(id)
    }

    /// Path of the cached network record for `id`.
    #[must_use]
    pub fn network(&self, id: &str) -> Utf8PathBuf {
        self.kind_dir("network").join(id)
    }

    /// Path of the cached instance page for `(limit, offset)`.
    #[must_use]
    pub fn instances(&self, limit: u16, offset: u16) -> Utf8PathBuf {
        self.kind_dir("instances")
            .join(format!("{limit:04}-{offset:06}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use camino::Utf8PathBuf;
    use filetime::FileTime;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::*;

    #[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
    struct Record {
        id: String,
        public: bool,
    }

    fn temp_path(tmp: &TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join(name))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }

    #[test]
    fn round_trips_json_values() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "nested/dir/record");
        let record = Record {
            id: String::from("net-1"),
            public: true,
        };

        write_json(&path, &record).unwrap_or_else(|err| panic!("write: {err}"));
        let loaded: Record = read_json(&path, Duration::from_secs(3600))
            .unwrap_or_else(|err| panic!("read: {err}"));

        assert_eq!(loaded, record);
    }

    #[test]
    fn missing_entry_reports_miss() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "absent");

        let result: Result<Record, _> = read_json(&path, Duration::from_secs(1));
        assert!(matches!(result, Err(FileCacheError::Miss { .. })));
    }

    #[test]
    fn stale_entry_reports_expired() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "stale");
        write_json(
            &path,
            &Record {
                id: String::from("net-1"),
                public: false,
            },
        )
        .unwrap_or_else(|err| panic!("write: {err}"));

        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        filetime::set_file_mtime(path.as_std_path(), FileTime::from_system_time(two_hours_ago))
            .unwrap_or_else(|err| panic!("set mtime: {err}"));

        let result: Result<Record, _> = read_json(&path, Duration::from_secs(3600));
        assert!(matches!(result, Err(FileCacheError::Expired { .. })));
    }

    #[test]
    fn corrupt_entry_is_deleted() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "corrupt");
        std::fs::write(&path, b"{ not json").unwrap_or_else(|err| panic!("seed: {err}"));

        let result: Result<Record, _> = read_json(&path, Duration::from_secs(3600));
        assert!(matches!(result, Err(FileCacheError::Corrupt { .. })));
        assert!(!path.exists(), "corrupt entry should have been removed");
    }

    #[test]
    fn layout_builds_zero_padded_page_names() {
        let layout = CacheLayout::new("/home/me/.triton-pssh", "east-1");
        assert_eq!(
            layout.instances(1000, 3000),
            Utf8PathBuf::from("/home/me/.triton-pssh/cache/east-1/instances/1000-003000")
        );
        assert_eq!(
            layout.image("img-9"),
            Utf8PathBuf::from("/home/me/.triton-pssh/cache/east-1/image/img-9")
        );
        assert_eq!(
            layout.network("net-9"),
            Utf8PathBuf::from("/home/me/.triton-pssh/cache/east-1/network/net-9")
        );
    }
}
