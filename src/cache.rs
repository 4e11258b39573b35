//! The local cache (spec.md §4.4): a durable directory holding the last verified root,
//! timestamp, snapshot, and package index. Writes are append-then-rename so a partial write
//! never becomes the file a reader sees (spec.md §4.4, §5 "Resource discipline").
//!
//! Grounded on `tough::datastore::Datastore`, with two deliberate departures noted where they
//! happen: this crate has no internal concurrency (spec.md §5: the engine is single-threaded and
//! synchronous; callers provide mutual exclusion externally), so there is no `RwLock` here, and
//! the monotonic-clock check takes the caller-supplied `now` rather than sampling the clock
//! itself, since every verification routine in `crate::trust` already takes `now` as a parameter.

use crate::error::{self, Result};
use crate::schema::{Root, RoleType};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use log::debug;
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};

const ROOT_FILE: &str = "root.json";
const TIMESTAMP_FILE: &str = "timestamp.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const INDEX_TAR_GZ_FILE: &str = "00-index.tar.gz";
const INDEX_TAR_FILE: &str = "00-index.tar";
const LATEST_KNOWN_TIME_FILE: &str = "latest_known_time.json";

/// Either a caller-managed directory, or one we created and must keep alive for its lifetime.
#[derive(Debug)]
enum CacheDir {
    Path(PathBuf),
    TempDir(TempDir),
}

impl CacheDir {
    fn path(&self) -> &Path {
        match self {
            Self::Path(p) => p,
            Self::TempDir(t) => t.path(),
        }
    }
}

/// The on-disk cache described in spec.md §4.4 and laid out in §6.
#[derive(Debug)]
pub struct Cache {
    dir: CacheDir,
}

impl Cache {
    /// Opens (without creating any files) a cache rooted at `path`. If `path` is `None`, creates
    /// a process-lifetime temporary directory -- useful for tests and for callers that don't want
    /// a durable cache across runs.
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let dir = match path {
            Some(p) => CacheDir::Path(p),
            None => CacheDir::TempDir(TempDir::new().map_err(|source| error::Error::CacheIo {
                path: std::env::temp_dir(),
                source,
                backtrace: snafu::Backtrace::new(),
            })?),
        };
        Ok(Self { dir })
    }

    /// The directory this cache is rooted at.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn filename(role: RoleType) -> &'static str {
        match role {
            RoleType::Root => ROOT_FILE,
            RoleType::Timestamp => TIMESTAMP_FILE,
            RoleType::Snapshot => SNAPSHOT_FILE,
            RoleType::Targets => {
                unreachable!("targets are read from the index, not cached directly")
            }
        }
    }

    /// Path to `role`'s cached file, whether or not it currently exists.
    fn role_path(&self, role: RoleType) -> PathBuf {
        self.path().join(Self::filename(role))
    }

    /// `get_cached(role) -> Option<path>` (spec.md §4.4), for `root`, `timestamp`, and `snapshot`.
    pub fn get_cached(&self, role: RoleType) -> Result<Option<PathBuf>> {
        let path = self.role_path(role);
        Ok(path.is_file().then_some(path))
    }

    /// `get_cached_root() -> path` (spec.md §4.4). Unlike `get_cached`, this must always succeed;
    /// the client cannot start without a trust anchor, so a missing root is a hard error rather
    /// than `None`.
    pub fn get_cached_root(&self) -> Result<PathBuf> {
        let path = self.role_path(RoleType::Root);
        path.is_file()
            .then_some(path)
            .context(error::NoTrustedRootSnafu)
    }

    /// Reads the raw bytes of `role`'s cached file, if present.
    pub fn read_cached(&self, role: RoleType) -> Result<Option<Vec<u8>>> {
        self.read_file(Self::filename(role))
    }

    fn read_file(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path().join(file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(error::Error::CacheIo {
                path,
                source,
                backtrace: snafu::Backtrace::new(),
            }),
        }
    }

    /// Atomically writes `bytes` as `file`, so that any reader sees either the old contents or
    /// the new ones, never a partial write. Writes the temp file into the cache directory itself
    /// so the final rename is same-filesystem (and therefore atomic).
    pub(crate) fn write_atomic(&self, file: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(self.path()).context(error::CacheIoSnafu { path: self.path() })?;
        let mut tmp =
            NamedTempFile::new_in(self.path()).context(error::CacheIoSnafu { path: self.path() })?;
        std::io::Write::write_all(&mut tmp, bytes)
            .context(error::CacheIoSnafu { path: self.path() })?;
        let dest = self.path().join(file);
        tmp.persist(&dest).map_err(|e| error::Error::CacheIo {
            path: dest,
            source: e.error,
            backtrace: snafu::Backtrace::new(),
        })?;
        Ok(())
    }

    pub(crate) fn write_role(&self, role: RoleType, bytes: &[u8]) -> Result<()> {
        self.write_atomic(Self::filename(role), bytes)
    }

    fn remove_file(&self, file: &str) -> Result<()> {
        let path = self.path().join(file);
        debug!("removing '{}'", path.display());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(error::Error::CacheIo {
                path,
                source,
                backtrace: snafu::Backtrace::new(),
            }),
        }
    }

    /// `clear_cache()` (spec.md §4.4): removes timestamp and snapshot at minimum. Index removal
    /// is permitted but not required by the spec, and we don't do it here -- a stale index is
    /// harmless since it is only ever trusted against a freshly verified snapshot's file-info.
    pub fn clear_cache(&self) -> Result<()> {
        self.remove_file(TIMESTAMP_FILE)?;
        self.remove_file(SNAPSHOT_FILE)?;
        Ok(())
    }

    /// Key-rotation cache invalidation (SPEC_FULL B.2, grounded on `tough::load_root`'s step 1.9):
    /// if `new` authorizes a different key set for `timestamp` or `snapshot` than `old` did,
    /// discard the cached timestamp/snapshot so a file signed under now-revoked keys can never be
    /// re-validated against them by accident.
    pub(crate) fn invalidate_on_root_rotation(&self, old: &Root, new: &Root) -> Result<()> {
        if Self::role_keys_changed(old, new, RoleType::Timestamp) {
            self.remove_file(TIMESTAMP_FILE)?;
        }
        if Self::role_keys_changed(old, new, RoleType::Snapshot) {
            self.remove_file(SNAPSHOT_FILE)?;
        }
        Ok(())
    }

    fn role_keys_changed(old: &Root, new: &Root, role: RoleType) -> bool {
        let old_keys = old.role_keys(role).map(|rk| &rk.keyids);
        let new_keys = new.role_keys(role).map(|rk| &rk.keyids);
        old_keys != new_keys
    }

    /// Reads a per-package `targets.json` entry out of the cached index archive
    /// (`00-index.tar.gz`, falling back to `00-index.tar`), returning `None` if no such entry
    /// exists in the index. `target` must be the exact archive member path, e.g.
    /// `"name/version/targets.json"`.
    pub fn read_from_index(&self, target: &str) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.read_file(INDEX_TAR_GZ_FILE)? {
            let decoder = GzDecoder::new(bytes.as_slice());
            return Self::find_in_tar(decoder, target);
        }
        if let Some(bytes) = self.read_file(INDEX_TAR_FILE)? {
            return Self::find_in_tar(bytes.as_slice(), target);
        }
        Ok(None)
    }

    fn find_in_tar<R: Read>(reader: R, target: &str) -> Result<Option<Vec<u8>>> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive.entries().context(error::IndexArchiveSnafu)?;
        for entry in entries {
            let mut entry = entry.context(error::IndexArchiveSnafu)?;
            let path = entry.path().context(error::IndexArchiveSnafu)?;
            if path.as_os_str() == target {
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .context(error::IndexArchiveSnafu)?;
                return Ok(Some(buf));
            }
        }
        Ok(None)
    }

    /// Monotonic local clock check (SPEC_FULL B.3, grounded on `tough::datastore::system_time`):
    /// records the latest `now` this cache has ever been asked to treat as current, and refuses a
    /// `now` earlier than one already recorded. A host clock reset backward (whether accidental or
    /// attacker-induced) can otherwise make an expired document look fresh again.
    pub(crate) fn check_monotonic(&self, now: DateTime<Utc>) -> Result<()> {
        let previous = self
            .read_file(LATEST_KNOWN_TIME_FILE)?
            .and_then(|bytes| serde_json::from_slice::<DateTime<Utc>>(&bytes).ok());

        if let Some(previous) = previous {
            snafu::ensure!(
                now >= previous,
                error::ClockRolledBackSnafu {
                    previous,
                    current: now,
                }
            );
        }

        let encoded = serde_json::to_vec(&now).expect("DateTime<Utc> always serializes");
        self.write_atomic(LATEST_KNOWN_TIME_FILE, &encoded)
    }
}
