//! The repository interface (spec.md §4.5): the abstract transport that decouples *how* bytes are
//! fetched (local filesystem, HTTP) from the update engine's policy. Grounded on `tough`'s
//! `Transport` trait and `HttpTransport` retry logic -- both written as plain synchronous code, a
//! choice this crate preserves because spec.md §5 specifies a single-threaded, synchronous engine
//! with no cooperative-suspension obligations beyond blocking I/O inside `with_remote`.
//!
//! `RawTransport` is the low-level "open a `Read` for this URL" capability (`tough::Transport`).
//! `RepositoryTransport` is the higher-level capability bundle spec.md §4.5 and §9 ("Repository as
//! a capability bundle") call for: it owns a `RawTransport`, the local `Cache`, and the base URLs,
//! and implements `with_remote`/`get_cached`/`get_cached_root`/`clear_cache`/`read_from_index`/
//! `log` as one coherent interface.

use crate::cache::Cache;
use crate::error::{self, Result};
use crate::schema::RoleType;
use dyn_clone::DynClone;
use log::{debug, error, trace};
use reqwest::blocking::{Client, ClientBuilder, Request, Response};
use reqwest::header::{self, HeaderValue, ACCEPT_RANGES};
use reqwest::Method;
use snafu::ResultExt;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use url::Url;

/// A package identifier: `{ name, version }` (spec.md §6, "Package identifiers"). Treated as
/// opaque except for path construction, where `/` or `..` in either field is rejected
/// (`UnsafePathComponent`) rather than silently producing a path outside the intended prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    /// The package name.
    pub name: String,
    /// The package version.
    pub version: String,
}

fn ensure_safe_component(component: &str) -> Result<()> {
    snafu::ensure!(
        !component.is_empty() && !component.contains('/') && component != "..",
        error::UnsafePathComponentSnafu {
            component: component.to_string(),
        }
    );
    Ok(())
}

impl PackageId {
    /// The remote path of this package's tarball: `<name>/<version>/<name>-<version>.tar.gz`
    /// (spec.md §6).
    pub fn tarball_path(&self) -> Result<String> {
        ensure_safe_component(&self.name)?;
        ensure_safe_component(&self.version)?;
        Ok(format!("{0}/{1}/{0}-{1}.tar.gz", self.name, self.version))
    }

    /// The remote (and index-archive-member) path of this package's `targets.json` entry:
    /// `<name>/<version>/targets.json` (spec.md §6).
    pub fn targets_path(&self) -> Result<String> {
        ensure_safe_component(&self.name)?;
        ensure_safe_component(&self.version)?;
        Ok(format!("{}/{}/targets.json", self.name, self.version))
    }
}

/// A file the engine wants fetched, tagged with everything the transport needs to enforce the
/// endless-data ceiling and, for the index, to choose an archive form (spec.md §4.5).
#[derive(Debug, Clone)]
pub enum RemoteFile {
    /// `timestamp.json`. Its length is never asserted by anything (there's no document that
    /// signs it in advance), so the caller bounds it by `Limits::max_timestamp_size`.
    RemoteTimestamp {
        /// The caller-supplied ceiling (`Limits::max_timestamp_size`).
        max_len: u64,
    },
    /// `root.json` (or `<version>.root.json` under consistent snapshots). The caller supplies the
    /// bound: the length asserted by snapshot during normal update, or `Limits::max_root_size`
    /// during root recovery, where no document asserts a length in advance.
    RemoteRoot {
        /// The relative path to fetch, already resolved for the consistent-snapshot convention.
        path: String,
        /// The length bound: asserted by snapshot, or `Limits::max_root_size` during recovery.
        max_len: u64,
    },
    /// `snapshot.json` (or `<version>.snapshot.json`), with its length from `timestamp.json`.
    RemoteSnapshot {
        /// The relative path to fetch.
        path: String,
        /// The exact length asserted by timestamp.
        len: u64,
    },
    /// The package index, in both archive forms a transport may serve; the transport elects
    /// `.tar.gz` or `.tar`, trying the former first.
    RemoteIndex {
        /// Relative path of the gzip-compressed archive.
        tgz_path: String,
        /// Its asserted length.
        tgz_len: u64,
        /// Relative path of the uncompressed archive, if the repository publishes one.
        tar_path: Option<String>,
        /// Its asserted length, if published.
        tar_len: Option<u64>,
    },
    /// A package tarball, with its length from the per-package `targets.json` file-info.
    RemotePkgTarGz {
        /// The package this tarball belongs to.
        package: PackageId,
        /// Relative path of the tarball.
        path: String,
        /// The exact length asserted by the targets entry.
        len: u64,
    },
}

/// Caching disposition for a `RemoteFile`, once successfully fetched and verified by the caller's
/// `with_remote` callback (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MustCache {
    /// Persist as the cached index archive.
    CacheIndex,
    /// Never persist via `with_remote`'s own auto-commit; either the caller consumes the temp
    /// file's contents before it is deleted, or (for timestamp/snapshot/root) the engine persists
    /// it explicitly itself, once `trust::verify_*` has accepted it.
    DontCache,
}

impl RemoteFile {
    /// The caching disposition for this file (spec.md §4.5, "must_cache policy"). `timestamp.json`,
    /// `snapshot.json`, and `root.json` are all `DontCache` here: `with_remote`'s callback only
    /// reads bytes into memory, it doesn't verify them -- the corresponding `trust::verify_*` call
    /// happens afterward, in `engine.rs`. Auto-persisting on a callback's bare `Ok(())` would write
    /// a file to the durable cache before it's known to be genuinely trusted:
    /// - for `snapshot.json`, before the index it describes has also been checked (spec.md §4.6
    ///   step 6), which would let a later cycle's "unchanged repository" short-circuit (step 3)
    ///   treat an index that never actually passed step 6 as already trusted;
    /// - for `timestamp.json` and `root.json`, before rollback/continuity verification, which would
    ///   let a rejected (e.g. rolled-back, or not properly cross-signed) file overwrite the cached
    ///   version a future cycle compares against or anchors trust to -- for `root.json` specifically,
    ///   this is the trust anchor itself.
    ///
    /// The engine persists each of these itself, only once `trust::verify_*` has accepted it
    /// (mirroring `tough::load_timestamp`/`load_snapshot`, which call `datastore.create` only after
    /// all checks -- including the freeze check -- pass).
    pub fn must_cache(&self) -> MustCache {
        match self {
            Self::RemoteTimestamp { .. } => MustCache::DontCache,
            Self::RemoteRoot { .. } => MustCache::DontCache,
            Self::RemoteSnapshot { .. } => MustCache::DontCache,
            Self::RemoteIndex { .. } => MustCache::CacheIndex,
            Self::RemotePkgTarGz { .. } => MustCache::DontCache,
        }
    }
}

/// A progress/warning event a `RepositoryTransport` emits to an embedding application
/// (spec.md §4.5, §6).
#[derive(Debug, Clone)]
pub enum Event {
    /// Root was rotated during normal update (informational).
    RootUpdated {
        /// The newly installed root version.
        new_version: u64,
    },
    /// A verification failure occurred and root recovery was entered (warning; recoverable).
    VerificationError {
        /// A human-readable description of the failure.
        message: String,
        /// The role whose verification failed.
        role: RoleType,
    },
}

/// The low-level capability a `Transport` provides: open a `Read` over a URL. Mirrors
/// `tough::Transport`. Boxed trait objects must stay `Clone`, since a `RepositoryTransport` is
/// handed out to callers who may want their own handle; `dyn_clone` provides that without giving
/// up object safety.
pub trait RawTransport: Debug + DynClone {
    /// Opens a reader over `url`'s contents.
    fn fetch(&self, url: Url) -> std::result::Result<Box<dyn Read + Send>, TransportError>;
}

dyn_clone::clone_trait_object!(RawTransport);

/// The kind of error a `RawTransport` experienced.
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// The transport does not handle the URL's scheme (e.g. `file://` given to an HTTP-only
    /// transport).
    UnsupportedUrlScheme,
    /// The file does not exist.
    FileNotFound,
    /// Any other transport-level failure (I/O error, broken connection, etc).
    Other,
}

/// The error type `RawTransport::fetch` and the streams it returns produce.
#[derive(Debug)]
pub struct TransportError {
    /// The kind of failure.
    pub kind: TransportErrorKind,
    /// The URL being fetched.
    pub url: String,
    /// The underlying cause.
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} error fetching '{}': {}",
            self.kind, self.url, self.source
        )
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl TransportError {
    /// Builds a new `TransportError`.
    pub fn new<S, E>(kind: TransportErrorKind, url: S, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        S: AsRef<str>,
    {
        Self {
            kind,
            url: url.as_ref().to_string(),
            source: source.into(),
        }
    }

    fn unsupported_scheme<S: AsRef<str>>(url: S) -> Self {
        Self::new(
            TransportErrorKind::UnsupportedUrlScheme,
            url,
            "transport cannot handle this URL scheme".to_string(),
        )
    }
}

/// A `RawTransport` for `file://` URLs.
#[derive(Debug, Clone, Copy)]
pub struct FilesystemTransport;

impl RawTransport for FilesystemTransport {
    fn fetch(&self, url: Url) -> std::result::Result<Box<dyn Read + Send>, TransportError> {
        if url.scheme() != "file" {
            return Err(TransportError::unsupported_scheme(url));
        }
        let f = std::fs::File::open(url.path()).map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::NotFound => TransportErrorKind::FileNotFound,
                _ => TransportErrorKind::Other,
            };
            TransportError::new(kind, url.clone(), e)
        })?;
        Ok(Box::new(f))
    }
}

/// Settings for `HttpTransport`'s retry strategy and timeouts (mirrors `tough::ClientSettings`).
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Timeout for connect, read and write operations.
    pub timeout: Duration,
    /// Timeout for the connect phase only.
    pub connect_timeout: Duration,
    /// Total number of attempts before giving up.
    pub tries: u32,
    /// Pause between the first and second try.
    pub initial_backoff: Duration,
    /// Maximum pause between retries.
    pub max_backoff: Duration,
    /// Exponential backoff multiplier applied after each retry.
    pub backoff_factor: f32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tries: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_factor: 1.5,
        }
    }
}

/// A `RawTransport` for `http://`/`https://` URLs, with byte-range retry (mirrors
/// `tough::HttpTransport`).
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    settings: ClientSettings,
}

impl HttpTransport {
    /// Creates a transport with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with specific settings.
    pub fn from_settings(settings: ClientSettings) -> Self {
        Self { settings }
    }
}

impl RawTransport for HttpTransport {
    fn fetch(&self, url: Url) -> std::result::Result<Box<dyn Read + Send>, TransportError> {
        let mut retry = RetryState::new(self.settings.initial_backoff);
        let read = fetch_with_retries(&mut retry, &self.settings, &url)?;
        Ok(Box::new(read))
    }
}

#[derive(Clone, Copy, Debug)]
struct RetryState {
    current_try: u32,
    wait: Duration,
    next_byte: usize,
}

impl RetryState {
    fn new(initial_wait: Duration) -> Self {
        Self {
            current_try: 0,
            wait: initial_wait,
            next_byte: 0,
        }
    }

    fn increment(&mut self, settings: &ClientSettings) {
        if self.current_try > 0 {
            let new_wait = self.wait.mul_f32(settings.backoff_factor);
            self.wait = match new_wait.cmp(&settings.max_backoff) {
                Ordering::Less => new_wait,
                Ordering::Greater | Ordering::Equal => settings.max_backoff,
            };
        }
        self.current_try += 1;
    }
}

/// A `Read` over an in-flight HTTP response that retries (with a range header) on I/O failure, as
/// long as the server supports `Accept-Ranges: bytes`.
#[derive(Debug)]
struct RetryRead {
    retry_state: RetryState,
    settings: ClientSettings,
    response: Response,
    url: Url,
}

impl Read for RetryRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let retry_err = match self.response.read(buf) {
                Ok(sz) => {
                    self.retry_state.next_byte += sz;
                    return Ok(sz);
                }
                Err(err) => err,
            };
            debug!("error during read of '{}': {:?}", self.url, retry_err);

            if self.retry_state.current_try >= self.settings.tries - 1 {
                return Err(retry_err);
            }
            self.retry_state.increment(&self.settings);
            std::thread::sleep(self.retry_state.wait);
            if !self.supports_range() {
                error!(
                    "an error occurred and the server does not support range requests \
                     for '{}': {:?}",
                    self.url, retry_err
                );
                return Err(retry_err);
            }
            let retried = fetch_with_retries(&mut self.retry_state, &self.settings, &self.url)
                .map_err(std::io::Error::other)?;
            self.response = retried.response;
        }
    }
}

impl RetryRead {
    fn supports_range(&self) -> bool {
        self.response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("bytes"))
    }
}

fn build_request(
    client: &Client,
    next_byte: usize,
    url: &Url,
) -> std::result::Result<Request, TransportError> {
    let mut builder = client.request(Method::GET, url.as_str());
    if next_byte > 0 {
        let value = format!("bytes={next_byte}-");
        let header_value = HeaderValue::from_str(&value)
            .map_err(|e| TransportError::new(TransportErrorKind::Other, url.clone(), e))?;
        builder = builder.header(header::RANGE, header_value);
    }
    builder
        .build()
        .map_err(|e| TransportError::new(TransportErrorKind::Other, url.clone(), e))
}

fn fetch_with_retries(
    r: &mut RetryState,
    cs: &ClientSettings,
    url: &Url,
) -> std::result::Result<RetryRead, TransportError> {
    trace!("beginning fetch for '{}'", url);
    let client = ClientBuilder::new()
        .timeout(cs.timeout)
        .connect_timeout(cs.connect_timeout)
        .build()
        .map_err(|e| TransportError::new(TransportErrorKind::Other, url.clone(), e))?;

    loop {
        let request = build_request(&client, r.next_byte, url)?;
        let result = client.execute(request).and_then(Response::error_for_status);

        let retry_err = match result {
            Ok(response) => {
                return Ok(RetryRead {
                    retry_state: *r,
                    settings: *cs,
                    response,
                    url: url.clone(),
                });
            }
            Err(err) => {
                if let Some(status) = err.status() {
                    if !status.is_success() && !status.is_server_error() {
                        let kind = if status.as_u16() == 404 {
                            TransportErrorKind::FileNotFound
                        } else {
                            TransportErrorKind::Other
                        };
                        return Err(TransportError::new(kind, url.clone(), err));
                    }
                }
                err
            }
        };

        if r.current_try >= cs.tries - 1 {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                url.clone(),
                retry_err,
            ));
        }
        r.increment(cs);
        std::thread::sleep(r.wait);
    }
}

/// Reads at most `max_len` bytes from `inner`, raising `EndlessData` the moment more arrive. This
/// is the endless-data defense (spec.md §4.5, §7): the transport enforces the ceiling named in the
/// file descriptor it was given, rather than trusting the server to stop on its own.
struct LengthLimitedReader<R> {
    inner: R,
    role: &'static str,
    max_len: u64,
    read_so_far: u64,
}

impl<R: Read> Read for LengthLimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read_so_far += n as u64;
        if self.read_so_far > self.max_len {
            return Err(std::io::Error::other(error::Error::EndlessData {
                role: self.role,
                max_size: self.max_len,
                backtrace: snafu::Backtrace::new(),
            }));
        }
        Ok(n)
    }
}

/// The repository interface (spec.md §4.5): a capability bundle combining a `RawTransport`, the
/// local `Cache`, and the base URLs a repository is served from.
#[derive(Debug, Clone)]
pub struct RepositoryTransport {
    raw: Box<dyn RawTransport>,
    metadata_base_url: Url,
    targets_base_url: Url,
    cache: Arc<Cache>,
}

impl RepositoryTransport {
    /// Builds a new repository interface.
    pub fn new(
        raw: Box<dyn RawTransport>,
        metadata_base_url: Url,
        targets_base_url: Url,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            raw,
            metadata_base_url,
            targets_base_url,
            cache,
        }
    }

    /// The underlying local cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn join(&self, base: &Url, path: &str) -> Result<Url> {
        base.join(path)
            .map_err(|e| TransportError::new(TransportErrorKind::Other, base.as_str(), e))
            .context(error::TransportSnafu {
                file: path.to_string(),
            })
    }

    fn fetch_limited(
        &self,
        base: &Url,
        path: &str,
        role: &'static str,
        max_len: u64,
    ) -> Result<LengthLimitedReader<Box<dyn Read + Send>>> {
        let url = self.join(base, path)?;
        let inner = self
            .raw
            .fetch(url)
            .context(error::TransportSnafu {
                file: path.to_string(),
            })?;
        Ok(LengthLimitedReader {
            inner,
            role,
            max_len,
            read_so_far: 0,
        })
    }

    /// `with_remote(remote_file, callback)` (spec.md §4.5): downloads `file` to a temporary path,
    /// invokes `callback` with that path, and on success persists the temp file to its cache
    /// location unless `file.must_cache()` is `DontCache`. On any failure -- transport, or the
    /// callback's own verification -- the temp file is discarded; this is enforced by RAII
    /// (`tempfile::NamedTempFile`'s drop glue), not a scattered cleanup call (spec.md §9, "Scoped
    /// temp-file discipline").
    pub fn with_remote(
        &self,
        file: RemoteFile,
        mut callback: impl FnMut(&Path) -> Result<()>,
    ) -> Result<()> {
        match &file {
            RemoteFile::RemoteTimestamp { max_len } => {
                let mut reader = self.fetch_limited(
                    &self.metadata_base_url,
                    "timestamp.json",
                    "timestamp",
                    *max_len,
                )?;
                self.commit(&mut reader, "timestamp.json", &file, &mut callback)
            }
            RemoteFile::RemoteRoot { path, max_len } => {
                let mut reader =
                    self.fetch_limited(&self.metadata_base_url, path, "root", *max_len)?;
                self.commit(&mut reader, "root.json", &file, &mut callback)
            }
            RemoteFile::RemoteSnapshot { path, len } => {
                let mut reader =
                    self.fetch_limited(&self.metadata_base_url, path, "snapshot", *len)?;
                self.commit(&mut reader, "snapshot.json", &file, &mut callback)
            }
            RemoteFile::RemoteIndex {
                tgz_path,
                tgz_len,
                tar_path,
                tar_len,
            } => match self.fetch_limited(&self.metadata_base_url, tgz_path, "index", *tgz_len) {
                Ok(mut reader) => {
                    self.commit(&mut reader, "00-index.tar.gz", &file, &mut callback)
                }
                Err(e) => {
                    let Some(path) = tar_path else {
                        return Err(e);
                    };
                    let len = tar_len.unwrap_or(*tgz_len);
                    let mut reader = self.fetch_limited(&self.metadata_base_url, path, "index", len)?;
                    self.commit(&mut reader, "00-index.tar", &file, &mut callback)
                }
            },
            RemoteFile::RemotePkgTarGz { path, len, .. } => {
                let mut reader =
                    self.fetch_limited(&self.targets_base_url, path, "targets.json", *len)?;
                self.commit(&mut reader, path, &file, &mut callback)
            }
        }
    }

    fn commit(
        &self,
        reader: &mut impl Read,
        cache_filename: &str,
        file: &RemoteFile,
        callback: &mut impl FnMut(&Path) -> Result<()>,
    ) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(self.cache.path()).context(error::CacheIoSnafu {
            path: self.cache.path(),
        })?;
        std::io::copy(reader, &mut tmp).map_err(|source| error::Error::CacheIo {
            path: tmp.path().to_path_buf(),
            source,
            backtrace: snafu::Backtrace::new(),
        })?;

        callback(tmp.path())?;

        if !matches!(file.must_cache(), MustCache::DontCache) {
            let dest = self.cache.path().join(cache_filename);
            tmp.persist(&dest).map_err(|e| error::Error::CacheIo {
                path: dest,
                source: e.error,
                backtrace: snafu::Backtrace::new(),
            })?;
        }
        Ok(())
    }

    /// `get_cached(role) -> Option<path>` (spec.md §4.4).
    pub fn get_cached(&self, role: RoleType) -> Result<Option<PathBuf>> {
        self.cache.get_cached(role)
    }

    /// `get_cached_root() -> path` (spec.md §4.4).
    pub fn get_cached_root(&self) -> Result<PathBuf> {
        self.cache.get_cached_root()
    }

    /// `clear_cache()` (spec.md §4.4).
    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear_cache()
    }

    /// `read_from_index(target) -> Option<bytes>` (spec.md §4.4).
    pub fn read_from_index(&self, target: &str) -> Result<Option<Vec<u8>>> {
        self.cache.read_from_index(target)
    }

    /// Opens a streaming, length-bounded reader over a package tarball, bypassing the cache
    /// commit machinery `with_remote` uses for metadata (package tarballs are never cached:
    /// spec.md §4.5 `must_cache` policy). Used by `crate::engine::Repository::fetch_package` to
    /// hash-verify the stream as the caller reads it, rather than buffering the whole download
    /// (SPEC_FULL B.5).
    pub(crate) fn fetch_target_stream(
        &self,
        path: &str,
        max_len: u64,
    ) -> Result<impl Read + Send> {
        self.fetch_limited(&self.targets_base_url, path, "package", max_len)
    }

    /// `log(event)` (spec.md §4.5): the progress/warning sink. Default implementation logs via
    /// the `log` crate; embedders who need structured events should match on `Event` themselves
    /// rather than parsing log lines.
    pub fn log(&self, event: &Event) {
        match event {
            Event::RootUpdated { new_version } => {
                log::info!("root updated to version {new_version}");
            }
            Event::VerificationError { message, role } => {
                log::warn!("verification error for {}: {message}", role.as_str());
            }
        }
    }
}

/// A `RepositoryTransport` backed by local files, for tests and offline/vendored repositories.
pub fn filesystem_transport(
    metadata_base_url: Url,
    targets_base_url: Url,
    cache: Arc<Cache>,
) -> RepositoryTransport {
    RepositoryTransport::new(
        Box::new(FilesystemTransport),
        metadata_base_url,
        targets_base_url,
        cache,
    )
}

/// A `RepositoryTransport` backed by HTTP, with retry (spec.md §4.5; this crate's `http` feature).
#[cfg(feature = "http")]
pub fn http_transport(
    metadata_base_url: Url,
    targets_base_url: Url,
    cache: Arc<Cache>,
    settings: ClientSettings,
) -> RepositoryTransport {
    RepositoryTransport::new(
        Box::new(HttpTransport::from_settings(settings)),
        metadata_base_url,
        targets_base_url,
        cache,
    )
}
