//! The crate-wide error type. One variant per failure kind named in spec.md §7; each carries
//! enough context to build a useful message without the caller needing to consult logs.

use snafu::{Backtrace, Snafu};
use std::path::PathBuf;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Checks a file's observed length against the length bound in the file-info that named it.
pub(crate) fn ensure_length_matches(role: &'static str, expected: u64, actual: u64) -> Result<()> {
    snafu::ensure!(expected == actual, LengthMismatchSnafu { role, expected, actual });
    Ok(())
}

/// Errors produced by this crate.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// A metadata document was not well-formed JSON, or did not match the expected shape for its
    /// role.
    #[snafu(display("failed to parse {role} metadata: {source}"))]
    ParseError {
        role: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    /// A metadata document's `_type` field did not match the role it was fetched as.
    #[snafu(display("expected a {expected} document but found type {found:?}"))]
    InvalidType {
        expected: &'static str,
        found: String,
        backtrace: Backtrace,
    },

    /// A document's canonical form could not be computed, because it contained a value the
    /// canonical encoding cannot represent (e.g. a non-integer number or a non-UTF-8 map key).
    #[snafu(display("could not canonicalize document: {reason}"))]
    CanonicalizeError { reason: String, backtrace: Backtrace },

    /// Too few valid signatures were found over a document to meet its role's threshold.
    #[snafu(display(
        "signature threshold not met for {role}: needed {threshold}, found {valid} valid out of \
         {total} signatures"
    ))]
    SignatureMismatch {
        role: &'static str,
        threshold: u64,
        valid: u64,
        total: usize,
        backtrace: Backtrace,
    },

    /// A trusted document's key material used a signature scheme this build does not implement.
    #[snafu(display("key {key_id} uses an unrecognized signing algorithm"))]
    UnknownKeyAlgorithm { key_id: String, backtrace: Backtrace },

    /// A `FileInfo`'s `hashes` map named only algorithms this build does not implement.
    #[snafu(display("no recognized hash algorithm among: {found:?}"))]
    UnknownHashAlgorithm {
        found: Vec<String>,
        backtrace: Backtrace,
    },

    /// A role's metadata had an `expires` timestamp at or before the time of verification.
    #[snafu(display("{role} metadata expired at {expires}"))]
    ExpiredMetadata {
        role: &'static str,
        expires: chrono::DateTime<chrono::Utc>,
        backtrace: Backtrace,
    },

    /// A newly fetched role document had a version lower than, or equal to when a strict
    /// increase was required, the previously trusted version.
    #[snafu(display(
        "rollback attack detected: cached {role} is version {cached_version}, fetched version is \
         {new_version}"
    ))]
    RollbackAttack {
        role: &'static str,
        cached_version: u64,
        new_version: u64,
        backtrace: Backtrace,
    },

    /// A fetched file's length did not match the length asserted by the metadata that referenced
    /// it.
    #[snafu(display(
        "{role} length mismatch: expected at most {expected} bytes, found {actual}"
    ))]
    LengthMismatch {
        role: &'static str,
        expected: u64,
        actual: u64,
        backtrace: Backtrace,
    },

    /// A fetched file's digest did not match the digest asserted by the metadata that referenced
    /// it.
    #[snafu(display("{role} hash mismatch: expected {expected}, calculated {calculated}"))]
    HashMismatch {
        role: String,
        expected: String,
        calculated: String,
        backtrace: Backtrace,
    },

    /// A remote file exceeded its configured maximum size without terminating, i.e. an
    /// endless-data attack.
    #[snafu(display("{role} exceeded the maximum permitted size of {max_size} bytes"))]
    EndlessData {
        role: &'static str,
        max_size: u64,
        backtrace: Backtrace,
    },

    /// Root recovery made no progress after fetching a root document one version newer than the
    /// one that triggered recovery, without ever reaching a non-expired, self-consistent root.
    #[snafu(display("root recovery looped without converging, starting from version {from_version}"))]
    RootUpdateLoop {
        from_version: u64,
        backtrace: Backtrace,
    },

    /// The number of root-recovery cycles permitted per `refresh()` call (spec.md's hop bound)
    /// was exceeded.
    #[snafu(display("exceeded the maximum of {max_hops} root-recovery cycles in one refresh"))]
    MaxRootHopsExceeded { max_hops: u32, backtrace: Backtrace },

    /// A second root-recovery cycle was triggered while one was already in flight for the same
    /// `refresh()` call.
    #[snafu(display("root recovery was triggered twice within a single refresh"))]
    DoubleRecovery { backtrace: Backtrace },

    /// The local system clock reported a time earlier than one previously observed and recorded.
    #[snafu(display(
        "system clock moved backward: last observed {previous}, now reporting {current}"
    ))]
    ClockRolledBack {
        previous: chrono::DateTime<chrono::Utc>,
        current: chrono::DateTime<chrono::Utc>,
        backtrace: Backtrace,
    },

    /// The underlying transport failed to fetch a remote file.
    #[snafu(display("failed to fetch {file}: {source}"))]
    Transport {
        file: String,
        #[snafu(source(from(crate::transport::TransportError, Box::new)))]
        source: Box<crate::transport::TransportError>,
        backtrace: Backtrace,
    },

    /// A local cache file could not be read or written.
    #[snafu(display("cache I/O error at {}: {source}", path.display()))]
    CacheIo {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// A target's identity (name/version) produced an unsafe path component (e.g. `..`) when
    /// mapped to a cache or index path.
    #[snafu(display("refusing to use unsafe path component: {component}"))]
    UnsafePathComponent {
        component: String,
        backtrace: Backtrace,
    },

    /// The per-package index archive did not contain an entry for the requested package.
    #[snafu(display("package {package_id} is not present in the index"))]
    PackageNotInIndex {
        package_id: String,
        backtrace: Backtrace,
    },

    /// The per-package index archive itself could not be read as a tar (optionally gzip)
    /// archive.
    #[snafu(display("failed to read package index archive: {source}"))]
    IndexArchive {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// No local root of trust is available and none was supplied to bootstrap the client.
    #[snafu(display("no trusted root metadata is available to start from"))]
    NoTrustedRoot { backtrace: Backtrace },

    /// A key's declared key ID did not match the key ID computed from its own contents.
    #[snafu(display("key ID {keyid} does not match its contents (expected {calculated})"))]
    InvalidKeyId {
        keyid: String,
        calculated: String,
        backtrace: Backtrace,
    },

    /// A root's key table listed the same key ID more than once.
    #[snafu(display("key ID {keyid} appears more than once in the key table"))]
    DuplicateKeyId { keyid: String, backtrace: Backtrace },

    /// The requested logical target path is not present in the index.
    #[snafu(display("target {target_file} was not found in the index"))]
    TargetNotFound {
        target_file: String,
        backtrace: Backtrace,
    },

    /// A trusted root's `roles` table did not name keys/threshold for a role every root must
    /// cover.
    #[snafu(display("root metadata is missing a roles entry for {role}"))]
    MissingRoleKeys {
        role: &'static str,
        backtrace: Backtrace,
    },
}
