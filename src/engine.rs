//! The update engine (spec.md §4.6): orchestrates the check-for-updates protocol -- the ordered
//! download, verification, and caching of root, timestamp, snapshot, and the package index -- and
//! the root-recovery loop that handles verification failure by re-establishing the trust chain.
//!
//! Grounded on `tough::Repository::load` and its `load_root`/`load_timestamp`/`load_snapshot`
//! helper functions, with delegation support removed (this crate's `Targets` has no delegated
//! roles) and the recovery bookkeeping made explicit rather than interleaved with the normal path,
//! since spec.md §4.6 specifies it as its own state (`Recovering`).

use crate::error::{self, Result};
use crate::schema::{FileInfo, Role, RoleType, Root, Signed, Snapshot, Targets, Timestamp};
use crate::transport::{Event, PackageId, RemoteFile, RepositoryTransport};
use crate::trust::{self, Trusted};
use crate::{ExpirationEnforcement, Limits};
use chrono::{DateTime, Utc};
use snafu::OptionExt;
use std::num::NonZeroU64;
use std::path::Path;

fn read_temp(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| error::Error::CacheIo {
        path: path.to_path_buf(),
        source,
        backtrace: snafu::Backtrace::new(),
    })
}

fn cached_version<T>(bytes: &[u8]) -> Option<NonZeroU64>
where
    T: serde::de::DeserializeOwned + Role,
{
    serde_json::from_slice::<Signed<T>>(bytes)
        .ok()
        .map(|s| s.signed.version())
}

/// Whether a failure should trigger root recovery (spec.md §7: "Recovery") rather than propagate
/// to the caller unchanged. Transport errors, and the errors recovery itself raises
/// (`RootUpdateLoop`, `MaxRootHopsExceeded`, `DoubleRecovery`), are deliberately excluded.
fn is_recoverable(err: &error::Error) -> bool {
    matches!(
        err,
        error::Error::ParseError { .. }
            | error::Error::InvalidType { .. }
            | error::Error::SignatureMismatch { .. }
            | error::Error::ExpiredMetadata { .. }
            | error::Error::RollbackAttack { .. }
            | error::Error::LengthMismatch { .. }
            | error::Error::HashMismatch { .. }
            | error::Error::EndlessData { .. }
    )
}

/// Root metadata is always fetched by version-prefixed name during root recovery, regardless of
/// `consistent_snapshot` (TUF's root-update algorithm; see `tough::load_root`).
fn root_filename(version: NonZeroU64) -> String {
    format!("{version}.root.json")
}

fn snapshot_filename(consistent_snapshot: bool, version: NonZeroU64) -> String {
    if consistent_snapshot {
        format!("{version}.snapshot.json")
    } else {
        "snapshot.json".to_string()
    }
}

enum NormalOutcome {
    Done {
        timestamp: Trusted<Timestamp>,
        snapshot: Trusted<Snapshot>,
    },
    NewerRoot {
        new_root: Trusted<Root>,
    },
}

/// A verified, up-to-date view of a repository's root, timestamp, and snapshot metadata, produced
/// by one call to [`Repository::refresh`]. Per-package `targets.json` entries are read lazily from
/// the cached index via [`Repository::fetch_package`].
#[derive(Debug)]
pub struct Repository {
    transport: RepositoryTransport,
    root: Trusted<Root>,
    timestamp: Trusted<Timestamp>,
    snapshot: Trusted<Snapshot>,
    expiration_enforcement: ExpirationEnforcement,
}

impl Repository {
    /// Returns the currently trusted root.
    pub fn root(&self) -> &Trusted<Root> {
        &self.root
    }

    /// Returns the currently trusted timestamp.
    pub fn timestamp(&self) -> &Trusted<Timestamp> {
        &self.timestamp
    }

    /// Returns the currently trusted snapshot.
    pub fn snapshot(&self) -> &Trusted<Snapshot> {
        &self.snapshot
    }

    /// Runs one check-for-updates cycle (spec.md §4.6). Presumes the transport's cache already
    /// holds a trusted root (placed there out-of-band before the first call, or left behind by a
    /// previous call to `refresh`).
    ///
    /// `now` is the instant verification is performed against; callers pass the result of their
    /// own clock read so the monotonic-clock guard (SPEC_FULL B.3) and expiry checks agree on the
    /// same instant.
    pub fn refresh(
        transport: RepositoryTransport,
        limits: Limits,
        expiration_enforcement: ExpirationEnforcement,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        transport.cache().check_monotonic(now)?;

        let root_path = transport.get_cached_root()?;
        let root_bytes = read_temp(&root_path)?;
        let mut root = trust::load_root_anchor(&root_bytes)?;

        let mut hops = 0u32;
        let mut recovered_this_cycle = false;

        loop {
            let expired = expiration_enforcement == ExpirationEnforcement::Safe
                && root.expires <= now;
            let step_result = if expired {
                error::ExpiredMetadataSnafu {
                    role: "root",
                    expires: root.expires,
                }
                .fail()
            } else {
                Self::run_normal_path(&transport, &root, &limits, expiration_enforcement, now)
            };

            match step_result {
                Ok(NormalOutcome::Done { timestamp, snapshot }) => {
                    return Ok(Self {
                        transport,
                        root,
                        timestamp,
                        snapshot,
                        expiration_enforcement,
                    });
                }
                Ok(NormalOutcome::NewerRoot { new_root }) => {
                    hops += 1;
                    snafu::ensure!(
                        hops <= limits.root_hop_bound,
                        error::MaxRootHopsExceededSnafu {
                            max_hops: limits.root_hop_bound,
                        }
                    );
                    transport
                        .cache()
                        .invalidate_on_root_rotation(&root, &new_root)?;
                    transport.log(&Event::RootUpdated {
                        new_version: new_root.version.get(),
                    });
                    root = new_root;
                }
                Err(e) if is_recoverable(&e) => {
                    transport.log(&Event::VerificationError {
                        message: e.to_string(),
                        role: RoleType::Timestamp,
                    });
                    snafu::ensure!(!recovered_this_cycle, error::DoubleRecoverySnafu);
                    recovered_this_cycle = true;
                    root = Self::fetch_newer_root(&transport, &root, &limits, now)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Steps 2-6 of the normal path (spec.md §4.6), presuming `root` is not expired.
    fn run_normal_path(
        transport: &RepositoryTransport,
        root: &Trusted<Root>,
        limits: &Limits,
        expiration_enforcement: ExpirationEnforcement,
        now: DateTime<Utc>,
    ) -> Result<NormalOutcome> {
        // `Unsafe` enforcement asks the trust layer to ignore expiry without changing its
        // signatures (spec.md §4.3 names no enforcement parameter): verifying against the
        // earliest representable instant makes every `expires > verify_now` check trivially
        // true, while leaving version/signature/hash checks, which use `now` nowhere, untouched.
        let verify_now = match expiration_enforcement {
            ExpirationEnforcement::Safe => now,
            ExpirationEnforcement::Unsafe => DateTime::<Utc>::MIN_UTC,
        };

        let cached_timestamp_version = transport
            .cache()
            .read_cached(RoleType::Timestamp)?
            .as_deref()
            .and_then(cached_version::<Timestamp>);

        // Step 2: timestamp, unconditionally.
        let mut timestamp_bytes = None;
        transport.with_remote(
            RemoteFile::RemoteTimestamp {
                max_len: limits.max_timestamp_size,
            },
            |p| {
                timestamp_bytes = Some(read_temp(p)?);
                Ok(())
            },
        )?;
        let timestamp_bytes = timestamp_bytes.expect("callback always runs on Ok");
        let timestamp = trust::verify_timestamp(
            &timestamp_bytes,
            root,
            verify_now,
            cached_timestamp_version,
        )?;
        // Only now is this file known-good; persisting it from `with_remote`'s auto-commit would
        // have raced ahead of the rollback check above (spec.md §4.6 step 2's freeze/rollback
        // checks), letting a rejected timestamp still overwrite the cached version a retry within
        // this same call compares against.
        transport.cache().write_role(RoleType::Timestamp, &timestamp_bytes)?;

        let cached_snapshot_bytes = transport.cache().read_cached(RoleType::Snapshot)?;
        let cached_snapshot_version = cached_snapshot_bytes
            .as_deref()
            .and_then(cached_version::<Snapshot>);

        // Step 3: unchanged repository -- stop after timestamp, without a snapshot round-trip.
        if Some(timestamp.snapshot.version) == cached_snapshot_version {
            let bytes = cached_snapshot_bytes.expect("version matched so bytes are present");
            let snapshot =
                trust::verify_snapshot(&bytes, root, &timestamp.snapshot, verify_now, cached_snapshot_version)?;
            return Ok(NormalOutcome::Done { timestamp, snapshot });
        }

        let cached_index_info = cached_snapshot_bytes
            .as_deref()
            .and_then(|b| serde_json::from_slice::<Signed<Snapshot>>(b).ok())
            .map(|s| s.signed.index);

        // Step 4: download and verify snapshot.
        let path = snapshot_filename(root.consistent_snapshot, timestamp.snapshot.version);
        let mut snapshot_bytes = None;
        transport.with_remote(
            RemoteFile::RemoteSnapshot {
                path,
                len: timestamp.snapshot.file_info.length,
            },
            |p| {
                snapshot_bytes = Some(read_temp(p)?);
                Ok(())
            },
        )?;
        let snapshot_bytes = snapshot_bytes.expect("callback always runs on Ok");
        let snapshot = trust::verify_snapshot(
            &snapshot_bytes,
            root,
            &timestamp.snapshot,
            verify_now,
            cached_snapshot_version,
        )?;

        // Step 5: snapshot references a newer root -- install it and restart from step 2.
        if snapshot.root.version.get() > root.version.get() {
            let path = root_filename(snapshot.root.version);
            let mut new_root_bytes = None;
            transport.with_remote(
                RemoteFile::RemoteRoot {
                    path,
                    max_len: snapshot.root.file_info.length,
                },
                |p| {
                    new_root_bytes = Some(read_temp(p)?);
                    Ok(())
                },
            )?;
            let new_root_bytes = new_root_bytes.expect("callback always runs on Ok");
            let new_root = trust::verify_root(&new_root_bytes, Some(root), verify_now)?;
            // As with timestamp/snapshot, only a verified root is durable: this is the trust
            // anchor `refresh` loads on its next call, and a rejected root must never reach it.
            transport.cache().write_role(RoleType::Root, &new_root_bytes)?;
            return Ok(NormalOutcome::NewerRoot { new_root });
        }

        // Step 6: refresh the index only if its file-info changed.
        if cached_index_info.as_ref() != Some(&snapshot.index) {
            // The fetch ceiling is the smaller of what snapshot asserts and what the caller's
            // policy allows (`Limits::max_targets_size`): a signed-but-outsized index is still
            // something local policy can refuse to download, same as `tough::load_targets`
            // reconciling `targets_meta.length` against its own `max_targets_size` parameter.
            let tar_gz_len = snapshot.index.tar_gz.length.min(limits.max_targets_size);
            let tar_path = snapshot.index.tar.as_ref().map(|_| "00-index.tar".to_string());
            let tar_len = snapshot
                .index
                .tar
                .as_ref()
                .map(|fi| fi.length.min(limits.max_targets_size));
            transport.with_remote(
                RemoteFile::RemoteIndex {
                    tgz_path: "00-index.tar.gz".to_string(),
                    tgz_len: tar_gz_len,
                    tar_path,
                    tar_len,
                },
                |p| {
                    let bytes = read_temp(p)?;
                    let file_info: &FileInfo = if p.extension().is_some_and(|e| e == "gz") {
                        &snapshot.index.tar_gz
                    } else {
                        snapshot.index.tar.as_ref().unwrap_or(&snapshot.index.tar_gz)
                    };
                    file_info.verify("index", &bytes)
                },
            )?;
        }

        // Only now -- after the index has also been verified, not merely the snapshot's own
        // signature -- is this cycle durably "complete". Persisting earlier would let a future
        // call's step-3 short-circuit trust an index that never actually passed step 6.
        transport.cache().write_role(RoleType::Snapshot, &snapshot_bytes)?;

        Ok(NormalOutcome::Done { timestamp, snapshot })
    }

    /// Fetches and installs root versions one at a time, starting from `anchor.version + 1`,
    /// stopping at the first version the repository doesn't have (spec.md §4.6, "Root Recovery"),
    /// bounded by `limits.max_root_updates` total version hops.
    ///
    /// Mirrors `tough::load_root`'s walk, which keeps every intermediate root purely in memory and
    /// only ever writes a role file to its datastore once -- after all of its checks pass, not per
    /// hop. Here that means persisting the cached trust anchor exactly once, at the end of the
    /// walk, rather than after every verified hop: an interrupted multi-hop walk should resume from
    /// the anchor it started with, not from whatever hop happened to verify last.
    fn fetch_newer_root(
        transport: &RepositoryTransport,
        anchor: &Trusted<Root>,
        limits: &Limits,
        now: DateTime<Utc>,
    ) -> Result<Trusted<Root>> {
        let original_version = anchor.version.get();
        let mut current = anchor.clone();
        let mut current_bytes: Option<Vec<u8>> = None;

        loop {
            snafu::ensure!(
                current.version.get() < original_version + limits.max_root_updates,
                error::RootUpdateLoopSnafu {
                    from_version: original_version,
                }
            );

            let next_version =
                NonZeroU64::new(current.version.get() + 1).expect("version + 1 is never zero");
            let path = root_filename(next_version);

            let mut new_root_bytes = None;
            let fetch_result = transport.with_remote(
                RemoteFile::RemoteRoot {
                    path,
                    max_len: limits.max_root_size,
                },
                |p| {
                    new_root_bytes = Some(read_temp(p)?);
                    Ok(())
                },
            );

            match fetch_result {
                Err(_) => break,
                Ok(()) => {
                    let bytes = new_root_bytes.expect("callback always runs on Ok");
                    let next = trust::verify_root(&bytes, Some(&current), now)?;
                    if next.version.get() == current.version.get() {
                        break;
                    }
                    current = next;
                    current_bytes = Some(bytes);
                }
            }
        }

        if let Some(bytes) = current_bytes {
            transport.cache().write_role(RoleType::Root, &bytes)?;
        }
        Ok(current)
    }

    /// Looks up a package's `targets.json` entry in the cached index and verifies it against
    /// `file_info` (spec.md §4.3 `verify_targets`; §4.6 step 7: per-package metadata is read
    /// lazily, not eagerly fetched).
    pub fn load_targets(
        &self,
        package: &PackageId,
        file_info: &FileInfo,
        now: DateTime<Utc>,
    ) -> Result<Trusted<Targets>> {
        let targets_path = package.targets_path()?;
        let bytes = self
            .transport
            .read_from_index(&targets_path)?
            .context(error::PackageNotInIndexSnafu {
                package_id: format!("{}-{}", package.name, package.version),
            })?;
        let verify_now = match self.expiration_enforcement {
            ExpirationEnforcement::Safe => now,
            ExpirationEnforcement::Unsafe => DateTime::<Utc>::MIN_UTC,
        };
        trust::verify_targets(&bytes, &self.root, file_info, verify_now)
    }

    /// Opens a streaming, hash- and length-verifying reader over a package tarball (SPEC_FULL
    /// B.5; mirrors `tough::Repository::read_target`). The reader raises an I/O error the moment
    /// the stream exceeds `file_info.length` or, at end-of-stream, if any recognized digest in
    /// `file_info.hashes` doesn't match -- callers must not act on data read after an error.
    pub fn fetch_package(
        &self,
        package: &PackageId,
        file_info: &FileInfo,
    ) -> Result<impl std::io::Read + '_> {
        let has_recognized = file_info
            .hashes
            .keys()
            .any(|k| crate::crypto::HashAlgorithm::from_key(k).is_some());
        snafu::ensure!(
            has_recognized,
            error::UnknownHashAlgorithmSnafu {
                found: file_info.hashes.keys().cloned().collect::<Vec<_>>(),
            }
        );
        let path = package.tarball_path()?;
        let raw = self.transport.fetch_target_stream(&path, file_info.length)?;
        Ok(VerifiedTargetReader::new(raw, file_info.clone(), "package"))
    }
}

/// Wraps a raw (already length-bounded) byte stream, accumulating a digest per recognized hash
/// algorithm in `file_info.hashes` and comparing against the expected value at end-of-stream.
/// Grounded on `tough::io::DigestAdapter`'s streaming-verify-at-EOF shape, rewritten as a
/// synchronous `Read` adapter.
struct VerifiedTargetReader<R> {
    inner: R,
    file_info: FileInfo,
    role: &'static str,
    digests: Vec<crate::crypto::StreamingDigest>,
    bytes_read: u64,
    finished: bool,
}

impl<R: std::io::Read> VerifiedTargetReader<R> {
    fn new(inner: R, file_info: FileInfo, role: &'static str) -> Self {
        let digests = file_info
            .hashes
            .keys()
            .filter_map(|k| crate::crypto::HashAlgorithm::from_key(k))
            .map(crate::crypto::StreamingDigest::new)
            .collect();
        Self {
            inner,
            file_info,
            role,
            digests,
            bytes_read: 0,
            finished: false,
        }
    }

    fn algorithm_key(algorithm: crate::crypto::HashAlgorithm) -> &'static str {
        match algorithm {
            crate::crypto::HashAlgorithm::Sha256 => "sha256",
            crate::crypto::HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl<R: std::io::Read> std::io::Read for VerifiedTargetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finished = true;
            error::ensure_length_matches(self.role, self.file_info.length, self.bytes_read)
                .map_err(std::io::Error::other)?;
            for digest in self.digests.drain(..) {
                let key = Self::algorithm_key(digest.algorithm());
                if let Some(expected) = self.file_info.hashes.get(key) {
                    let calculated = digest.finish();
                    if calculated != expected.as_ref() {
                        return Err(std::io::Error::other(error::Error::HashMismatch {
                            role: self.role.to_string(),
                            expected: hex::encode(expected.as_ref()),
                            calculated: hex::encode(&calculated),
                            backtrace: snafu::Backtrace::new(),
                        }));
                    }
                }
            }
            return Ok(0);
        }
        self.bytes_read += n as u64;
        for digest in &mut self.digests {
            digest.update(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Read as _;

    fn file_info_for(bytes: &[u8]) -> FileInfo {
        let digest = crate::crypto::digest_bytes(crate::crypto::HashAlgorithm::Sha256, bytes);
        let mut hashes = std::collections::HashMap::new();
        hashes.insert(
            "sha256".to_string(),
            crate::schema::decoded::Decoded::from(digest),
        );
        FileInfo {
            length: bytes.len() as u64,
            hashes,
            _extra: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn verified_target_reader_passes_through_matching_bytes() {
        let data = b"a small package tarball".to_vec();
        let file_info = file_info_for(&data);
        let mut reader = VerifiedTargetReader::new(Cursor::new(data.clone()), file_info, "package");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn verified_target_reader_detects_tampering() {
        let data = b"a small package tarball".to_vec();
        let file_info = file_info_for(&data);
        let mut tampered = data.clone();
        tampered[0] ^= 0xFF;
        let mut reader = VerifiedTargetReader::new(Cursor::new(tampered), file_info, "package");
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
