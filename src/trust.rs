//! The trust layer (spec.md §4.3): a handful of verification constructors that are the only way
//! to produce a `Trusted<T>`. Everywhere else in this crate, a function that needs a role's
//! payload takes `&Trusted<T>` rather than `&T`, so the type system -- not code review -- is what
//! prevents an unverified document from reaching the update engine's decision logic.

use crate::error::{self, Result};
use crate::schema::key::Key;
use crate::schema::{self, FileInfo, Root, RoleType, Signed, Snapshot, Targets, Timestamp};
use chrono::{DateTime, Utc};
use snafu::OptionExt;
use std::num::NonZeroU64;

/// A value that has passed this crate's verification for its role: valid threshold signatures,
/// unexpired, and version-consistent with whatever was previously trusted. `Trusted<T>` cannot be
/// constructed outside this module.
#[derive(Debug, Clone, PartialEq)]
pub struct Trusted<T>(T);

impl<T> Trusted<T> {
    fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrows the verified payload.
    pub fn get(&self) -> &T {
        &self.0
    }

    /// Consumes the wrapper, returning the verified payload.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Trusted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

fn role_keys<'a>(root: &'a Root, role: RoleType) -> Result<&'a schema::RoleKeys> {
    root.role_keys(role)
        .context(error::MissingRoleKeysSnafu { role: role.as_str() })
}

fn ensure_not_expired(role: RoleType, expires: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    snafu::ensure!(
        expires > now,
        error::ExpiredMetadataSnafu {
            role: role.as_str(),
            expires,
        }
    );
    Ok(())
}

fn ensure_version_not_rolled_back(
    role: RoleType,
    cached: Option<NonZeroU64>,
    new: NonZeroU64,
) -> Result<()> {
    if let Some(cached) = cached {
        snafu::ensure!(
            new >= cached,
            error::RollbackAttackSnafu {
                role: role.as_str(),
                cached_version: cached.get(),
                new_version: new.get(),
            }
        );
    }
    Ok(())
}

/// Loads a previously-cached `root.json` as a trust anchor, checking only its own signature
/// threshold -- not expiry, and not a chain-of-custody check against any prior root, since none
/// is available yet. Used solely to seed the update engine's root-recovery walk (spec.md §4.6
/// step 1: "load cached root... if expired, go to Root Recovery"): the cached root's key bindings
/// remain usable to vouch for its successor even after the cached root itself has expired.
pub(crate) fn load_root_anchor(raw: &[u8]) -> Result<Trusted<Root>> {
    let untrusted: Signed<Root> = schema::parse_role(RoleType::Root, raw)?;
    let own_keys = role_keys(&untrusted.signed, RoleType::Root)?;
    crate::schema::verify::verify_signatures(&untrusted, own_keys, &untrusted.signed.keys)?;
    Ok(Trusted::new(untrusted.signed))
}

/// Verifies a freshly downloaded `root.json`.
///
/// If `old` is `Some`, `raw` must be signed by *both* the old root's root-role threshold and its
/// own declared root-role threshold (TUF's self-consistent root chain rule: a root can only be
/// replaced by a root that the previous root's keys themselves vouch for). If `old` is `None`,
/// this is the very first trust bootstrap and only the new root's own threshold applies.
pub fn verify_root(
    raw: &[u8],
    old: Option<&Trusted<Root>>,
    now: DateTime<Utc>,
) -> Result<Trusted<Root>> {
    let untrusted: Signed<Root> = schema::parse_role(RoleType::Root, raw)?;

    let own_keys = role_keys(&untrusted.signed, RoleType::Root)?;
    crate::schema::verify::verify_signatures(&untrusted, own_keys, &untrusted.signed.keys)?;

    if let Some(old) = old {
        let old_keys = role_keys(old.get(), RoleType::Root)?;
        crate::schema::verify::verify_signatures(&untrusted, old_keys, &old.get().keys)?;
        ensure_version_not_rolled_back(RoleType::Root, Some(old.get().version), untrusted.signed.version)?;
    }

    ensure_not_expired(RoleType::Root, untrusted.signed.expires, now)?;

    Ok(Trusted::new(untrusted.signed))
}

/// Verifies a freshly downloaded `timestamp.json` against the currently trusted root.
pub fn verify_timestamp(
    raw: &[u8],
    trusted_root: &Trusted<Root>,
    now: DateTime<Utc>,
    cached_version: Option<NonZeroU64>,
) -> Result<Trusted<Timestamp>> {
    let untrusted: Signed<Timestamp> = schema::parse_role(RoleType::Timestamp, raw)?;

    let keys = role_keys(trusted_root.get(), RoleType::Timestamp)?;
    crate::schema::verify::verify_signatures(&untrusted, keys, &trusted_root.get().keys)?;

    ensure_not_expired(RoleType::Timestamp, untrusted.signed.expires, now)?;
    ensure_version_not_rolled_back(RoleType::Timestamp, cached_version, untrusted.signed.version)?;

    Ok(Trusted::new(untrusted.signed))
}

/// Verifies a freshly downloaded `snapshot.json` against the currently trusted root and the
/// file-info for it asserted by the currently trusted timestamp.
pub fn verify_snapshot(
    raw: &[u8],
    trusted_root: &Trusted<Root>,
    trusted_snapshot_info: &schema::VersionedFileInfo,
    now: DateTime<Utc>,
    cached_version: Option<NonZeroU64>,
) -> Result<Trusted<Snapshot>> {
    trusted_snapshot_info.file_info.verify("snapshot", raw)?;

    let untrusted: Signed<Snapshot> = schema::parse_role(RoleType::Snapshot, raw)?;

    let keys = role_keys(trusted_root.get(), RoleType::Snapshot)?;
    crate::schema::verify::verify_signatures(&untrusted, keys, &trusted_root.get().keys)?;

    ensure_not_expired(RoleType::Snapshot, untrusted.signed.expires, now)?;
    ensure_version_not_rolled_back(RoleType::Snapshot, cached_version, untrusted.signed.version)?;

    Ok(Trusted::new(untrusted.signed))
}

/// Verifies a `targets.json` entry extracted from the package index against the currently trusted
/// root and the file-info the caller obtained for it (from `snapshot.json`, or, for per-package
/// metadata not named there, from whatever binding source the embedding application trusts).
pub fn verify_targets(
    raw: &[u8],
    trusted_root: &Trusted<Root>,
    trusted_file_info: &FileInfo,
    now: DateTime<Utc>,
) -> Result<Trusted<Targets>> {
    trusted_file_info.verify("targets", raw)?;

    let untrusted: Signed<Targets> = schema::parse_role(RoleType::Targets, raw)?;

    let keys = role_keys(trusted_root.get(), RoleType::Targets)?;
    crate::schema::verify::verify_signatures(&untrusted, keys, &trusted_root.get().keys)?;

    ensure_not_expired(RoleType::Targets, untrusted.signed.expires, now)?;

    Ok(Trusted::new(untrusted.signed))
}

/// Computes the key ID a verified key would carry, re-exported here so callers building root
/// chains in tests don't need to reach into `crate::crypto` directly.
pub fn key_id(key: &Key) -> Result<Vec<u8>> {
    crate::crypto::key_id(key)
}
